// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The RPC core: owns every socket, the connection slab, the log file, and the two cross-thread
//! queues. [`RpcCore`] is the single point of contact between the reactor thread (which calls
//! [`RpcCore::run`]/[`RpcCore::poll`]) and everything else: worker threads pull requests off
//! [`RpcCore::request_queue`] and push responses through [`RpcCore::response_send`] or by
//! enqueuing directly onto [`RpcCore::response_queue`] (the two are equivalent; a
//! [`crate::dispatcher::Dispatcher`] uses the latter so it never has to hold an `RpcCore`
//! reference at all, keeping the reactor and the dispatcher connected only through the queues).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::Error;
use crate::queue::Queue;
use crate::reactor::{PendingEvent, Poller, Readiness, Registration};
use crate::slab::Slab;
use crate::wire::{self, Request, Response, Val};

/// Number of response-queue entries drained per idle-timer tick.
pub const DEFAULT_OUTBAND_DRAIN: usize = 100;

/// Linger period, in milliseconds, a connection is kept open after its reply has been fully
/// written before the reactor force-closes it.
pub const DEFAULT_LINGER_MS: u64 = 15_000;

/// Initial connection-slab page size.
pub const DEFAULT_RESERVE_MEMPOOL: usize = 50;

/// Opaque handle a worker thread carries between the request and response queues. Never
/// dereferences a connection; backed by [`crate::slab`]'s generation-counted
/// [`crate::slab::Token`].
pub type ConnToken = crate::slab::Token;

/// One parsed request, handed from the reactor to a worker through [`RpcCore::request_queue`].
pub struct RequestEnvelope {
    pub token: ConnToken,
    pub raw: Vec<u8>,
}

/// One outcome handed from a worker back to the reactor through [`RpcCore::response_queue`].
pub enum ResponseEnvelope {
    /// A function call completed; serialize `response` and write it back on `token`'s
    /// connection.
    Reply { token: ConnToken, response: Response },
    /// The request on `token` failed to parse; close the connection after a short linger.
    ParseError { token: ConnToken },
    /// A notification finished; close the connection without writing a reply.
    Done { token: ConnToken },
    /// A line for the operator-facing log file, with no associated connection.
    Log(String),
}

/// Per-connection state machine stage. Transitions are strictly forward except the terminal
/// [`Stage::ConnectionFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    PendingRequest,
    ExecuteRpc,
    PendingReply,
    ConnectionFailed,
}

/// Distinguishes a connection accepted by the listener (server side) from one opened by
/// [`RpcCore::call_async`] (client side). Both share the same read/write buffering and reactor
/// plumbing; only the interpretation of a completed frame differs.
enum Role {
    Server,
    Client {
        connected: bool,
        callback: Option<Box<dyn FnOnce(Result<Response, Error>) + Send>>,
    },
}

struct Connection {
    stream: TcpStream,
    pending: PendingEvent,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    out_pos: usize,
    /// Milliseconds remaining before a [`PendingEvent::TIMEOUT`] fires. `None` means no timer is
    /// armed on this connection.
    timeout_ms: Option<u64>,
    stage: Stage,
    role: Role,
}

impl Connection {
    fn new_server(stream: TcpStream) -> Self {
        Connection {
            stream,
            pending: PendingEvent::READ,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            timeout_ms: None,
            stage: Stage::PendingRequest,
            role: Role::Server,
        }
    }

    fn new_client(
        stream: TcpStream,
        request_bytes: Vec<u8>,
        timeout_ms: u64,
        callback: Box<dyn FnOnce(Result<Response, Error>) + Send>,
    ) -> Self {
        Connection {
            stream,
            pending: PendingEvent::CONNECT | PendingEvent::TIMEOUT,
            in_buf: Vec::new(),
            out_buf: request_bytes,
            out_pos: 0,
            timeout_ms: Some(timeout_ms),
            stage: Stage::PendingRequest,
            role: Role::Client {
                connected: false,
                callback: Some(callback),
            },
        }
    }

    /// Arms the post-reply linger: keep watching for the peer to go away (or the timer to
    /// expire), then close.
    fn arm_linger(&mut self, linger_ms: u64) {
        self.pending = PendingEvent::LINGER | PendingEvent::TIMEOUT;
        self.timeout_ms = Some(linger_ms);
    }

    fn arm_close(&mut self) {
        self.pending = PendingEvent::CLOSE;
    }

    /// Drains as much as is available into `in_buf`. Returns `Ok(true)` on a clean EOF.
    fn fill_in_buf(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.in_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much of `out_buf[out_pos..]` as the socket will accept. Returns `true` once
    /// every byte has been written.
    fn drain_out_buf(&mut self) -> io::Result<bool> {
        while self.out_pos < self.out_buf.len() {
            match self.stream.write(&self.out_buf[self.out_pos..]) {
                Ok(0) => return Ok(false),
                Ok(n) => self.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

struct ReactorState {
    listener: TcpListener,
    control: UdpSocket,
    log_file: File,
    connections: Slab<Connection>,
    poller: Poller,
    idle_remaining_ms: u64,
}

/// Result of one [`RpcCore::poll`] tick or a full [`RpcCore::run`] call. The error case is
/// carried by `Result::Err` instead of a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Progressed,
    Interrupted,
}

/// Owns the reactor, the connection slab, the log file, and the two queues that bridge it to
/// worker threads. One `RpcCore` corresponds to one [`RpcCore::init`]/[`RpcCore::shutdown`]
/// pair; callers typically hold it in an `Arc` so both a dispatcher and a signal handler can
/// reach it.
pub struct RpcCore {
    reactor: Mutex<ReactorState>,
    request_queue: Arc<Queue<RequestEnvelope>>,
    response_queue: Arc<Queue<ResponseEnvelope>>,
    waker: UdpSocket,
    waker_addr: SocketAddr,
    poll_interval_ms: u64,
    linger_ms: u64,
    outband_drain: usize,
}

static ACTIVE_CORE_PTR: AtomicPtr<RpcCore> = AtomicPtr::new(std::ptr::null_mut());

/// A raw-pointer stand-in for a weak reference guarded by an atomic flag: signal handlers
/// cannot safely touch an `Arc`'s refcount, so instead we publish a non-owning pointer that
/// [`RpcCore::shutdown`] clears before the last `Arc` can be dropped.
fn install_signal_handlers(core: &Arc<RpcCore>) {
    let raw = Arc::as_ptr(core) as *mut RpcCore;
    ACTIVE_CORE_PTR.store(raw, Ordering::Release);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }
}

extern "C" fn handle_signal(_sig: libc::c_int) {
    let ptr = ACTIVE_CORE_PTR.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` was published by `install_signal_handlers` from a live `Arc<RpcCore>` and
    // is cleared by `RpcCore::shutdown` before that `Arc`'s last reference can be dropped, so
    // any signal delivered while this pointer is non-null observes a still-live `RpcCore`.
    // `interrupt` itself only sends a UDP datagram, which is safe to call from a signal handler.
    let core = unsafe { &*ptr };
    core.interrupt();
}

impl RpcCore {
    /// Opens the log file, binds the listen socket and an internal wake-up control socket, and
    /// installs `SIGINT`/`SIGTERM` handlers that call [`RpcCore::interrupt`], §6 `init`). Returns `Err` if `listen_addr` cannot be bound or the log
    /// file cannot be opened for append.
    pub fn init(
        log_path: impl AsRef<Path>,
        listen_addr: impl ToSocketAddrs,
        poll_interval_ms: u64,
    ) -> Result<Arc<Self>, Error> {
        let listener = TcpListener::bind(listen_addr)
            .map_err(|e| Error::InvalidConfig(format!("cannot bind listen address: {e}")))?;
        listener.set_nonblocking(true)?;

        let control = UdpSocket::bind("127.0.0.1:0")?;
        control.set_nonblocking(true)?;
        let waker = control.try_clone()?;
        let waker_addr = control.local_addr()?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path.as_ref())
            .map_err(|e| {
                Error::InvalidConfig(format!("cannot open log file {:?}: {e}", log_path.as_ref()))
            })?;

        let core = Arc::new(RpcCore {
            reactor: Mutex::new(ReactorState {
                listener,
                control,
                log_file,
                connections: Slab::with_capacity(DEFAULT_RESERVE_MEMPOOL),
                poller: Poller::new(),
                idle_remaining_ms: poll_interval_ms,
            }),
            request_queue: Arc::new(Queue::new()),
            response_queue: Arc::new(Queue::new()),
            waker,
            waker_addr,
            poll_interval_ms: poll_interval_ms.max(1),
            linger_ms: DEFAULT_LINGER_MS,
            outband_drain: DEFAULT_OUTBAND_DRAIN,
        });
        install_signal_handlers(&core);
        Ok(core)
    }

    /// The address the listen socket is actually bound to, useful when [`RpcCore::init`] was
    /// given a port of `0` and the caller needs to learn which one the OS picked (e.g. in
    /// tests).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.reactor.lock().unwrap().listener.local_addr()
    }

    /// The request queue workers pull from. Shared with [`crate::dispatcher::Dispatcher`].
    pub fn request_queue(&self) -> Arc<Queue<RequestEnvelope>> {
        Arc::clone(&self.request_queue)
    }

    /// The response queue workers push onto. Shared with [`crate::dispatcher::Dispatcher`].
    pub fn response_queue(&self) -> Arc<Queue<ResponseEnvelope>> {
        Arc::clone(&self.response_queue)
    }

    /// Blocks until a request is available. Returns `None` if the queue was woken (the reactor
    /// is shutting down) instead of yielding a request.
    pub fn request_recv(&self) -> Option<RequestEnvelope> {
        match self.request_queue.dequeue_blocking() {
            crate::queue::Dequeued::Item(req) => Some(req),
            crate::queue::Dequeued::Woken => None,
        }
    }

    /// Non-blocking counterpart of [`RpcCore::request_recv`].
    pub fn request_try_recv(&self) -> Option<RequestEnvelope> {
        self.request_queue.dequeue_try()
    }

    /// Builds a response frame for `request` and hands it to the reactor for serialization and
    /// write-back. `error_code` of `0` means success; `result` is
    /// dropped for any other code, matching the wire rule that a result is present iff
    /// `error_code == 0`.
    pub fn response_send(&self, request: &Request, token: ConnToken, result: Option<Val>, error_code: i32) {
        let response = Response {
            method_type: wire::MethodType::Function,
            xid: request.xid,
            method_name: request.method_name.clone(),
            error_code,
            result: if error_code == 0 { result } else { None },
        };
        self.response_queue
            .enqueue(ResponseEnvelope::Reply { token, response });
    }

    /// Signals that a notification's handling is complete; the reactor closes the connection
    /// without writing a reply.
    pub fn response_done(&self, token: ConnToken) {
        self.response_queue.enqueue(ResponseEnvelope::Done { token });
    }

    /// Enqueues a line for the reactor to append to the log file opened by [`RpcCore::init`].
    /// Thread-safe; callable from any worker.
    pub fn write_log(&self, line: impl Into<String>) {
        self.response_queue.enqueue(ResponseEnvelope::Log(line.into()));
    }

    /// Asynchronous, non-blocking request: opens a connection via the
    /// reactor, writes the serialized request once connected, and invokes `callback` from the
    /// reactor thread with the parsed response (or an error, including timeout). Must be called
    /// after a thread is already driving [`RpcCore::run`]/[`RpcCore::poll`]; the connection is
    /// otherwise never serviced.
    pub fn call_async(
        &self,
        addr: impl ToSocketAddrs,
        method_type: wire::MethodType,
        method_name: &str,
        params: Vec<Val>,
        timeout_ms: u64,
        callback: impl FnOnce(Result<Response, Error>) + Send + 'static,
    ) -> Result<(), Error> {
        let xid = generate_xid();
        let request = Request {
            method_type,
            xid,
            method_name: method_name.to_string(),
            params,
        };
        let bytes = wire::encode_request(&request);

        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidConfig("no resolvable address".to_string()))?;
        let stream = connect_nonblocking(addr)?;

        let conn = Connection::new_client(stream, bytes, timeout_ms, Box::new(callback));
        let mut state = self.reactor.lock().unwrap();
        state.connections.alloc(conn);
        Ok(())
    }

    /// Runs a single reactor tick: poll for readiness, service every ready connection, drain the
    /// idle timer if it has expired. Returns [`Outcome::Interrupted`] if [`RpcCore::interrupt`]
    /// fired during this tick.
    pub fn poll(&self, max_wait: Option<Duration>) -> Result<Outcome, Error> {
        let mut state = self.reactor.lock().unwrap();
        let tokens: Vec<ConnToken> = state.connections.iter().map(|(t, _)| t).collect();

        let mut regs = Vec::with_capacity(2 + tokens.len());
        regs.push(Registration {
            fd: state.listener.as_raw_fd(),
            read: true,
            write: false,
        });
        regs.push(Registration {
            fd: state.control.as_raw_fd(),
            read: true,
            write: false,
        });
        let mut wait_ms = max_wait
            .map(|d| d.as_millis() as u64)
            .unwrap_or(self.poll_interval_ms)
            .min(state.idle_remaining_ms.max(1));
        for &token in &tokens {
            let conn = state.connections.get(token).expect("token from fresh iteration");
            regs.push(Registration {
                fd: conn.stream.as_raw_fd(),
                read: conn.pending.contains(PendingEvent::READ) || conn.pending.contains(PendingEvent::LINGER),
                write: conn.pending.contains(PendingEvent::WRITE)
                    || conn.pending.contains(PendingEvent::CONNECT),
            });
            if let Some(tm) = conn.timeout_ms {
                wait_ms = wait_ms.min(tm.max(1));
            }
        }

        let tick_start = Instant::now();
        let readiness = state.poller.poll(&regs, Some(Duration::from_millis(wait_ms)))?;
        let elapsed_ms = tick_start.elapsed().as_millis() as u64;

        let mut interrupted = false;
        if readiness[0].readable {
            self.accept_connections(&mut state);
        }
        if readiness[1].readable {
            interrupted = self.drain_control_socket(&mut state);
        }

        for (i, &token) in tokens.iter().enumerate() {
            let r = readiness[i + 2];
            self.service_connection(&mut state, token, r, elapsed_ms);
        }

        state.idle_remaining_ms = state.idle_remaining_ms.saturating_sub(elapsed_ms);
        if state.idle_remaining_ms == 0 {
            state.idle_remaining_ms = self.poll_interval_ms;
            self.drain_response_queue(&mut state);
        }

        self.reclaim(&mut state);

        Ok(if interrupted {
            Outcome::Interrupted
        } else {
            Outcome::Progressed
        })
    }

    /// Runs [`RpcCore::poll`] in a loop until it reports [`Outcome::Interrupted`] or returns an
    /// error.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            if self.poll(Some(Duration::from_millis(self.poll_interval_ms)))? == Outcome::Interrupted {
                return Ok(());
            }
        }
    }

    /// Asynchronous, safe-from-a-signal-handler wakeup: sends a datagram to the control socket,
    /// causing the in-progress (or next) `poll(2)` call to return.
    pub fn interrupt(&self) {
        let _ = self.waker.send_to(&[0u8], self.waker_addr);
    }

    /// Symmetric teardown of [`RpcCore::init`]: clears the signal-handler
    /// pointer, closes every live connection, and flushes the log file. Idempotent; safe to call
    /// after `run` has returned from an interruption. Does not itself stop a running reactor.
    pub fn shutdown(self: &Arc<Self>) {
        let self_ptr = Arc::as_ptr(self) as *mut RpcCore;
        let _ = ACTIVE_CORE_PTR.compare_exchange(
            self_ptr,
            std::ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let mut state = self.reactor.lock().unwrap();
        let tokens: Vec<ConnToken> = state.connections.iter().map(|(t, _)| t).collect();
        for token in tokens {
            state.connections.free(token);
        }
        let _ = state.log_file.flush();
    }

    fn accept_connections(&self, state: &mut ReactorState) {
        loop {
            match state.listener.accept() {
                Ok((stream, peer)) => {
                    trace!("accepted connection from {peer}");
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("failed to set accepted socket non-blocking: {e}");
                        continue;
                    }
                    state.connections.alloc(Connection::new_server(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Drains every pending datagram on the control socket. Returns `true` if at least one was
    /// seen, i.e. [`RpcCore::interrupt`] fired during this tick.
    fn drain_control_socket(&self, state: &mut ReactorState) -> bool {
        let mut buf = [0u8; 64];
        let mut saw_any = false;
        loop {
            match state.control.recv_from(&mut buf) {
                Ok(_) => saw_any = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        saw_any
    }

    fn service_connection(&self, state: &mut ReactorState, token: ConnToken, r: Readiness, elapsed_ms: u64) {
        let Some(conn) = state.connections.get_mut(token) else {
            return;
        };
        if let Some(tm) = conn.timeout_ms.as_mut() {
            *tm = tm.saturating_sub(elapsed_ms);
        }

        if r.error {
            conn.stage = Stage::ConnectionFailed;
            conn.arm_close();
            return;
        }

        match conn.role {
            Role::Server => self.service_server(conn, r, token),
            Role::Client { .. } => self.service_client(conn, r),
        }

        if conn.pending.contains(PendingEvent::TIMEOUT) && conn.timeout_ms == Some(0) {
            self.fire_timeout(conn);
        }
    }

    fn service_server(&self, conn: &mut Connection, r: Readiness, token: ConnToken) {
        match conn.stage {
            Stage::PendingRequest => {
                if !r.readable {
                    return;
                }
                match conn.fill_in_buf() {
                    Ok(eof) => {
                        self.try_parse_request(conn, token);
                        // `try_parse_request` only returns without arming anything when it is
                        // still waiting on more bytes (pending stays READ); a clean EOF at that
                        // point (full or partial frame, possibly none at all) means the peer
                        // will never send the rest, so the record must be destroyed here rather
                        // than left spinning on a socket that is now always ready and empty.
                        if eof && conn.pending.contains(PendingEvent::READ) {
                            conn.arm_close();
                        }
                    }
                    Err(e) => {
                        warn!("read error on connection: {e}");
                        conn.arm_close();
                    }
                }
            }
            Stage::ExecuteRpc => {
                // A peer read while a worker has the request is unexpected; the only event we
                // actually watch for here is the idle timer draining the response queue, which
                // does not go through `service_connection` at all.
                if r.readable {
                    conn.stage = Stage::ConnectionFailed;
                    conn.arm_close();
                }
            }
            Stage::PendingReply => {
                if r.readable {
                    // unexpected peer read while a reply is pending means the peer hung up early.
                    conn.stage = Stage::ConnectionFailed;
                    conn.arm_close();
                    return;
                }
                if r.writable {
                    match conn.drain_out_buf() {
                        Ok(true) => conn.arm_linger(self.linger_ms),
                        Ok(false) => {}
                        Err(e) => {
                            warn!("write error on connection: {e}");
                            conn.arm_close();
                        }
                    }
                }
            }
            Stage::ConnectionFailed => conn.arm_close(),
        }
    }

    fn try_parse_request(&self, conn: &mut Connection, token: ConnToken) {
        let want = match wire::get_package_size(&conn.in_buf) {
            Ok(Some(len)) => len,
            Ok(None) => return, // need more bytes
            Err(e) => {
                warn!("malformed frame header: {e}");
                conn.arm_close();
                return;
            }
        };
        if conn.in_buf.len() < want {
            return; // need more bytes
        }
        if conn.in_buf.len() > want {
            warn!("trailing bytes after frame");
            conn.arm_close();
            return;
        }

        let raw = std::mem::take(&mut conn.in_buf);
        // Validate eagerly so a malformed frame is logged and the connection closed even if no
        // worker ever looks at it; the dispatcher independently rejects malformed requests too.
        if let Err(e) = wire::decode_request(&raw) {
            warn!("dropping malformed request: {e}");
            conn.arm_linger(self.linger_ms);
            return;
        }
        self.request_queue.enqueue(RequestEnvelope { token, raw });
        conn.pending = PendingEvent::IDLE;
        conn.stage = Stage::ExecuteRpc;
    }

    fn service_client(&self, conn: &mut Connection, r: Readiness) {
        let already_connected = matches!(conn.role, Role::Client { connected: true, .. });

        if !already_connected {
            if !r.writable {
                return;
            }
            let connect_err = match conn.stream.take_error() {
                Ok(None) => None,
                Ok(Some(e)) => Some(e),
                Err(e) => Some(e),
            };
            if let Some(e) = connect_err {
                Self::finish_client(conn, Err(Error::Io(e)));
                return;
            }
            if let Role::Client { connected, .. } = &mut conn.role {
                *connected = true;
            }
            conn.pending = PendingEvent::WRITE | PendingEvent::TIMEOUT;
        }

        if conn.out_pos < conn.out_buf.len() {
            match conn.drain_out_buf() {
                Ok(true) => {
                    conn.out_buf.clear();
                    conn.out_pos = 0;
                    conn.pending = PendingEvent::READ | PendingEvent::TIMEOUT;
                }
                Ok(false) => return,
                Err(e) => {
                    Self::finish_client(conn, Err(Error::Io(e)));
                    return;
                }
            }
        }

        if !r.readable {
            return;
        }
        match conn.fill_in_buf() {
            Ok(true) if conn.in_buf.is_empty() => {
                Self::finish_client(conn, Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof))));
            }
            Ok(_) => {
                let want = match wire::get_package_size(&conn.in_buf) {
                    Ok(Some(len)) => len,
                    Ok(None) => return,
                    Err(e) => {
                        Self::finish_client(conn, Err(Error::Protocol(e)));
                        return;
                    }
                };
                if conn.in_buf.len() < want {
                    return;
                }
                let result = wire::decode_response(&conn.in_buf[..want]).map_err(Error::Protocol);
                Self::finish_client(conn, result);
            }
            Err(e) => Self::finish_client(conn, Err(Error::Io(e))),
        }
    }

    /// Invokes a client connection's callback (if not already consumed) with its final result
    /// and arms the connection for close. Factored out because every exit path of
    /// [`RpcCore::service_client`] and [`RpcCore::fire_timeout`] needs to do exactly this.
    fn finish_client(conn: &mut Connection, result: Result<Response, Error>) {
        if let Role::Client { callback, .. } = &mut conn.role {
            if let Some(cb) = callback.take() {
                cb(result);
            }
        }
        conn.arm_close();
    }

    fn fire_timeout(&self, conn: &mut Connection) {
        debug!("connection timer fired");
        Self::finish_client(conn, Err(Error::Io(io::Error::from(io::ErrorKind::TimedOut))));
    }

    fn drain_response_queue(&self, state: &mut ReactorState) {
        for _ in 0..self.outband_drain {
            let Some(envelope) = self.response_queue.dequeue_try() else {
                break;
            };
            match envelope {
                ResponseEnvelope::Reply { token, response } => {
                    match state.connections.get_mut(token) {
                        Some(conn) if conn.stage == Stage::ExecuteRpc => {
                            let bytes = wire::encode_response(&response);
                            conn.out_buf.extend_from_slice(&bytes);
                            conn.pending = PendingEvent::WRITE;
                            conn.stage = Stage::PendingReply;
                        }
                        Some(_) | None => {
                            warn!("dropping response for a connection no longer awaiting one");
                        }
                    }
                }
                ResponseEnvelope::ParseError { token } => {
                    if let Some(conn) = state.connections.get_mut(token) {
                        conn.stage = Stage::ConnectionFailed;
                        conn.arm_linger(self.linger_ms);
                    }
                }
                ResponseEnvelope::Done { token } => {
                    if let Some(conn) = state.connections.get_mut(token) {
                        conn.arm_close();
                    }
                }
                ResponseEnvelope::Log(line) => {
                    if let Err(e) = writeln!(state.log_file, "{line}") {
                        warn!("failed to write log line: {e}");
                    }
                    let _ = state.log_file.flush();
                }
            }
        }
    }

    fn reclaim(&self, state: &mut ReactorState) {
        let to_close: Vec<ConnToken> = state
            .connections
            .iter()
            .filter(|(_, c)| {
                c.pending.contains(PendingEvent::CLOSE)
                    || (c.pending.contains(PendingEvent::LINGER) && c.timeout_ms == Some(0))
            })
            .map(|(t, _)| t)
            .collect();
        for token in to_close {
            if let Some(conn) = state.connections.free(token) {
                trace!("closing connection (stage={:?})", conn.stage);
            }
        }
        let to_remove: Vec<ConnToken> = state
            .connections
            .iter()
            .filter(|(_, c)| c.pending.contains(PendingEvent::REMOVE))
            .map(|(t, _)| t)
            .collect();
        for token in to_remove {
            state.connections.free(token);
        }
    }
}

/// Packs a [`SocketAddr`] into a `sockaddr_storage` for a raw `connect(2)` call. `std::net`
/// offers no way to drive a non-blocking connect on a socket it didn't create itself
/// (`TcpStream::connect` always blocks until the handshake completes or fails), so the reactor's
/// async client has to build and connect the raw socket by hand.
fn pack_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut *(std::ptr::addr_of_mut!(storage) as *mut libc::sockaddr_in);
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
                (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut *(std::ptr::addr_of_mut!(storage) as *mut libc::sockaddr_in6);
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }
}

fn connect_nonblocking(addr: SocketAddr) -> Result<TcpStream, Error> {
    use std::os::fd::FromRawFd;

    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: `fd` was just created above and is owned exclusively by this `TcpStream` from
    // this point on; nothing else holds or closes it.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;

    let (storage, len) = pack_sockaddr(addr);
    // SAFETY: `storage` is a valid, fully-initialized `sockaddr_in`/`sockaddr_in6` for the
    // `len` bytes passed, per `pack_sockaddr`.
    let ret = unsafe { libc::connect(fd, std::ptr::addr_of!(storage) as *const libc::sockaddr, len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) && err.kind() != io::ErrorKind::WouldBlock {
            return Err(Error::Io(err));
        }
    }
    Ok(stream)
}

/// Generates a transaction id from the wall clock. Not collision-free across concurrent clients,
/// which is fine: a connection carries at most one RPC, so nothing ever matches a reply against
/// a table of outstanding ids.
pub(crate) fn generate_xid() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0);
    nanos ^ (std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MethodType;
    use std::io::Write as _;
    use std::net::TcpStream as StdTcpStream;

    fn init_core(dir: &std::path::Path) -> Arc<RpcCore> {
        let log_path = dir.join("rpc.log");
        RpcCore::init(log_path, "127.0.0.1:0", 10).unwrap()
    }

    #[test]
    fn accepts_and_parses_one_request() {
        let dir = tempdir();
        let core = init_core(dir.path());
        let addr = {
            let state = core.reactor.lock().unwrap();
            state.listener.local_addr().unwrap()
        };

        let mut client = StdTcpStream::connect(addr).unwrap();
        let req = Request {
            method_type: MethodType::Function,
            xid: 9,
            method_name: "Add".to_string(),
            params: vec![Val::Uint(1), Val::Uint(3)],
        };
        client.write_all(&wire::encode_request(&req)).unwrap();

        // Drive enough ticks for accept + read + parse to land.
        for _ in 0..20 {
            core.poll(Some(Duration::from_millis(20))).unwrap();
            if core.request_try_recv().is_some() {
                return;
            }
        }
        panic!("request was never enqueued");
    }

    #[test]
    fn call_async_times_out_when_peer_accepts_but_never_replies() {
        let dir = tempdir();
        let core = init_core(dir.path());

        // A bare listener that accepts the connection and then goes silent, standing in for a
        // peer that connects but never sends a response.
        let silent_peer = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_addr = silent_peer.local_addr().unwrap();
        let _keep_peer_alive = std::thread::spawn(move || {
            let _ = silent_peer.accept();
            std::thread::sleep(Duration::from_secs(5));
        });

        let result: Arc<Mutex<Option<Result<Response, Error>>>> = Arc::new(Mutex::new(None));
        let result_cb = Arc::clone(&result);
        core.call_async(
            peer_addr,
            MethodType::Function,
            "Add",
            vec![Val::Uint(1), Val::Uint(3)],
            50,
            move |r| *result_cb.lock().unwrap() = Some(r),
        )
        .unwrap();

        for _ in 0..50 {
            core.poll(Some(Duration::from_millis(20))).unwrap();
            if result.lock().unwrap().is_some() {
                break;
            }
        }

        let got = result.lock().unwrap().take().expect("callback never fired: timeout was not honored");
        match got {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected a TimedOut io error, got {other:?}"),
        }
    }

    #[test]
    fn partial_frame_then_eof_closes_the_connection() {
        let dir = tempdir();
        let core = init_core(dir.path());
        let addr = {
            let state = core.reactor.lock().unwrap();
            state.listener.local_addr().unwrap()
        };

        let req = Request {
            method_type: MethodType::Function,
            xid: 1,
            method_name: "Add".to_string(),
            params: vec![Val::Uint(1), Val::Uint(3)],
        };
        let bytes = wire::encode_request(&req);
        assert!(bytes.len() > 2, "need at least a couple of bytes to truncate");

        let mut client = StdTcpStream::connect(addr).unwrap();
        // Half a frame, then shut down the write side: the reactor will never see the rest.
        client.write_all(&bytes[..bytes.len() / 2]).unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        for _ in 0..20 {
            core.poll(Some(Duration::from_millis(20))).unwrap();
            let state = core.reactor.lock().unwrap();
            if state.connections.is_empty() {
                return;
            }
        }
        panic!("connection record was never reclaimed after a partial frame + EOF");
    }

    #[test]
    fn interrupt_causes_poll_to_report_interrupted() {
        let dir = tempdir();
        let core = init_core(dir.path());
        core.interrupt();
        let outcome = core.poll(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(outcome, Outcome::Interrupted);
    }

    fn tempdir() -> tempfile_shim::TempDir {
        tempfile_shim::TempDir::new()
    }

    /// A tiny stand-in for a scratch directory, since this crate does not take a `tempfile`
    /// dependency for a handful of tests that only need a private log file path.
    mod tempfile_shim {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut p = std::env::temp_dir();
                p.push(format!("mini_rpc_test_{}_{}", std::process::id(), unique()));
                std::fs::create_dir_all(&p).unwrap();
                TempDir(p)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }

        fn unique() -> u64 {
            use std::sync::atomic::{AtomicU64, Ordering};
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            COUNTER.fetch_add(1, Ordering::Relaxed)
        }
    }
}
