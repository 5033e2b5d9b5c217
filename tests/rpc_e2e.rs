// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end scenarios: a real [`mini_rpc::core::RpcCore`] and [`mini_rpc::dispatcher::Dispatcher`]
//! wired together over a loopback TCP socket, driven by the blocking client in
//! [`mini_rpc::client`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mini_rpc::client;
use mini_rpc::core::RpcCore;
use mini_rpc::dispatcher::Dispatcher;
use mini_rpc::wire::{ErrorCode, MethodType, Val, Varchar};

fn add_method(req: &mini_rpc::wire::Request, _state: &()) -> (ErrorCode, Option<Val>) {
    if req.params.len() != 2 {
        return (ErrorCode::FunctionInvalidParameterSize, None);
    }
    let mut sum: u32 = 0;
    for p in &req.params {
        match p {
            Val::Uint(v) => sum = sum.wrapping_add(*v),
            _ => return (ErrorCode::FunctionInvalidParameterType, None),
        }
    }
    (ErrorCode::Ok, Some(Val::Uint(sum)))
}

fn hello_world_method(_req: &mini_rpc::wire::Request, _state: &()) -> (ErrorCode, Option<Val>) {
    (ErrorCode::Ok, Some(Val::Varchar(Varchar::new(b"Hello World"))))
}

struct Harness {
    core: Arc<RpcCore>,
    dispatcher: Arc<Dispatcher<()>>,
    addr: std::net::SocketAddr,
    reactor: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Harness {
    fn start(workers: usize) -> Self {
        let mut log_path = std::env::temp_dir();
        log_path.push(format!("mini_rpc_e2e_{}_{}.log", std::process::id(), unique_id()));
        let core = RpcCore::init(&log_path, "127.0.0.1:0", 5).expect("init");
        let addr = core.local_addr().expect("local_addr");

        let dispatcher = Arc::new(Dispatcher::new(8, (), core.request_queue(), core.response_queue()));
        dispatcher
            .add("Add", add_method as fn(&mini_rpc::wire::Request, &()) -> (ErrorCode, Option<Val>))
            .unwrap();
        dispatcher
            .add(
                "Hello World",
                hello_world_method as fn(&mini_rpc::wire::Request, &()) -> (ErrorCode, Option<Val>),
            )
            .unwrap();

        let worker_handles = dispatcher.run_remote(workers);

        let reactor_core = Arc::clone(&core);
        let reactor = thread::spawn(move || {
            let _ = reactor_core.run();
        });

        // Give the reactor a moment to start its first poll tick before clients connect.
        thread::sleep(Duration::from_millis(20));

        Harness {
            core,
            dispatcher,
            addr,
            reactor: Some(reactor),
            workers: worker_handles,
        }
    }

    fn stop(mut self) {
        self.core.interrupt();
        if let Some(h) = self.reactor.take() {
            h.join().expect("reactor thread panicked");
        }
        self.dispatcher.quit(std::mem::take(&mut self.workers));
        self.core.shutdown();
    }
}

fn unique_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[test]
fn add_returns_sum() {
    let h = Harness::start(4);
    let resp = client::request(h.addr, MethodType::Function, "Add", vec![Val::Uint(1), Val::Uint(3)])
        .expect("request failed");
    assert_eq!(resp.error_code, ErrorCode::Ok.code());
    assert_eq!(resp.result, Some(Val::Uint(4)));
    h.stop();
}

#[test]
fn hello_world_returns_varchar() {
    let h = Harness::start(2);
    let resp = client::request(h.addr, MethodType::Function, "Hello World", vec![]).expect("request failed");
    assert_eq!(resp.error_code, ErrorCode::Ok.code());
    assert_eq!(resp.result, Some(Val::Varchar(Varchar::new(b"Hello World"))));
    h.stop();
}

#[test]
fn unregistered_method_is_function_not_found() {
    let h = Harness::start(2);
    let resp = client::request(h.addr, MethodType::Function, "Nope", vec![]).expect("request failed");
    assert_eq!(resp.error_code, ErrorCode::FunctionNotFound.code());
    assert_eq!(resp.result, None);
    h.stop();
}

#[test]
fn add_with_one_parameter_is_invalid_parameter_size() {
    let h = Harness::start(2);
    let resp = client::request(h.addr, MethodType::Function, "Add", vec![Val::Uint(1)]).expect("request failed");
    assert_eq!(resp.error_code, ErrorCode::FunctionInvalidParameterSize.code());
    h.stop();
}

#[test]
fn add_with_wrong_types_is_invalid_parameter_type() {
    let h = Harness::start(2);
    let resp = client::request(
        h.addr,
        MethodType::Function,
        "Add",
        vec![
            Val::Varchar(Varchar::new(b"a")),
            Val::Varchar(Varchar::new(b"b")),
        ],
    )
    .expect("request failed");
    assert_eq!(resp.error_code, ErrorCode::FunctionInvalidParameterType.code());
    h.stop();
}

#[test]
fn many_concurrent_clients_all_get_correct_answers() {
    const THREADS: usize = 64;
    const PER_THREAD: usize = 100;

    let h = Harness::start(12);
    let addr = h.addr;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    let resp =
                        client::request(addr, MethodType::Function, "Add", vec![Val::Uint(1), Val::Uint(3)])
                            .expect("request failed");
                    assert_eq!(resp.result, Some(Val::Uint(4)));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread panicked");
    }

    h.stop();
}

#[test]
fn notification_gets_no_reply_but_connection_closes_cleanly() {
    let h = Harness::start(2);
    // A notification never replies; `request` would hang waiting for a frame that never comes,
    // so this drives the wire format directly: send, then observe the peer close the socket.
    use std::io::Read;
    use std::net::TcpStream;

    let mut req = mini_rpc::wire::Request {
        method_type: MethodType::Notification,
        xid: 1,
        method_name: "Hello World".to_string(),
        params: vec![],
    };
    req.method_type = MethodType::Notification;
    let bytes = mini_rpc::wire::encode_request(&req);

    let mut stream = TcpStream::connect(h.addr).unwrap();
    std::io::Write::write_all(&mut stream, &bytes).unwrap();

    let mut buf = Vec::new();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let _ = stream.read_to_end(&mut buf);
    assert!(buf.is_empty(), "a notification must not receive a reply frame");

    h.stop();
}
