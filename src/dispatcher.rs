// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The service dispatcher: a hash-indexed method table plus a pool of worker threads that pop
//! requests off the request queue, look up a method, invoke it, and push a response.

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use log::{debug, trace, warn};

use crate::core::{RequestEnvelope, ResponseEnvelope};
use crate::queue::{Dequeued, Queue};
use crate::wire::{ErrorCode, Request, Val, MAX_METHOD_NAME_LEN};

/// A service method: takes the decoded request and the dispatcher's shared state, and returns
/// an error code plus an optional result value.
pub trait Method<S>: Send + Sync {
    fn invoke(&self, req: &Request, state: &S) -> (ErrorCode, Option<Val>);
}

impl<F, S> Method<S> for F
where
    F: Fn(&Request, &S) -> (ErrorCode, Option<Val>) + Send + Sync,
{
    fn invoke(&self, req: &Request, state: &S) -> (ErrorCode, Option<Val>) {
        self(req, state)
    }
}

struct Slot<S> {
    hash: u64,
    name: String,
    method: Box<dyn Method<S>>,
    next: Option<usize>,
}

/// The open-addressed, hash-chained method table.
///
/// Insertion hashes the name with a simple xor-rotate mix, indexes `hash mod cap`, and if that
/// slot is already in use, walks the intrusive chain anchored there before linearly probing
/// forward for a free slot and linking it onto the chain's tail. The table is never shrunk and
/// never deletes entries; when full it doubles capacity and reinserts everything.
struct MethodTable<S> {
    slots: Vec<Option<Slot<S>>>,
    cap: usize,
    len: usize,
}

fn mix_hash(name: &str) -> u64 {
    let mut h: u64 = 0;
    for &byte in name.as_bytes() {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(byte as u64);
    }
    h
}

fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

impl<S> MethodTable<S> {
    fn new(requested_cap: usize) -> Self {
        let cap = next_power_of_two(requested_cap.max(1));
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || None);
        MethodTable { slots, cap, len: 0 }
    }

    fn index_of(&self, hash: u64) -> usize {
        (hash % self.cap as u64) as usize
    }

    /// Returns `Ok(())` on success, `Err(true)` if `name` is already registered, `Err(false)`
    /// if the table ran out of free slots to probe into (callers should grow and retry; this
    /// only happens internally during the doubling rebuild, never from a user-facing `add`).
    fn try_insert(&mut self, hash: u64, name: String, method: Box<dyn Method<S>>) -> Result<(), bool> {
        let idx = self.index_of(hash);

        if self.slots[idx].is_none() {
            self.slots[idx] = Some(Slot {
                hash,
                name,
                method,
                next: None,
            });
            self.len += 1;
            return Ok(());
        }

        // Walk the chain anchored at idx, checking for a duplicate name along the way.
        let mut tail = idx;
        loop {
            let slot = self.slots[tail].as_ref().unwrap();
            if slot.hash == hash && slot.name == name {
                return Err(true);
            }
            match slot.next {
                Some(next) => tail = next,
                None => break,
            }
        }

        // Linear probe forward from idx+1 for a free slot.
        let mut probe = (idx + 1) % self.cap;
        let mut steps = 0;
        while self.slots[probe].is_some() {
            steps += 1;
            if steps >= self.cap {
                return Err(false);
            }
            probe = (probe + 1) % self.cap;
        }

        self.slots[probe] = Some(Slot {
            hash,
            name,
            method,
            next: None,
        });
        self.slots[tail].as_mut().unwrap().next = Some(probe);
        self.len += 1;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<&Slot<S>> {
        let hash = mix_hash(name);
        let mut idx = self.index_of(hash);
        loop {
            let slot = self.slots[idx].as_ref()?;
            if slot.hash == hash && slot.name == name {
                return Some(slot);
            }
            idx = slot.next?;
        }
    }

    /// Doubles capacity and reinserts every existing entry. Called when `len == cap`.
    fn grow(&mut self) {
        let old = std::mem::replace(self, MethodTable::new(self.cap * 2));
        for slot in old.slots.into_iter().flatten() {
            self.try_insert(slot.hash, slot.name, slot.method)
                .expect("rebuild into a doubled table cannot fail");
        }
    }
}

/// Error returned by [`Dispatcher::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddError {
    DuplicateName,
    NameTooLong,
}

/// A user-facing facade that registers named methods and runs them on worker threads (spec
/// §4.7). Generic over `S`, the private state shared by every method invocation.
pub struct Dispatcher<S> {
    table: RwLock<MethodTable<S>>,
    state: Arc<S>,
    request_queue: Arc<Queue<RequestEnvelope>>,
    response_queue: Arc<Queue<ResponseEnvelope>>,
}

impl<S: Send + Sync + 'static> Dispatcher<S> {
    pub fn new(
        initial_capacity: usize,
        state: S,
        request_queue: Arc<Queue<RequestEnvelope>>,
        response_queue: Arc<Queue<ResponseEnvelope>>,
    ) -> Self {
        Dispatcher {
            table: RwLock::new(MethodTable::new(initial_capacity)),
            state: Arc::new(state),
            request_queue,
            response_queue,
        }
    }

    /// Registers `name` to `method`. Fails if `name` is already registered or is 128 bytes or
    /// longer. Only safe to call before [`Dispatcher::run_remote`]: the table is read-only
    /// once workers are running.
    pub fn add(&self, name: &str, method: impl Method<S> + 'static) -> Result<(), AddError> {
        if name.is_empty() || name.len() >= MAX_METHOD_NAME_LEN + 1 {
            return Err(AddError::NameTooLong);
        }
        let hash = mix_hash(name);
        let mut table = self.table.write().unwrap();
        if table.len == table.cap {
            table.grow();
        }
        match table.try_insert(hash, name.to_string(), Box::new(method)) {
            Ok(()) => Ok(()),
            Err(true) => Err(AddError::DuplicateName),
            Err(false) => unreachable!(
                "linear probe exhausted the table despite len < cap having just been checked"
            ),
        }
    }

    /// Looks up `name` and, if found, invokes it against `req`. Used both by
    /// [`Dispatcher::run_once`]/[`Dispatcher::run_remote`]'s workers and directly by tests.
    fn dispatch_one(&self, req: &Request) -> (ErrorCode, Option<Val>) {
        let table = self.table.read().unwrap();
        match table.lookup(&req.method_name) {
            Some(slot) => slot.method.invoke(req, &self.state),
            None => {
                debug!("method not found: {}", req.method_name);
                (ErrorCode::FunctionNotFound, None)
            }
        }
    }

    fn handle_envelope(&self, envelope: RequestEnvelope) {
        let RequestEnvelope { token, raw } = envelope;
        let request = match crate::wire::decode_request(&raw) {
            Ok(req) => req,
            Err(e) => {
                warn!("dropping malformed request: {e}");
                self.response_queue
                    .enqueue(ResponseEnvelope::ParseError { token });
                return;
            }
        };

        let is_notification = matches!(request.method_type, crate::wire::MethodType::Notification);
        let (error_code, result) = self.dispatch_one(&request);
        trace!(
            "dispatched {} -> error_code={}",
            request.method_name,
            error_code.code()
        );

        if is_notification {
            self.response_queue.enqueue(ResponseEnvelope::Done { token });
            return;
        }

        let response = crate::wire::Response {
            method_type: crate::wire::MethodType::Function,
            xid: request.xid,
            method_name: request.method_name,
            error_code: error_code.code(),
            result: if error_code.is_ok() { result } else { None },
        };
        self.response_queue
            .enqueue(ResponseEnvelope::Reply { token, response });
    }

    /// Runs one iteration inline, for single-threaded/test use. Returns `true` if a request
    /// was processed.
    pub fn run_once(&self) -> bool {
        match self.request_queue.dequeue_try() {
            Some(envelope) => {
                self.handle_envelope(envelope);
                true
            }
            None => false,
        }
    }

    /// Spawns `n` worker threads, each looping: block-dequeue a request, dispatch it, enqueue
    /// the response; exit when the request queue is woken.
    pub fn run_remote(self: &Arc<Self>, n: usize) -> Vec<JoinHandle<()>> {
        (0..n)
            .map(|worker_id| {
                let this = Arc::clone(self);
                std::thread::Builder::new()
                    .name(format!("mini-rpc-worker-{worker_id}"))
                    .spawn(move || loop {
                        match this.request_queue.dequeue_blocking() {
                            Dequeued::Item(envelope) => this.handle_envelope(envelope),
                            Dequeued::Woken => break,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect()
    }

    /// Wakes every worker spawned by [`Dispatcher::run_remote`] and joins them.
    pub fn quit(&self, handles: Vec<JoinHandle<()>>) {
        self.request_queue.wake_all();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MethodType;

    fn add_method(req: &Request, _state: &()) -> (ErrorCode, Option<Val>) {
        let mut sum: u32 = 0;
        if req.params.len() != 2 {
            return (ErrorCode::FunctionInvalidParameterSize, None);
        }
        for p in &req.params {
            match p {
                Val::Uint(v) => sum = sum.wrapping_add(*v),
                _ => return (ErrorCode::FunctionInvalidParameterType, None),
            }
        }
        (ErrorCode::Ok, Some(Val::Uint(sum)))
    }

    fn make_dispatcher() -> Dispatcher<()> {
        let rq = Arc::new(Queue::new());
        let sq = Arc::new(Queue::new());
        Dispatcher::new(4, (), rq, sq)
    }

    #[test]
    fn registers_and_looks_up_distinct_names() {
        let d = make_dispatcher();
        for i in 0..40 {
            d.add(&format!("method{i}"), add_method).unwrap();
        }
        for i in 0..40 {
            let req = Request {
                method_type: MethodType::Function,
                xid: 0,
                method_name: format!("method{i}"),
                params: vec![Val::Uint(1), Val::Uint(2)],
            };
            let (code, result) = d.dispatch_one(&req);
            assert!(code.is_ok());
            assert_eq!(result, Some(Val::Uint(3)));
        }
    }

    #[test]
    fn duplicate_name_rejected() {
        let d = make_dispatcher();
        d.add("Add", add_method).unwrap();
        assert_eq!(d.add("Add", add_method), Err(AddError::DuplicateName));
    }

    #[test]
    fn unknown_method_is_not_found() {
        let d = make_dispatcher();
        let req = Request {
            method_type: MethodType::Function,
            xid: 0,
            method_name: "Nope".to_string(),
            params: vec![],
        };
        let (code, result) = d.dispatch_one(&req);
        assert_eq!(code, ErrorCode::FunctionNotFound);
        assert_eq!(result, None);
    }

    #[test]
    fn wrong_param_count_and_type_are_distinguished() {
        let d = make_dispatcher();
        d.add("Add", add_method).unwrap();

        let one_param = Request {
            method_type: MethodType::Function,
            xid: 0,
            method_name: "Add".to_string(),
            params: vec![Val::Uint(1)],
        };
        assert_eq!(
            d.dispatch_one(&one_param).0,
            ErrorCode::FunctionInvalidParameterSize
        );

        let wrong_type = Request {
            method_type: MethodType::Function,
            xid: 0,
            method_name: "Add".to_string(),
            params: vec![
                Val::Varchar(crate::wire::Varchar::new(b"a")),
                Val::Varchar(crate::wire::Varchar::new(b"b")),
            ],
        };
        assert_eq!(
            d.dispatch_one(&wrong_type).0,
            ErrorCode::FunctionInvalidParameterType
        );
    }
}
