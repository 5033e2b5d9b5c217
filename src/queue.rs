// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A multi-producer / multi-consumer FIFO used to hand items off between the reactor thread
//! and worker threads.
//!
//! A short critical section (a plain [`Mutex`] over a [`VecDeque`]) protects list
//! manipulation; a separate mutex/condvar pair governs sleeping. Producers never sleep.
//! Consumers spin a small bounded number of times, then fall back to waiting on the condvar
//! with an exponentially backed-off timeout (starting at 2 ms, capped at 256 ms) so a lost
//! wakeup cannot strand a consumer indefinitely.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const SPIN_ITERS: u32 = 64;
const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(256);

/// Result of a blocking dequeue.
pub enum Dequeued<T> {
    /// An item was available.
    Item(T),
    /// The queue was woken via [`Queue::wake_all`] before an item became available.
    Woken,
}

pub struct Queue<T> {
    list: Mutex<VecDeque<T>>,
    sleep: Mutex<()>,
    condvar: Condvar,
    woken: AtomicBool,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue {
            list: Mutex::new(VecDeque::new()),
            sleep: Mutex::new(()),
            condvar: Condvar::new(),
            woken: AtomicBool::new(false),
        }
    }

    /// Pushes `item` onto the back of the queue and wakes at most one blocked consumer.
    /// Never blocks.
    pub fn enqueue(&self, item: T) {
        self.list.lock().unwrap().push_back(item);
        // Acquiring the sleep mutex here is what makes the notify race-free against a
        // consumer that just checked the list, found it empty, and is about to wait.
        let _guard = self.sleep.lock().unwrap();
        self.condvar.notify_one();
    }

    /// Pops the front item, if any, without blocking.
    pub fn dequeue_try(&self) -> Option<T> {
        self.list.lock().unwrap().pop_front()
    }

    /// Blocks until an item is available or the queue is woken via [`Queue::wake_all`].
    pub fn dequeue_blocking(&self) -> Dequeued<T> {
        for _ in 0..SPIN_ITERS {
            if let Some(item) = self.dequeue_try() {
                return Dequeued::Item(item);
            }
            if self.woken.load(Ordering::Acquire) {
                return Dequeued::Woken;
            }
            std::hint::spin_loop();
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(item) = self.dequeue_try() {
                return Dequeued::Item(item);
            }
            if self.woken.load(Ordering::Acquire) {
                return Dequeued::Woken;
            }
            let guard = self.sleep.lock().unwrap();
            // Re-check under the sleep lock: an enqueue or wake_all that landed between the
            // check above and taking this lock would otherwise be missed until the timeout.
            if let Some(item) = self.dequeue_try() {
                return Dequeued::Item(item);
            }
            if self.woken.load(Ordering::Acquire) {
                return Dequeued::Woken;
            }
            let _ = self.condvar.wait_timeout(guard, backoff).unwrap();
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Flips the queue into a shutdown state and releases every blocked consumer. Idempotent.
    pub fn wake_all(&self) {
        self.woken.store(true, Ordering::Release);
        let _guard = self.sleep.lock().unwrap();
        self.condvar.notify_all();
    }

    pub fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
