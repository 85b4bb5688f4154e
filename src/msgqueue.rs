// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Bounded FIFO of messages with cancellable blocking put/get
//! (spec.md §4.1 "Message Queue").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::msg::Message;

/// A cancellation token a worker watches alongside a queue's own wait
/// predicate. Cloning shares the same underlying flag; `signal` sets it
/// and wakes every queue currently told to watch it.
#[derive(Clone, Default)]
pub struct SignalFlag(Arc<AtomicBool>);

impl SignalFlag {
    pub fn new() -> SignalFlag {
        SignalFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Inner {
    items: VecDeque<Message>,
    cap: usize,
    closed: bool,
}

/// A bounded, bidirectionally-blocking message queue. `put`/`get` block
/// until space or a message is available, the queue closes, or a
/// deadline elapses; the `_sig` variants additionally wake (with no
/// message delivered) the instant their `SignalFlag` is set, which is
/// how a pipe's workers are told to stop waiting on the upper queues
/// when their pipe is closing.
pub struct MsgQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl MsgQueue {
    pub fn new(cap: usize) -> MsgQueue {
        MsgQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(cap.min(64)),
                cap,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn put(&self, msg: Message, deadline: Option<Instant>) -> Result<()> {
        self.put_impl(msg, deadline, None)
    }

    pub fn put_sig(&self, msg: Message, flag: &SignalFlag, deadline: Option<Instant>) -> Result<()> {
        self.put_impl(msg, deadline, Some(flag))
    }

    fn put_impl(&self, msg: Message, deadline: Option<Instant>, flag: Option<&SignalFlag>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(Error::Closed);
            }
            if let Some(f) = flag {
                if f.is_set() {
                    return Err(Error::Closed);
                }
            }
            if inner.items.len() < inner.cap {
                inner.items.push_back(msg);
                self.not_empty.notify_one();
                return Ok(());
            }
            inner = match wait(&self.not_full, inner, deadline) {
                Some(guard) => guard,
                None => return Err(Error::TimedOut),
            };
        }
    }

    pub fn get(&self, deadline: Option<Instant>) -> Result<Message> {
        self.get_impl(deadline, None)
    }

    pub fn get_sig(&self, flag: &SignalFlag, deadline: Option<Instant>) -> Result<Message> {
        self.get_impl(deadline, Some(flag))
    }

    fn get_impl(&self, deadline: Option<Instant>, flag: Option<&SignalFlag>) -> Result<Message> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(f) = flag {
                if f.is_set() {
                    return Err(Error::Closed);
                }
            }
            if let Some(msg) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Ok(msg);
            }
            if inner.closed {
                // Consumers may still drain messages already queued
                // above; once drained, a closed queue fails them too.
                return Err(Error::Closed);
            }
            inner = match wait(&self.not_empty, inner, deadline) {
                Some(guard) => guard,
                None => return Err(Error::TimedOut),
            };
        }
    }

    /// Atomically sets `flag` and wakes every waiter on this queue that
    /// may be observing it.
    pub fn signal(&self, flag: &SignalFlag) {
        flag.set();
        let _guard = self.inner.lock().unwrap();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Drains producers (they fail from now on), lets consumers finish
    /// draining what's already queued, then fails consumers too.
    /// Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Changes the queue's capacity (`NNG_OPT_SNDBUF`/`NNG_OPT_RCVBUF`).
    /// Takes effect immediately for future `put`s; does not evict
    /// messages already queued past the new capacity.
    pub fn set_cap(&self, cap: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.cap = cap;
        self.not_full.notify_all();
    }

    pub fn cap(&self) -> usize {
        self.inner.lock().unwrap().cap
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

/// Waits on `cv` respecting an optional absolute deadline. Returns
/// `None` on timeout, `Some(guard)` otherwise (spurious wakes included —
/// callers re-check their predicate in a loop).
fn wait<'a, T>(
    cv: &Condvar,
    guard: std::sync::MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> Option<std::sync::MutexGuard<'a, T>> {
    match deadline {
        None => Some(cv.wait(guard).unwrap()),
        Some(until) => {
            let now = Instant::now();
            if now >= until {
                return None;
            }
            let (guard, timeout) = cv.wait_timeout(guard, until - now).unwrap();
            if timeout.timed_out() {
                None
            } else {
                Some(guard)
            }
        }
    }
}
