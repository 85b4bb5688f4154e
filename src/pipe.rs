// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A single live peer connection below a socket (spec.md §4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::Result;
use crate::global::PipeId;
use crate::msg::Message;
use crate::msgqueue::SignalFlag;
use crate::transport::TransportPipe;

/// Owns a live transport connection and bridges it to protocol workers.
/// `Pipe` itself carries no protocol-private state — each protocol keeps
/// its own per-pipe bookkeeping (see `protocol::pair`/`protocol::req`)
/// keyed by `PipeId`, which is simpler than threading an `Any`-erased
/// slot through here and matches how little state a pipe needs at the
/// core level: an id, a transport, and the one close-signal flag every
/// protocol's workers watch.
pub struct Pipe {
    id: PipeId,
    transport: Box<dyn TransportPipe>,
    close_flag: SignalFlag,
    closing: AtomicBool,
    closed: Mutex<bool>,
    closed_cv: Condvar,
}

impl Pipe {
    pub(crate) fn new(id: PipeId, transport: Box<dyn TransportPipe>) -> Pipe {
        Pipe {
            id,
            transport,
            close_flag: SignalFlag::new(),
            closing: AtomicBool::new(false),
            closed: Mutex::new(false),
            closed_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn peer_proto(&self) -> u16 {
        self.transport.peer_proto()
    }

    pub fn self_proto(&self) -> u16 {
        self.transport.self_proto()
    }

    /// The flag protocol workers pass to `MsgQueue::get_sig`/`put_sig` so
    /// a blocked wait on the socket's upper queues is cancelled as soon
    /// as this pipe starts closing.
    pub fn close_flag(&self) -> &SignalFlag {
        &self.close_flag
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        self.transport.send(msg).map_err(Into::into)
    }

    pub fn recv(&self) -> Result<Message> {
        self.transport.recv().map_err(Into::into)
    }

    /// Idempotent. Closes the transport; does not itself touch any
    /// queue — callers (the socket) are responsible for signalling the
    /// upper queues with `close_flag()` and moving the pipe to the reap
    /// list, since only the socket knows which queues are shared with
    /// this pipe's workers.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.transport.close();
            *self.closed.lock().unwrap() = true;
            self.closed_cv.notify_all();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread (an endpoint's dial supervisor) until
    /// this pipe has been closed.
    pub fn wait_closed(&self) {
        let mut closed = self.closed.lock().unwrap();
        while !*closed {
            closed = self.closed_cv.wait(closed).unwrap();
        }
    }
}

pub(crate) type PipeHandle = Arc<Pipe>;
