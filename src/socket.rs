// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Owns the upper queues, the active-pipe list, the reaper, and drives
//! protocol filter composition (spec.md §4.3).

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result, SockErr};
use crate::global::{PipeId, Proto};
use crate::msg::Message;
use crate::msgqueue::MsgQueue;
use crate::options::{SockOpt, SockOptKind, SockOptValue};
use crate::pipe::{Pipe, PipeHandle};
use crate::protocol::{self, Protocol, ProtoOpt, ProtoOptKind, ProtoOptValue};
use crate::transport::{Dialer, Listener, TransportPipe};

/// Default capacity of the upper read/write queues (`NNG_OPT_SNDBUF` /
/// `NNG_OPT_RCVBUF`'s default value).
const DEFAULT_QUEUE_CAP: usize = 64;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SockOpts {
    pub linger: Duration,
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub reconn_min: Duration,
    pub reconn_max: Duration,
    pub best_effort: bool,
}

impl Default for SockOpts {
    fn default() -> SockOpts {
        SockOpts {
            linger: Duration::from_secs(1),
            send_timeout: None,
            recv_timeout: None,
            reconn_min: Duration::from_millis(100),
            reconn_max: Duration::from_secs(10),
            best_effort: false,
        }
    }
}

/// The socket's mutable state, protected by `Socket::core`. Everything
/// the spec calls out as socket-mutex-protected lives here, including
/// the active protocol's type-erased private data — one lock guards
/// both, exactly as spec.md §5 requires ("the protocol-private filter
/// state for that protocol instance").
pub struct SocketCore {
    pub(crate) closing: bool,
    pub(crate) send_err: Option<SockErr>,
    pub(crate) recv_err: Option<SockErr>,
    pub(crate) active: HashMap<PipeId, PipeHandle>,
    pub(crate) reap: Vec<PipeHandle>,
    pub(crate) workers: HashMap<PipeId, Vec<JoinHandle<()>>>,
    pub(crate) endpoints: Vec<Arc<Endpoint>>,
    pub(crate) next_pipe_id: u32,
    pub(crate) opts: SockOpts,
    pub(crate) proto_priv: Box<dyn Any + Send>,
}

impl SocketCore {
    /// Downcasts the protocol-private state. Panics if the caller's
    /// protocol doesn't match the socket's — a programming error, since
    /// each `Protocol` impl only ever touches the state it created.
    pub fn proto_priv_mut<T: 'static>(&mut self) -> &mut T {
        self.proto_priv
            .downcast_mut()
            .expect("protocol private state type mismatch")
    }

    pub fn proto_priv_ref<T: 'static>(&self) -> &T {
        self.proto_priv
            .downcast_ref()
            .expect("protocol private state type mismatch")
    }
}

pub struct Socket {
    self_weak: Weak<Socket>,
    proto: Proto,
    ops: Box<dyn Protocol>,
    core: Mutex<SocketCore>,
    cv: Condvar,
    uwq: MsgQueue,
    urq: MsgQueue,
    reaper: Mutex<Option<JoinHandle<()>>>,
    proto_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Socket {
    /// Resolves the compile-time protocol table by id, creates the
    /// upper queues, and starts the reaper worker (spec.md §4.3
    /// `create`).
    pub fn create(proto: Proto) -> Arc<Socket> {
        let ops = protocol::for_proto(proto);
        let proto_priv = ops.init_priv();

        let socket = Arc::new_cyclic(|weak| Socket {
            self_weak: weak.clone(),
            proto,
            ops,
            core: Mutex::new(SocketCore {
                closing: false,
                send_err: None,
                recv_err: None,
                active: HashMap::new(),
                reap: Vec::new(),
                workers: HashMap::new(),
                endpoints: Vec::new(),
                next_pipe_id: rand::random::<u32>() & 0x7fff_ffff,
                opts: SockOpts::default(),
                proto_priv,
            }),
            cv: Condvar::new(),
            uwq: MsgQueue::new(DEFAULT_QUEUE_CAP),
            urq: MsgQueue::new(DEFAULT_QUEUE_CAP),
            reaper: Mutex::new(None),
            proto_workers: Mutex::new(Vec::new()),
        });

        let reaper_socket = socket.clone();
        *socket.reaper.lock().unwrap() = Some(thread::spawn(move || reaper_loop(reaper_socket)));

        let workers = socket.ops.spawn_socket_workers(&socket);
        *socket.proto_workers.lock().unwrap() = workers;

        debug!("[{}] socket created", proto);
        socket
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub(crate) fn core(&self) -> &Mutex<SocketCore> {
        &self.core
    }

    pub(crate) fn cv(&self) -> &Condvar {
        &self.cv
    }

    pub(crate) fn uwq(&self) -> &MsgQueue {
        &self.uwq
    }

    pub(crate) fn urq(&self) -> &MsgQueue {
        &self.urq
    }

    fn next_deadline(&self, explicit: Option<Instant>, opt: Option<Duration>) -> Option<Instant> {
        explicit.or_else(|| opt.map(|d| Instant::now() + d))
    }

    /// Acquires the socket mutex; runs the send-filter if installed;
    /// puts the resulting message on the upper write queue with the
    /// timeout. Short-circuits with the protocol's send-error code, if
    /// one is asserted, without touching the queue (spec.md §4.3).
    pub fn sendmsg(&self, msg: Message, deadline: Option<Instant>) -> Result<()> {
        let deadline = {
            let core = self.core.lock().unwrap();
            self.next_deadline(deadline, core.opts.send_timeout)
        };

        let filtered = {
            let mut core = self.core.lock().unwrap();
            if let Some(e) = core.send_err {
                return Err(e.into());
            }
            match self.ops.send_filter(&mut core, msg) {
                Some(m) => m,
                // The filter consumed the message without replacing it
                // (REP dropping a reply whose originating pipe is gone).
                // Already handled; nothing left to queue.
                None => return Ok(()),
            }
        };
        // Wakes REQ's resend loop when a filter just armed its first
        // deadline. Gated per-protocol: a blanket broadcast here would
        // contend with the reaper and `Socket::close`'s own wait on
        // every single send under concurrent senders.
        if self.ops.wakes_resend_timer_on_send() {
            self.cv.notify_all();
        }

        self.uwq.put(filtered, deadline)
    }

    /// Returns the protocol's recv-error code if set; otherwise gets
    /// from the upper read queue, applying the recv-filter under the
    /// socket mutex and looping on filter-drop so URQ ordering of
    /// admitted messages is preserved (spec.md §4.3, §5).
    pub fn recvmsg(&self, deadline: Option<Instant>) -> Result<Message> {
        let deadline = {
            let core = self.core.lock().unwrap();
            self.next_deadline(deadline, core.opts.recv_timeout)
        };

        loop {
            {
                let core = self.core.lock().unwrap();
                if let Some(e) = core.recv_err {
                    return Err(e.into());
                }
            }
            let msg = self.urq.get(deadline)?;
            let mut core = self.core.lock().unwrap();
            let accepted = self.ops.recv_filter(&mut core, msg);
            drop(core);
            // Wakes REQ's resend loop when a matching reply just retired
            // the outstanding request, so the resender notices right away
            // instead of on its next timed wake.
            if accepted.is_some() && self.ops.wakes_resend_timer_on_recv() {
                self.cv.notify_all();
            }
            if let Some(accepted) = accepted {
                return Ok(accepted);
            }
            trace!("[{}] recv-filter dropped a message, looping", self.proto);
        }
    }

    pub fn setopt(&self, opt: SockOpt) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        match opt {
            SockOpt::Linger(d) => core.opts.linger = d,
            SockOpt::SendTimeout(d) => core.opts.send_timeout = Some(d),
            SockOpt::RecvTimeout(d) => core.opts.recv_timeout = Some(d),
            SockOpt::ReconnTime(d) => core.opts.reconn_min = d,
            SockOpt::ReconnMaxTime(d) => core.opts.reconn_max = d,
            SockOpt::BestEffort(b) => core.opts.best_effort = b,
            SockOpt::SendBuf(n) => self.uwq.set_cap(n),
            SockOpt::RecvBuf(n) => self.urq.set_cap(n),
        }
        Ok(())
    }

    pub fn getopt(&self, kind: SockOptKind) -> Result<SockOptValue> {
        let core = self.core.lock().unwrap();
        Ok(match kind {
            SockOptKind::Linger => SockOptValue::Linger(core.opts.linger),
            SockOptKind::SendTimeout => SockOptValue::SendTimeout(core.opts.send_timeout),
            SockOptKind::RecvTimeout => SockOptValue::RecvTimeout(core.opts.recv_timeout),
            SockOptKind::ReconnTime => SockOptValue::ReconnTime(core.opts.reconn_min),
            SockOptKind::ReconnMaxTime => SockOptValue::ReconnMaxTime(core.opts.reconn_max),
            SockOptKind::BestEffort => SockOptValue::BestEffort(core.opts.best_effort),
            SockOptKind::SendBuf => SockOptValue::SendBuf(self.uwq.cap()),
            SockOptKind::RecvBuf => SockOptValue::RecvBuf(self.urq.cap()),
        })
    }

    pub fn setopt_proto(&self, opt: ProtoOpt) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        self.ops.setopt(&mut core, opt)
    }

    pub fn getopt_proto(&self, kind: ProtoOptKind) -> Result<ProtoOptValue> {
        let core = self.core.lock().unwrap();
        self.ops.getopt(&core, kind)
    }

    pub fn dial(self: &Arc<Self>, name: &str, dialer: Box<dyn Dialer>) -> Result<Arc<Endpoint>> {
        let mut core = self.core.lock().unwrap();
        if core.closing {
            return Err(Error::Closed);
        }
        let ep = Endpoint::dial(self, name.to_owned(), dialer);
        core.endpoints.push(ep.clone());
        Ok(ep)
    }

    pub fn listen(self: &Arc<Self>, name: &str, listener: Box<dyn Listener>) -> Result<Arc<Endpoint>> {
        let mut core = self.core.lock().unwrap();
        if core.closing {
            return Err(Error::Closed);
        }
        let ep = Endpoint::listen(self, name.to_owned(), listener);
        core.endpoints.push(ep.clone());
        Ok(ep)
    }

    /// Allocates an id and wraps a freshly dialed/accepted transport.
    /// Not yet on the active list (spec.md §4.2 `create`).
    pub(crate) fn create_pipe(self: &Arc<Self>, transport: Box<dyn TransportPipe>) -> PipeHandle {
        let mut core = self.core.lock().unwrap();
        let id = PipeId(core.next_pipe_id & 0x7fff_ffff);
        core.next_pipe_id = core.next_pipe_id.wrapping_add(1);
        Arc::new(Pipe::new(id, transport))
    }

    /// Inserts the pipe on the active list under lock, invokes
    /// `pipe_add` (which may reject it), then launches its worker(s)
    /// (spec.md §4.2 `start`).
    pub(crate) fn start_pipe(self: &Arc<Self>, pipe: PipeHandle) -> Result<()> {
        {
            let mut core = self.core.lock().unwrap();
            if core.closing {
                return Err(Error::Closed);
            }
            core.active.insert(pipe.id(), pipe.clone());
            if let Err(e) = self.ops.pipe_add(&mut core, &pipe) {
                core.active.remove(&pipe.id());
                return Err(e);
            }
        }
        debug!("[{}] pipe {:?} started", self.proto, pipe.id());
        let handles = self.ops.spawn_pipe_workers(self, &pipe);
        self.core.lock().unwrap().workers.insert(pipe.id(), handles);
        Ok(())
    }

    /// Idempotent: signals the pipe's workers via the upper queues,
    /// closes the transport, moves the pipe to the reap list, and wakes
    /// the reaper (spec.md §4.2 `close`).
    pub(crate) fn close_pipe(self: &Arc<Self>, id: PipeId) {
        // Looking the pipe up and removing it from `active` must not be
        // two separate lock acquisitions: if they were, a racing reaper
        // could observe `active` already missing this pipe but `reap`
        // not yet holding it, conclude (wrongly, mid-close) that there
        // is nothing left to ever reap, and exit for good while this
        // pipe is still in flight. So look it up first, close it
        // outside the lock, then remove-and-push as one critical
        // section below.
        let pipe = {
            let core = self.core.lock().unwrap();
            match core.active.get(&id) {
                Some(p) => p.clone(),
                None => return,
            }
        };
        debug!("[{}] pipe {:?} closing", self.proto, id);
        pipe.close();
        self.uwq.signal(pipe.close_flag());
        self.urq.signal(pipe.close_flag());

        let mut core = self.core.lock().unwrap();
        if core.active.remove(&id).is_none() {
            // Another concurrent close_pipe call for the same id already
            // won the race and reaped it.
            return;
        }
        self.ops.pipe_rem(&mut core, id);
        core.reap.push(pipe);
        drop(core);
        self.cv.notify_all();
    }

    pub fn senderr(&self, err: Option<SockErr>) {
        self.core.lock().unwrap().send_err = err;
    }

    pub fn recverr(&self, err: Option<SockErr>) {
        self.core.lock().unwrap().recv_err = err;
    }

    /// Closes endpoints, closes pipes, waits for the reap list to
    /// drain, closes the upper queues, joins the reaper, and lets the
    /// protocol tear down (spec.md §4.3 `close`).
    pub fn close(self: &Arc<Self>) {
        {
            let mut core = self.core.lock().unwrap();
            if core.closing {
                return;
            }
            core.closing = true;
            self.ops.sock_close(&mut core);
        }
        self.cv.notify_all();

        // Endpoints are asked to stop, and any blocking call they're
        // parked in (accept, or a dial loop's wait for its pipe to
        // close) gets a nudge — but dial endpoints don't actually
        // unblock until their pipe is closed below, so joining happens
        // afterwards, not here.
        let endpoints = std::mem::take(&mut self.core.lock().unwrap().endpoints);
        for ep in &endpoints {
            ep.request_stop();
        }

        let active_ids: Vec<PipeId> = self.core.lock().unwrap().active.keys().copied().collect();
        for id in active_ids {
            self.close_pipe(id);
        }

        {
            let mut core = self.core.lock().unwrap();
            while !(core.active.is_empty() && core.reap.is_empty()) {
                core = self.cv.wait(core).unwrap();
            }
        }

        for ep in &endpoints {
            ep.join();
        }

        self.uwq.close();
        self.urq.close();

        if let Some(h) = self.reaper.lock().unwrap().take() {
            let _ = h.join();
        }
        for h in self.proto_workers.lock().unwrap().drain(..) {
            let _ = h.join();
        }
        debug!("[{}] socket closed", self.proto);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if !self.core.lock().unwrap().closing {
            // Applications are expected to call `close` explicitly;
            // this is a safety net so a socket dropped without an
            // explicit close still reaps its threads instead of
            // leaking them.
            if let Some(socket) = self.self_weak.upgrade() {
                socket.close();
            }
        }
    }
}

fn reaper_loop(socket: Arc<Socket>) {
    loop {
        let pipe = {
            let mut core = socket.core.lock().unwrap();
            loop {
                if let Some(p) = core.reap.pop() {
                    break Some(p);
                }
                if core.closing && core.active.is_empty() {
                    break None;
                }
                core = socket.cv.wait(core).unwrap();
            }
        };
        let pipe = match pipe {
            Some(p) => p,
            None => return,
        };

        let handles = socket.core.lock().unwrap().workers.remove(&pipe.id()).unwrap_or_default();
        for h in handles {
            let _ = h.join();
        }
        debug!("[{}] pipe {:?} reaped", socket.proto, pipe.id());
        drop(pipe);
        socket.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Proto;

    #[test]
    fn sendbuf_recvbuf_roundtrip_through_getopt() {
        let socket = Socket::create(Proto::Pair);

        assert_eq!(socket.getopt(SockOptKind::SendBuf).unwrap(), SockOptValue::SendBuf(DEFAULT_QUEUE_CAP));
        assert_eq!(socket.getopt(SockOptKind::RecvBuf).unwrap(), SockOptValue::RecvBuf(DEFAULT_QUEUE_CAP));

        socket.setopt(SockOpt::SendBuf(4)).unwrap();
        socket.setopt(SockOpt::RecvBuf(8)).unwrap();

        assert_eq!(socket.getopt(SockOptKind::SendBuf).unwrap(), SockOptValue::SendBuf(4));
        assert_eq!(socket.getopt(SockOptKind::RecvBuf).unwrap(), SockOptValue::RecvBuf(8));

        socket.close();
    }

    #[test]
    fn close_before_any_pipe_is_immediate_and_idempotent() {
        let socket = Socket::create(Proto::Pair);
        socket.close();
        socket.close();
    }
}
