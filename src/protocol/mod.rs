// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The per-pattern specialisation of a socket (spec.md §4.4): a
//! compile-time vtable of filters and workers bound to a socket,
//! exactly as spec.md §9 asks for ("tagged-variant protocol enum plus a
//! trait/interface describing the filter/worker surface; compile-time
//! registry rather than dynamic loading").

pub mod pair;
pub mod req;
pub mod rep;

use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::global::{PipeId, Proto};
use crate::pipe::PipeHandle;
use crate::socket::{Socket, SocketCore};

/// REQ's own options, the only protocol-specific ones in this crate
/// (spec.md §6 "REQ options"). Aggregated behind one enum so `Protocol`
/// stays object-safe despite each pattern wanting different option
/// types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoOpt {
    Req(req::ReqOpt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoOptKind {
    Req(req::ReqOptKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoOptValue {
    Req(req::ReqOptValue),
}

/// A protocol's socket-ops + pipe-ops vtable. Every method here runs
/// with the caller holding whatever lock its signature implies:
/// everything taking `&mut SocketCore` runs under the socket mutex
/// (`Socket::core`); everything taking `Arc<Socket>` to spawn a worker
/// runs free of it, and the spawned worker acquires the lock itself
/// only to touch shared state, per spec.md §5.
pub trait Protocol: Send + Sync {
    fn proto(&self) -> Proto;

    /// Protocol-private per-socket state, type-erased because `Protocol`
    /// must stay object-safe; each implementation downcasts its own
    /// type back out in every other method.
    fn init_priv(&self) -> Box<dyn Any + Send>;

    /// Cooperative half of socket close: set a closing flag and wake
    /// whatever the protocol's socket workers wait on. Teardown proper
    /// happens when `Socket::close` drops the protocol state after
    /// those workers have joined.
    fn sock_close(&self, core: &mut SocketCore);

    fn setopt(&self, core: &mut SocketCore, opt: ProtoOpt) -> Result<()>;
    fn getopt(&self, core: &SocketCore, kind: ProtoOptKind) -> Result<ProtoOptValue>;

    /// Called under the socket mutex. May return the message unchanged,
    /// a replacement, or `None` to drop it silently (REP discarding a
    /// reply whose originating pipe has since closed).
    fn send_filter(&self, core: &mut SocketCore, msg: Message) -> Option<Message> {
        let _ = core;
        Some(msg)
    }

    fn recv_filter(&self, core: &mut SocketCore, msg: Message) -> Option<Message> {
        let _ = core;
        Some(msg)
    }

    /// May reject with `Error::Busy` (PAIR, already has a peer) or
    /// `Error::Proto` (REQ/REP, peer id mismatch).
    fn pipe_add(&self, core: &mut SocketCore, pipe: &PipeHandle) -> Result<()>;

    fn pipe_rem(&self, core: &mut SocketCore, id: PipeId);

    /// Spawned after `pipe_add` succeeds; expected to loop until the
    /// pipe closes, then return.
    fn spawn_pipe_workers(&self, socket: &Arc<Socket>, pipe: &PipeHandle) -> Vec<JoinHandle<()>>;

    /// Spawned once at socket creation for protocols that need
    /// background timers (REQ's resend loop); empty for protocols that
    /// don't (PAIR, REP).
    fn spawn_socket_workers(&self, _socket: &Arc<Socket>) -> Vec<JoinHandle<()>> {
        Vec::new()
    }

    /// Whether `Socket::sendmsg` must wake the socket condvar after
    /// running `send_filter`. Only REQ's resend loop parks on it
    /// waiting for a deadline `send_filter` may just have armed; for
    /// every other protocol this would just be a socket-wide condvar
    /// broadcast on every send, needlessly contending with the reaper
    /// and `Socket::close`'s own wait under concurrent senders.
    fn wakes_resend_timer_on_send(&self) -> bool {
        false
    }

    /// Whether `Socket::recvmsg` must wake the socket condvar after a
    /// `recv_filter` that accepted a message. Only REQ needs this: a
    /// matching reply clears `resend_deadline`, and the resend loop
    /// parked on that deadline should notice immediately rather than on
    /// its next timed wake.
    fn wakes_resend_timer_on_recv(&self) -> bool {
        false
    }
}

use crate::msg::Message;

pub fn for_proto(proto: Proto) -> Box<dyn Protocol> {
    match proto {
        Proto::Pair => Box::new(pair::Pair::new()),
        Proto::Req => Box::new(req::Req::new()),
        Proto::Rep => Box::new(rep::Rep::new()),
    }
}
