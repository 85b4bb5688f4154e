// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! REQ: the request side of request/reply, with automatic resend of an
//! unanswered request on a timer (spec.md §4.4.2).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{Error, Result};
use crate::global::{PipeId, Proto};
use crate::msg::Message;
use crate::pipe::PipeHandle;
use crate::socket::{Socket, SocketCore};

use super::{Protocol, ProtoOpt, ProtoOptKind, ProtoOptValue};

pub use crate::options::ReqOpt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqOptKind {
    ResendTime,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqOptValue {
    ResendTime(Duration),
    Raw(bool),
}

const DEFAULT_RETRY: Duration = Duration::from_secs(60);

struct ReqPriv {
    next_id: u32,
    req_id: [u8; 4],
    req_msg: Option<Message>,
    retry: Duration,
    raw: bool,
    resend_deadline: Option<Instant>,
    pipes: HashMap<PipeId, PipeHandle>,
}

pub struct Req;

impl Req {
    pub fn new() -> Req {
        Req
    }
}

impl Protocol for Req {
    fn proto(&self) -> Proto {
        Proto::Req
    }

    fn wakes_resend_timer_on_send(&self) -> bool {
        true
    }

    fn init_priv(&self) -> Box<dyn Any + Send> {
        Box::new(ReqPriv {
            next_id: rand::random::<u32>() | 0x8000_0000,
            req_id: [0; 4],
            req_msg: None,
            retry: DEFAULT_RETRY,
            raw: false,
            resend_deadline: None,
            pipes: HashMap::new(),
        })
    }

    fn sock_close(&self, _core: &mut SocketCore) {}

    fn setopt(&self, core: &mut SocketCore, opt: ProtoOpt) -> Result<()> {
        let priv_ = core.proto_priv_mut::<ReqPriv>();
        match opt {
            ProtoOpt::Req(ReqOpt::ResendTime(d)) => priv_.retry = d,
            ProtoOpt::Req(ReqOpt::Raw(b)) => priv_.raw = b,
        }
        Ok(())
    }

    fn getopt(&self, core: &SocketCore, kind: ProtoOptKind) -> Result<ProtoOptValue> {
        let priv_ = core.proto_priv_ref::<ReqPriv>();
        Ok(match kind {
            ProtoOptKind::Req(ReqOptKind::ResendTime) => ProtoOptValue::Req(ReqOptValue::ResendTime(priv_.retry)),
            ProtoOptKind::Req(ReqOptKind::Raw) => ProtoOptValue::Req(ReqOptValue::Raw(priv_.raw)),
        })
    }

    /// Stamps the next correlation id into the header, remembers the
    /// fully-framed request for resend, arms the resend timer, clears
    /// any asserted recv-error, and wakes the resender (spec.md
    /// §4.4.2).
    fn send_filter(&self, core: &mut SocketCore, mut msg: Message) -> Option<Message> {
        let retry = {
            let priv_ = core.proto_priv_mut::<ReqPriv>();
            if priv_.raw {
                return Some(msg);
            }

            let id = priv_.next_id;
            priv_.next_id = priv_.next_id.wrapping_add(1) | 0x8000_0000;
            BigEndian::write_u32(&mut priv_.req_id, id);
            msg.prepend_header(&priv_.req_id);
            priv_.req_msg = Some(msg.duplicate());
            priv_.retry
        };
        core.recv_err = None;
        core.proto_priv_mut::<ReqPriv>().resend_deadline = Some(Instant::now() + retry);
        Some(msg)
    }

    /// Drops anything that doesn't carry the outstanding request's
    /// correlation id (a stale resend's reply, or a reply with no
    /// matching request); on a match, retires the request and asserts
    /// `State` so a second `recvmsg` without a new `sendmsg` fails
    /// cleanly.
    fn recv_filter(&self, core: &mut SocketCore, mut msg: Message) -> Option<Message> {
        let priv_ = core.proto_priv_ref::<ReqPriv>();
        if priv_.raw {
            return Some(msg);
        }
        if msg.header_len() < 4 {
            return None;
        }
        priv_.req_msg.as_ref()?;
        if msg.header()[..4] != priv_.req_id[..] {
            return None;
        }

        let priv_ = core.proto_priv_mut::<ReqPriv>();
        priv_.req_msg = None;
        priv_.resend_deadline = None;
        core.recv_err = Some(crate::error::SockErr::State);
        msg.trim_header_front(4);
        Some(msg)
    }

    fn wakes_resend_timer_on_recv(&self) -> bool {
        true
    }

    fn pipe_add(&self, core: &mut SocketCore, pipe: &PipeHandle) -> Result<()> {
        if pipe.peer_proto() != Proto::Req.peer_id() {
            return Err(Error::Proto);
        }
        core.proto_priv_mut::<ReqPriv>().pipes.insert(pipe.id(), pipe.clone());
        Ok(())
    }

    fn pipe_rem(&self, core: &mut SocketCore, id: PipeId) {
        core.proto_priv_mut::<ReqPriv>().pipes.remove(&id);
    }

    fn spawn_pipe_workers(&self, socket: &Arc<Socket>, pipe: &PipeHandle) -> Vec<JoinHandle<()>> {
        let sender_socket = socket.clone();
        let sender_pipe = pipe.clone();
        let sender = thread::spawn(move || req_sender(sender_socket, sender_pipe));

        let receiver_socket = socket.clone();
        let receiver_pipe = pipe.clone();
        let receiver = thread::spawn(move || req_receiver(receiver_socket, receiver_pipe));

        vec![sender, receiver]
    }

    fn spawn_socket_workers(&self, socket: &Arc<Socket>) -> Vec<JoinHandle<()>> {
        let socket = socket.clone();
        vec![thread::spawn(move || req_resend_loop(socket))]
    }
}

/// Shared across every pipe attached to this socket: whichever sender
/// wins the race to dequeue drives the request to its peer, giving REQ
/// load-balancing across multiple REP peers for free.
fn req_sender(socket: Arc<Socket>, pipe: PipeHandle) {
    loop {
        let msg = match socket.uwq().get_sig(pipe.close_flag(), None) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        if let Err(e) = pipe.send(msg) {
            debug!("[req] pipe {:?} send failed: {}", pipe.id(), e);
            socket.close_pipe(pipe.id());
            return;
        }
    }
}

fn req_receiver(socket: Arc<Socket>, pipe: PipeHandle) {
    loop {
        let mut msg = match pipe.recv() {
            Ok(msg) => msg,
            Err(e) => {
                debug!("[req] pipe {:?} recv failed: {}", pipe.id(), e);
                socket.close_pipe(pipe.id());
                return;
            }
        };
        if msg.body_len() < 4 {
            continue;
        }
        msg.move_body_prefix_to_header(4);
        if socket.urq().put_sig(msg, pipe.close_flag(), None).is_err() {
            socket.close_pipe(pipe.id());
            return;
        }
    }
}

/// Mirrors the reference implementation's resend loop: sleep until
/// there is an outstanding request, then until its deadline, then
/// re-enqueue a fresh duplicate for whichever sender picks it up next.
fn req_resend_loop(socket: Arc<Socket>) {
    loop {
        let retry_msg = {
            let mut core = socket.core().lock().unwrap();
            loop {
                if core.closing {
                    return;
                }
                let deadline = core.proto_priv_ref::<ReqPriv>().resend_deadline;
                match deadline {
                    None => core = socket.cv().wait(core).unwrap(),
                    Some(at) => {
                        let now = Instant::now();
                        if now >= at {
                            break;
                        }
                        let (guard, _timeout) = socket.cv().wait_timeout(core, at - now).unwrap();
                        core = guard;
                    }
                }
            }

            let priv_ = core.proto_priv_mut::<ReqPriv>();
            let dup = priv_.req_msg.as_ref().map(|m| m.duplicate());
            priv_.resend_deadline = dup.as_ref().map(|_| Instant::now() + priv_.retry);
            dup
        };

        if let Some(msg) = retry_msg {
            debug!("[req] resending unanswered request");
            let _ = socket.uwq().put(msg, None);
        }
    }
}
