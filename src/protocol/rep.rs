// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! REP: the reply side of request/reply (spec.md §4.4 supplement). Fans
//! in requests from any number of REQ peers and routes each reply back
//! to the pipe its request arrived on. No device/raw forwarding and no
//! peer-id check beyond the transport handshake, per the supplement's
//! stated scope.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::global::{PipeId, Proto};
use crate::pipe::PipeHandle;
use crate::socket::{Socket, SocketCore};

use super::{Protocol, ProtoOpt, ProtoOptKind, ProtoOptValue};

struct RepPriv {
    pipes: HashMap<PipeId, PipeHandle>,
}

pub struct Rep;

impl Rep {
    pub fn new() -> Rep {
        Rep
    }
}

impl Protocol for Rep {
    fn proto(&self) -> Proto {
        Proto::Rep
    }

    fn init_priv(&self) -> Box<dyn Any + Send> {
        Box::new(RepPriv { pipes: HashMap::new() })
    }

    fn sock_close(&self, _core: &mut SocketCore) {}

    fn setopt(&self, _core: &mut SocketCore, _opt: ProtoOpt) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn getopt(&self, _core: &SocketCore, _kind: ProtoOptKind) -> Result<ProtoOptValue> {
        Err(Error::NotSupported)
    }

    /// A request's reply is routed by the `PipeId` stamped on the
    /// message by the pipe's own receiver worker; nothing to do here but
    /// pass it through.
    fn recv_filter(&self, _core: &mut SocketCore, msg: crate::msg::Message) -> Option<crate::msg::Message> {
        Some(msg)
    }

    /// Drops a reply that carries no pipe tag (sent without having
    /// received a matching request) or whose originating pipe has
    /// already closed — best effort, matching spec.md §4.3's
    /// best-effort send semantics.
    fn send_filter(&self, core: &mut SocketCore, msg: crate::msg::Message) -> Option<crate::msg::Message> {
        let priv_ = core.proto_priv_ref::<RepPriv>();
        match msg.pipe() {
            Some(id) if priv_.pipes.contains_key(&id) => Some(msg),
            Some(id) => {
                debug!("[rep] dropping reply for vanished pipe {:?}", id);
                None
            }
            None => {
                warn!("[rep] dropping reply sent without a matching request");
                None
            }
        }
    }

    fn pipe_add(&self, core: &mut SocketCore, pipe: &PipeHandle) -> Result<()> {
        if pipe.peer_proto() != Proto::Rep.peer_id() {
            return Err(Error::Proto);
        }
        core.proto_priv_mut::<RepPriv>().pipes.insert(pipe.id(), pipe.clone());
        Ok(())
    }

    fn pipe_rem(&self, core: &mut SocketCore, id: PipeId) {
        core.proto_priv_mut::<RepPriv>().pipes.remove(&id);
    }

    /// Only a receiver per pipe: replies are routed through the shared
    /// dispatcher spawned once by `spawn_socket_workers`, not a per-pipe
    /// sender, since routing needs the full pipe table.
    fn spawn_pipe_workers(&self, socket: &Arc<Socket>, pipe: &PipeHandle) -> Vec<JoinHandle<()>> {
        let socket = socket.clone();
        let pipe = pipe.clone();
        vec![thread::spawn(move || rep_receiver(socket, pipe))]
    }

    fn spawn_socket_workers(&self, socket: &Arc<Socket>) -> Vec<JoinHandle<()>> {
        let socket = socket.clone();
        vec![thread::spawn(move || rep_dispatcher(socket))]
    }
}

fn rep_receiver(socket: Arc<Socket>, pipe: PipeHandle) {
    loop {
        let mut msg = match pipe.recv() {
            Ok(msg) => msg,
            Err(e) => {
                debug!("[rep] pipe {:?} recv failed: {}", pipe.id(), e);
                socket.close_pipe(pipe.id());
                return;
            }
        };
        if msg.body_len() < 4 {
            continue;
        }
        msg.move_body_prefix_to_header(4);
        msg.set_pipe(Some(pipe.id()));
        if socket.urq().put_sig(msg, pipe.close_flag(), None).is_err() {
            socket.close_pipe(pipe.id());
            return;
        }
    }
}

/// Pulls replies already validated by `send_filter` off the shared
/// upper write queue and writes each one back to the pipe it is tagged
/// for.
fn rep_dispatcher(socket: Arc<Socket>) {
    loop {
        let msg = match socket.uwq().get(None) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let target = msg.pipe().and_then(|id| socket.core().lock().unwrap().proto_priv_ref::<RepPriv>().pipes.get(&id).cloned());
        match target {
            Some(pipe) => {
                if let Err(e) = pipe.send(msg) {
                    debug!("[rep] pipe send failed: {}", e);
                    socket.close_pipe(pipe.id());
                }
            }
            None => debug!("[rep] reply's pipe vanished between filter and dispatch"),
        }
    }
}
