// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! PAIR: exactly one peer at a time, header-less, verbatim bodies
//! (spec.md §4.4.1).

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::error::{Error, Result};
use crate::global::{PipeId, Proto};
use crate::pipe::PipeHandle;
use crate::socket::{Socket, SocketCore};

use super::{Protocol, ProtoOpt, ProtoOptKind, ProtoOptValue};

struct PairPriv {
    peer: Option<PipeId>,
}

pub struct Pair;

impl Pair {
    pub fn new() -> Pair {
        Pair
    }
}

impl Protocol for Pair {
    fn proto(&self) -> Proto {
        Proto::Pair
    }

    fn init_priv(&self) -> Box<dyn Any + Send> {
        Box::new(PairPriv { peer: None })
    }

    fn sock_close(&self, _core: &mut SocketCore) {}

    fn setopt(&self, _core: &mut SocketCore, _opt: ProtoOpt) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn getopt(&self, _core: &SocketCore, _kind: ProtoOptKind) -> Result<ProtoOptValue> {
        Err(Error::NotSupported)
    }

    fn pipe_add(&self, core: &mut SocketCore, pipe: &PipeHandle) -> Result<()> {
        let priv_ = core.proto_priv_mut::<PairPriv>();
        if priv_.peer.is_some() {
            return Err(Error::Busy);
        }
        priv_.peer = Some(pipe.id());
        Ok(())
    }

    fn pipe_rem(&self, core: &mut SocketCore, id: PipeId) {
        let priv_ = core.proto_priv_mut::<PairPriv>();
        if priv_.peer == Some(id) {
            priv_.peer = None;
        }
    }

    fn spawn_pipe_workers(&self, socket: &Arc<Socket>, pipe: &PipeHandle) -> Vec<JoinHandle<()>> {
        let sender_socket = socket.clone();
        let sender_pipe = pipe.clone();
        let sender = thread::spawn(move || pair_sender(sender_socket, sender_pipe));

        let receiver_socket = socket.clone();
        let receiver_pipe = pipe.clone();
        let receiver = thread::spawn(move || pair_receiver(receiver_socket, receiver_pipe));

        vec![sender, receiver]
    }
}

fn pair_sender(socket: Arc<Socket>, pipe: PipeHandle) {
    loop {
        let msg = match socket.uwq().get_sig(pipe.close_flag(), None) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        if let Err(e) = pipe.send(msg) {
            debug!("[pair] pipe {:?} send failed: {}", pipe.id(), e);
            socket.close_pipe(pipe.id());
            return;
        }
    }
}

fn pair_receiver(socket: Arc<Socket>, pipe: PipeHandle) {
    loop {
        let msg = match pipe.recv() {
            Ok(msg) => msg,
            Err(e) => {
                debug!("[pair] pipe {:?} recv failed: {}", pipe.id(), e);
                socket.close_pipe(pipe.id());
                return;
            }
        };
        if socket.urq().put_sig(msg, pipe.close_flag(), None).is_err() {
            socket.close_pipe(pipe.id());
            return;
        }
    }
}
