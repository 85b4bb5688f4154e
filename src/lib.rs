// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Core runtime of a scalability protocols messaging library.
//!
//! A `Socket` is created for a `Proto` (PAIR, REQ or REP), then wired up
//! to peers with `Socket::dial`/`Socket::listen` against a `Dialer`/
//! `Listener` supplied by a transport. Concrete transports are not part
//! of this crate; `transport` only defines the boundary they implement.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nng_core::{global::Proto, socket::Socket};
//!
//! let socket: Arc<Socket> = Socket::create(Proto::Pair);
//! socket.close();
//! ```

pub mod endpoint;
pub mod error;
pub mod global;
pub mod msg;
pub mod msgqueue;
pub mod options;
pub mod pipe;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use error::{Error, Result};
pub use global::Proto;
pub use msg::Message;
pub use socket::Socket;
