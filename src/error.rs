// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;

/// The core's error codes, named after the NNG/SP error constants in
/// spec.md §6 rather than `std::io::ErrorKind`, since several of them
/// (`ESTATE`, `EPROTO`) have no stdlib equivalent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    NoMem,

    #[error("resource busy")]
    Busy,

    #[error("timed out")]
    TimedOut,

    #[error("closed")]
    Closed,

    #[error("invalid state")]
    State,

    #[error("protocol mismatch")]
    Proto,

    #[error("not supported")]
    NotSupported,

    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The subset of `Error` a protocol can assert as the socket's
/// send-error/recv-error state (spec.md §4.3). Kept separate from
/// `Error` itself — which also carries `Io(io::Error)` — so the
/// asserted code can be `Copy` and read out of `SocketCore` without a
/// clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockErr {
    NoMem,
    Busy,
    TimedOut,
    Closed,
    State,
    Proto,
    NotSupported,
}

impl From<SockErr> for Error {
    fn from(e: SockErr) -> Error {
        match e {
            SockErr::NoMem => Error::NoMem,
            SockErr::Busy => Error::Busy,
            SockErr::TimedOut => Error::TimedOut,
            SockErr::Closed => Error::Closed,
            SockErr::State => Error::State,
            SockErr::Proto => Error::Proto,
            SockErr::NotSupported => Error::NotSupported,
        }
    }
}
