// In-process transport used only to exercise the socket/pipe/protocol
// core end-to-end. Not a shipped transport: it skips the real SP
// handshake and takes self/peer protocol ids directly from the test,
// since there is no wire to negotiate them over.

use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use nng_core::msgqueue::MsgQueue;
use nng_core::transport::{Dialer, Listener, TransportPipe};
use nng_core::Message;

const QUEUE_CAP: usize = 64;

struct Handoff {
    to_dialer: Arc<MsgQueue>,
    to_listener: Arc<MsgQueue>,
}

/// A rendezvous point a dialer and a listener both hold a handle to,
/// standing in for an address a real transport would bind/connect on.
pub struct MemHub {
    tx: mpsc::Sender<Option<Handoff>>,
    rx: Mutex<mpsc::Receiver<Option<Handoff>>>,
}

impl MemHub {
    pub fn new() -> Arc<MemHub> {
        let (tx, rx) = mpsc::channel();
        Arc::new(MemHub { tx, rx: Mutex::new(rx) })
    }
}

pub struct MemDialer {
    hub: Arc<MemHub>,
    self_proto: u16,
    peer_proto: u16,
}

impl MemDialer {
    pub fn new(hub: Arc<MemHub>, self_proto: u16, peer_proto: u16) -> MemDialer {
        MemDialer { hub, self_proto, peer_proto }
    }
}

impl Dialer for MemDialer {
    fn dial(&self) -> io::Result<Box<dyn TransportPipe>> {
        let to_dialer = Arc::new(MsgQueue::new(QUEUE_CAP));
        let to_listener = Arc::new(MsgQueue::new(QUEUE_CAP));
        self.hub
            .tx
            .send(Some(Handoff {
                to_dialer: to_dialer.clone(),
                to_listener: to_listener.clone(),
            }))
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "no listener on hub"))?;
        Ok(Box::new(MemTransportPipe {
            tx: to_listener,
            rx: to_dialer,
            self_proto: self.self_proto,
            peer_proto: self.peer_proto,
        }))
    }

    /// No in-flight blocking call to cancel: dialing this hub is a single
    /// non-blocking send, so there is nothing for an endpoint stop to
    /// unblock here.
    fn close(&self) {}
}

pub struct MemListener {
    hub: Arc<MemHub>,
    self_proto: u16,
    peer_proto: u16,
}

impl MemListener {
    pub fn new(hub: Arc<MemHub>, self_proto: u16, peer_proto: u16) -> MemListener {
        MemListener { hub, self_proto, peer_proto }
    }
}

impl Listener for MemListener {
    fn accept(&self) -> io::Result<Box<dyn TransportPipe>> {
        let handoff = {
            let rx = self.hub.rx.lock().unwrap();
            rx.recv().map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "hub closed"))?
        };
        match handoff {
            Some(handoff) => Ok(Box::new(MemTransportPipe {
                tx: handoff.to_dialer,
                rx: handoff.to_listener,
                self_proto: self.self_proto,
                peer_proto: self.peer_proto,
            })),
            None => Err(io::Error::new(io::ErrorKind::Interrupted, "listener closed")),
        }
    }

    /// Sends a shutdown sentinel so a thread parked in `accept`'s `recv`
    /// wakes up instead of blocking forever on a hub nothing will ever
    /// dial again.
    fn close(&self) {
        let _ = self.hub.tx.send(None);
    }
}

struct MemTransportPipe {
    tx: Arc<MsgQueue>,
    rx: Arc<MsgQueue>,
    self_proto: u16,
    peer_proto: u16,
}

impl TransportPipe for MemTransportPipe {
    /// Flattens header and body into one region before handing the
    /// message to the channel, the way a real wire transport would
    /// concatenate them into a single framed write — so protocols that
    /// reclassify a wire-level prefix back into a header (REQ, REP) are
    /// genuinely exercised rather than short-circuited by this
    /// transport happening to preserve the split in memory.
    fn send(&self, msg: Message) -> io::Result<()> {
        let mut bytes = msg.header().to_vec();
        bytes.extend_from_slice(msg.body());
        self.tx
            .put(Message::with_body(bytes), None)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    fn recv(&self) -> io::Result<Message> {
        self.rx
            .get(None)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    fn close(&self) {
        self.tx.close();
        self.rx.close();
    }

    fn peer_proto(&self) -> u16 {
        self.peer_proto
    }

    fn self_proto(&self) -> u16 {
        self.self_proto
    }
}
