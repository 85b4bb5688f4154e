// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Dial and listen supervisors (spec.md §4.5): own a `Dialer` or
//! `Listener`, keep the socket supplied with pipes, and reconnect a
//! dropped dial endpoint with back-off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::socket::Socket;
use crate::transport::{Dialer, Listener};

struct Backoff {
    min: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration) -> Backoff {
        Backoff { min, current: min }
    }

    fn reset(&mut self, min: Duration) {
        self.min = min;
        self.current = min;
    }

    fn next_delay(&mut self, max: Duration) -> Duration {
        let delay = self.current;
        let max = if max < self.min { self.min } else { max };
        self.current = std::cmp::min(self.current.saturating_mul(2), max);
        delay
    }
}

enum Resolver {
    Dial(Arc<dyn Dialer>),
    Listen(Arc<dyn Listener>),
}

impl Resolver {
    fn close(&self) {
        match self {
            Resolver::Dial(d) => d.close(),
            Resolver::Listen(l) => l.close(),
        }
    }
}

pub struct Endpoint {
    name: String,
    stopping: Arc<AtomicBool>,
    resolver: Resolver,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    pub(crate) fn dial(socket: &Arc<Socket>, name: String, dialer: Box<dyn Dialer>) -> Arc<Endpoint> {
        let dialer: Arc<dyn Dialer> = Arc::from(dialer);
        let stopping = Arc::new(AtomicBool::new(false));
        let socket_weak = Arc::downgrade(socket);
        let thread_stopping = stopping.clone();
        let thread_name = name.clone();
        let thread_dialer = dialer.clone();
        let handle = thread::spawn(move || dial_loop(socket_weak, thread_name, thread_dialer, thread_stopping));
        Arc::new(Endpoint {
            name,
            stopping,
            resolver: Resolver::Dial(dialer),
            supervisor: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn listen(socket: &Arc<Socket>, name: String, listener: Box<dyn Listener>) -> Arc<Endpoint> {
        let listener: Arc<dyn Listener> = Arc::from(listener);
        let stopping = Arc::new(AtomicBool::new(false));
        let socket_weak = Arc::downgrade(socket);
        let thread_stopping = stopping.clone();
        let thread_name = name.clone();
        let thread_listener = listener.clone();
        let handle = thread::spawn(move || listen_loop(socket_weak, thread_name, thread_listener, thread_stopping));
        Arc::new(Endpoint {
            name,
            stopping,
            resolver: Resolver::Listen(listener),
            supervisor: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tells the supervisor to stop retrying and unblocks whatever
    /// blocking call it may currently be parked in (`accept`, or a dial
    /// loop's `Pipe::wait_closed`, the latter unblocked indirectly once
    /// the caller closes the endpoint's pipes). Does not wait for the
    /// supervisor thread to exit — call `join` for that, after pipes
    /// have been closed.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.resolver.close();
    }

    /// Waits for the supervisor thread to exit. Must only be called
    /// after `request_stop` and after any pipe owned by this endpoint
    /// has been closed, or a dial supervisor parked in
    /// `Pipe::wait_closed` will block forever.
    pub fn join(&self) {
        if let Some(h) = self.supervisor.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Convenience for tests and call sites that don't need the
    /// stop/join split: stop and wait in one call.
    pub fn stop(&self) {
        self.request_stop();
        self.join();
    }
}

fn dial_loop(socket: Weak<Socket>, name: String, dialer: Arc<dyn Dialer>, stopping: Arc<AtomicBool>) {
    let mut backoff = Backoff::new(Duration::from_millis(100));
    loop {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        let socket = match socket.upgrade() {
            Some(s) => s,
            None => return,
        };
        if socket.core().lock().unwrap().closing {
            return;
        }

        match dialer.dial() {
            Ok(transport) => {
                let pipe = socket.create_pipe(transport);
                match socket.start_pipe(pipe.clone()) {
                    Ok(()) => {
                        let min = socket.core().lock().unwrap().opts.reconn_min;
                        backoff.reset(min);
                        debug!("[{}] dialed pipe connected", name);
                        pipe.wait_closed();
                    }
                    Err(e) => {
                        warn!("[{}] peer rejected during pipe_add: {}", name, e);
                        pipe.close();
                        let max = socket.core().lock().unwrap().opts.reconn_max;
                        let delay = backoff.next_delay(max);
                        thread::sleep(delay);
                    }
                }
            }
            Err(e) => {
                let max = socket.core().lock().unwrap().opts.reconn_max;
                let delay = backoff.next_delay(max);
                warn!("[{}] dial failed ({}), retrying in {:?}", name, e, delay);
                thread::sleep(delay);
            }
        }
    }
}

fn listen_loop(socket: Weak<Socket>, name: String, listener: Arc<dyn Listener>, stopping: Arc<AtomicBool>) {
    loop {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        let socket = match socket.upgrade() {
            Some(s) => s,
            None => return,
        };
        if socket.core().lock().unwrap().closing {
            return;
        }

        match listener.accept() {
            Ok(transport) => {
                let pipe = socket.create_pipe(transport);
                match socket.start_pipe(pipe.clone()) {
                    Ok(()) => debug!("[{}] accepted pipe started", name),
                    Err(e) => {
                        warn!("[{}] peer rejected during pipe_add: {}", name, e);
                        pipe.close();
                    }
                }
            }
            Err(e) => {
                warn!("[{}] accept failed: {}", name, e);
            }
        }
    }
}
