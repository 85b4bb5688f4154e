//! End-to-end exercises of the socket/pipe/protocol core over the
//! in-process `MemTransport`, mirroring the scenarios a new transport
//! implementation is expected to satisfy.

mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nng_core::protocol::req::{ReqOpt, ReqOptKind, ReqOptValue};
use nng_core::protocol::{ProtoOpt, ProtoOptKind, ProtoOptValue};
use nng_core::{Error, Message, Proto, Socket};

use support::mem_transport::{MemDialer, MemHub, MemListener};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pair_ids() -> (u16, u16) {
    (Proto::Pair.self_id(), Proto::Pair.peer_id())
}

fn listen_pair(socket: &Arc<Socket>, hub: &Arc<MemHub>, name: &str) {
    let (self_id, peer_id) = pair_ids();
    socket
        .listen(name, Box::new(MemListener::new(hub.clone(), self_id, peer_id)))
        .unwrap();
}

fn dial_pair(socket: &Arc<Socket>, hub: &Arc<MemHub>, name: &str) {
    let (self_id, peer_id) = pair_ids();
    socket
        .dial(name, Box::new(MemDialer::new(hub.clone(), self_id, peer_id)))
        .unwrap();
}

fn roundtrip(from: &Arc<Socket>, to: &Arc<Socket>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    if from.sendmsg(Message::with_body(b"probe".to_vec()), Some(deadline)).is_err() {
        return false;
    }
    matches!(to.recvmsg(Some(deadline)), Ok(m) if m.body() == b"probe")
}

#[test]
fn s1_pair_echo() {
    init();
    let hub = MemHub::new();

    let a = Socket::create(Proto::Pair);
    listen_pair(&a, &hub, "s1");

    let b = Socket::create(Proto::Pair);
    dial_pair(&b, &hub, "s1");

    thread::sleep(Duration::from_millis(100));

    a.sendmsg(Message::with_body(b"hello".to_vec()), None).unwrap();
    let got = b.recvmsg(Some(Instant::now() + Duration::from_secs(2))).unwrap();
    assert_eq!(got.body(), b"hello");

    a.close();
    b.close();
}

#[test]
fn s2_pair_exclusion_then_reconnect() {
    init();
    let hub_b = MemHub::new();
    let hub_c = MemHub::new();

    let a = Socket::create(Proto::Pair);
    listen_pair(&a, &hub_b, "s2-b");
    listen_pair(&a, &hub_c, "s2-c");

    let b = Socket::create(Proto::Pair);
    dial_pair(&b, &hub_b, "s2-b");
    let c = Socket::create(Proto::Pair);
    dial_pair(&c, &hub_c, "s2-c");

    thread::sleep(Duration::from_millis(150));

    let b_ok = roundtrip(&a, &b, Duration::from_millis(300));
    let c_ok = roundtrip(&a, &c, Duration::from_millis(300));
    assert!(b_ok ^ c_ok, "exactly one of the two peers should be attached to A");

    let (winner, loser) = if b_ok { (b, c) } else { (c, b) };
    winner.close();

    let reconnected = (0..20).any(|_| {
        thread::sleep(Duration::from_millis(150));
        roundtrip(&a, &loser, Duration::from_millis(200))
    });
    assert!(reconnected, "the rejected peer should attach once the winner closes");

    a.close();
    loser.close();
}

fn listen_rep(socket: &Arc<Socket>, hub: &Arc<MemHub>, name: &str) {
    socket
        .listen(name, Box::new(MemListener::new(hub.clone(), Proto::Rep.self_id(), Proto::Rep.peer_id())))
        .unwrap();
}

fn dial_req(socket: &Arc<Socket>, hub: &Arc<MemHub>, name: &str) {
    socket
        .dial(name, Box::new(MemDialer::new(hub.clone(), Proto::Req.self_id(), Proto::Req.peer_id())))
        .unwrap();
}

/// Builds the reply the application would send back for a request it
/// just received: same header (the correlation id) and pipe tag, a
/// fresh body.
fn make_reply(request: &Message, body: Vec<u8>) -> Message {
    let mut reply = Message::new();
    reply.set_pipe(request.pipe());
    reply.append_header(request.header());
    reply.append_body(&body);
    reply
}

#[test]
fn s3_req_rep_roundtrip_then_estate() {
    init();
    let hub = MemHub::new();

    let s = Socket::create(Proto::Rep);
    listen_rep(&s, &hub, "s3");

    let c = Socket::create(Proto::Req);
    c.setopt_proto(ProtoOpt::Req(ReqOpt::ResendTime(Duration::from_secs(10)))).unwrap();
    assert_eq!(
        c.getopt_proto(ProtoOptKind::Req(ReqOptKind::ResendTime)).unwrap(),
        ProtoOptValue::Req(ReqOptValue::ResendTime(Duration::from_secs(10)))
    );
    dial_req(&c, &hub, "s3");

    thread::sleep(Duration::from_millis(100));

    c.sendmsg(Message::with_body(vec![0x01]), None).unwrap();

    let request = s.recvmsg(Some(Instant::now() + Duration::from_secs(2))).unwrap();
    assert_eq!(request.header_len(), 4);
    assert_eq!(request.body(), &[0x01]);

    s.sendmsg(make_reply(&request, vec![0x02, 0x03]), None).unwrap();

    let reply = c.recvmsg(Some(Instant::now() + Duration::from_secs(2))).unwrap();
    assert_eq!(reply.body(), &[0x02, 0x03]);

    let err = c.recvmsg(Some(Instant::now() + Duration::from_millis(200))).unwrap_err();
    assert!(matches!(err, Error::State), "a second recv without a new send must fail ESTATE");

    s.close();
    c.close();
}

#[test]
fn s4_req_retries_until_delayed_reply_arrives() {
    init();
    let hub = MemHub::new();

    let s = Socket::create(Proto::Rep);
    listen_rep(&s, &hub, "s4");

    let c = Socket::create(Proto::Req);
    c.setopt_proto(ProtoOpt::Req(ReqOpt::ResendTime(Duration::from_millis(200)))).unwrap();
    dial_req(&c, &hub, "s4");

    thread::sleep(Duration::from_millis(100));

    c.sendmsg(Message::with_body(vec![0xAA]), None).unwrap();

    // The unanswered request should reach S roughly every 200ms while
    // the reply is withheld: collect receipts for ~650ms.
    let mut hits = Vec::new();
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(650) {
        if let Ok(req) = s.recvmsg(Some(Instant::now() + Duration::from_millis(50))) {
            hits.push((start.elapsed(), req));
        }
    }
    assert!(hits.len() >= 3, "expected at least 3 resends within 650ms, got {}", hits.len());

    let (_, last_request) = hits.pop().unwrap();
    s.sendmsg(make_reply(&last_request, vec![0xBB]), None).unwrap();

    let reply = c.recvmsg(Some(Instant::now() + Duration::from_secs(1))).unwrap();
    assert_eq!(reply.body(), &[0xBB]);

    // No further resend should show up now that the request is answered.
    thread::sleep(Duration::from_millis(400));
    assert!(s.recvmsg(Some(Instant::now() + Duration::from_millis(50))).is_err());

    s.close();
    c.close();
}

#[test]
fn s5_second_send_cancels_first_reply() {
    init();
    let hub = MemHub::new();

    let s = Socket::create(Proto::Rep);
    listen_rep(&s, &hub, "s5");

    let c = Socket::create(Proto::Req);
    c.setopt_proto(ProtoOpt::Req(ReqOpt::ResendTime(Duration::from_secs(10)))).unwrap();
    dial_req(&c, &hub, "s5");

    thread::sleep(Duration::from_millis(100));

    c.sendmsg(Message::with_body(vec![1]), None).unwrap();
    let req1 = s.recvmsg(Some(Instant::now() + Duration::from_secs(2))).unwrap();

    c.sendmsg(Message::with_body(vec![2]), None).unwrap();
    let req2 = s.recvmsg(Some(Instant::now() + Duration::from_secs(2))).unwrap();

    // A stale reply to req1 must be dropped by C.
    s.sendmsg(make_reply(&req1, vec![0xDE, 0xAD]), None).unwrap();
    assert!(
        c.recvmsg(Some(Instant::now() + Duration::from_millis(300))).is_err(),
        "a reply correlated to the superseded request must not surface"
    );

    s.sendmsg(make_reply(&req2, vec![0xBE, 0xEF]), None).unwrap();
    let reply = c.recvmsg(Some(Instant::now() + Duration::from_secs(2))).unwrap();
    assert_eq!(reply.body(), &[0xBE, 0xEF]);

    s.close();
    c.close();
}

#[test]
#[ignore = "exercises 1000 threads; run explicitly with `cargo test -- --ignored`"]
fn s6_concurrent_senders_survive_a_racing_close() {
    init();
    let hub = MemHub::new();

    let a = Socket::create(Proto::Pair);
    listen_pair(&a, &hub, "s6");
    let b = Socket::create(Proto::Pair);
    dial_pair(&b, &hub, "s6");

    thread::sleep(Duration::from_millis(100));

    let senders: Vec<_> = (0..1000)
        .map(|i| {
            let a = a.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(2);
                match a.sendmsg(Message::with_body(vec![(i % 256) as u8]), Some(deadline)) {
                    Ok(()) | Err(Error::Closed) | Err(Error::TimedOut) => true,
                    Err(_) => false,
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    let closer = {
        let a = a.clone();
        thread::spawn(move || a.close())
    };

    let mut ok = true;
    for h in senders {
        ok &= h.join().unwrap();
    }
    closer.join().unwrap();

    assert!(ok, "every sendmsg must resolve with OK, ECLOSED or ETIMEDOUT, never anything else");
    b.close();
}
