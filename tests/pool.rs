//! Pool lifecycle: lazy thread start, beacon interruptions, eviction on
//! read errors, teardown.

use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use sockpool::{Engine, SockAddr, SockError, Socket};

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// A UDP socket that is pooled by virtue of being bound.
fn bound_udp(engine: &Engine) -> Socket {
    let mut sock = Socket::create_udp(engine);
    assert!(
        sock.bind(&SockAddr::from_ip("0.0.0.0", 0)),
        "{}",
        sock.error_string()
    );
    sock
}

fn local_port(sock: &mut Socket) -> u16 {
    sock.local().borrow().port()
}

#[test]
fn thread_runs_iff_sockets_are_pooled() {
    let engine = Engine::new().unwrap();
    assert!(engine.healthy());
    assert!(!engine.pool_active());

    let mut sock = bound_udp(&engine);
    assert!(wait_for(|| engine.pool_active(), Duration::from_millis(100)));
    assert!(engine.healthy());

    sock.close();
    assert!(wait_for(|| !engine.pool_active(), Duration::from_secs(1)));
    assert!(engine.healthy());
}

#[test]
fn thread_restarts_after_the_pool_drains() {
    let engine = Engine::new().unwrap();

    let mut first = bound_udp(&engine);
    assert!(wait_for(|| engine.pool_active(), Duration::from_millis(100)));
    first.close();
    assert!(wait_for(|| !engine.pool_active(), Duration::from_secs(1)));

    let mut second = bound_udp(&engine);
    assert!(wait_for(|| engine.pool_active(), Duration::from_millis(100)));
    let port = local_port(&mut second);

    // The restarted thread still delivers.
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"again", ("127.0.0.1", port)).unwrap();
    assert!(wait_for(
        || second.recv().is_some(),
        Duration::from_secs(1)
    ));
}

#[test]
fn second_add_interrupts_the_selector() {
    let engine = Engine::new().unwrap();
    let mut quiet = bound_udp(&engine);
    // The worker is already blocked on `quiet`; the second add has to
    // wake it before any traffic can be seen.
    let mut busy = bound_udp(&engine);
    let port = local_port(&mut busy);

    let payload = [0x12u8, 0x34, 0x56, 0x78];
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&payload, ("127.0.0.1", port)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut received = None;
    while Instant::now() < deadline {
        if let Some(data) = busy.recv_data() {
            received = Some(data);
            break;
        }
        assert_eq!(busy.last_error(), 0, "{}", busy.error_string());
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received.expect("datagram").as_bytes(), &payload);

    // The other pooled socket saw nothing.
    assert!(quiet.recv_data().is_none());
    assert_eq!(quiet.last_error(), 0);
    assert!(engine.healthy());
}

#[test]
fn read_errors_evict_and_invalidate() {
    let engine = Engine::new().unwrap();
    let mut sock = Socket::create_udp(&engine);

    // Connect to a loopback port nobody owns; the ICMP rejection of the
    // first datagram comes back as an asynchronous read error.
    let port = {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    assert!(sock.connect(&SockAddr::from_ip("127.0.0.1", port), false));
    assert!(sock.send("ping"), "{}", sock.error_string());

    assert!(wait_for(
        || sock.recv().is_none() && sock.last_error() != 0,
        Duration::from_secs(2)
    ));
    assert_eq!(sock.error_value(), SockError::Disconnected);
    assert!(!sock.valid());
    assert!(engine.healthy());
}

#[test]
fn clear_pool_stops_the_thread_and_stays_healthy() {
    let engine = Engine::new().unwrap();
    let _a = bound_udp(&engine);
    let _b = bound_udp(&engine);
    assert!(wait_for(|| engine.pool_active(), Duration::from_millis(100)));

    engine.clear_pool();
    assert!(wait_for(|| !engine.pool_active(), Duration::from_secs(1)));
    assert!(engine.healthy());
}

#[test]
fn teardown_with_pooled_sockets_is_bounded() {
    let engine = Engine::new().unwrap();
    let sock = bound_udp(&engine);
    assert!(wait_for(|| engine.pool_active(), Duration::from_millis(100)));

    let start = Instant::now();
    drop(engine);
    assert!(start.elapsed() < Duration::from_secs(2));
    drop(sock);
}
