//! Save/restore hooks for the three managed types.

use std::cell::RefCell;
use std::rc::Rc;

use sockpool::{
    serialize_addr, serialize_data, unserialize_addr, unserialize_data, AddrRef, Engine, Host,
    SockAddr, SockData, Socket,
};

/// Minimal stand-in for the host's managed-object table: keys are
/// 1-based slots, 0 means "no reference".
#[derive(Default)]
struct KeyTable {
    addrs: RefCell<Vec<AddrRef>>,
}

impl KeyTable {
    fn insert(&self, addr: AddrRef) -> i32 {
        let mut addrs = self.addrs.borrow_mut();
        addrs.push(addr);
        addrs.len() as i32
    }
}

impl Host for KeyTable {
    fn key_of(&self, addr: &AddrRef) -> i32 {
        self.addrs
            .borrow()
            .iter()
            .position(|entry| Rc::ptr_eq(entry, addr))
            .map_or(0, |index| (index + 1) as i32)
    }

    fn addr_by_key(&self, key: i32) -> Option<AddrRef> {
        if key <= 0 {
            return None;
        }
        self.addrs.borrow().get((key - 1) as usize).cloned()
    }
}

#[test]
fn sock_data_copies_verbatim_and_bounded() {
    let data = SockData::from_string("Test1234");
    let mut buffer = [0u8; 64];
    let count = serialize_data(&data, &mut buffer);
    assert_eq!(&buffer[..count], b"Test1234");

    let restored = unserialize_data(&buffer[..count]);
    assert_eq!(restored.as_string(), "Test1234");

    // The host's buffer bounds the copy.
    let mut small = [0u8; 4];
    assert_eq!(serialize_data(&data, &mut small), 4);
    assert_eq!(&small, b"Test");
}

#[test]
fn sock_addr_round_trips_raw_storage() {
    let addr = SockAddr::from_ip("10.1.2.3", 4321);
    let mut buffer = [0u8; 256];
    let count = serialize_addr(&addr, &mut buffer);
    assert!(count > 0);

    let restored = unserialize_addr(&buffer[..count]);
    assert_eq!(restored, addr);
    assert_eq!(restored.ip(), "10.1.2.3");
    assert_eq!(restored.port(), 4321);
}

#[test]
fn short_addr_reads_default_to_zeroed_storage() {
    let addr = SockAddr::from_ip("10.1.2.3", 4321);
    let mut buffer = [0u8; 256];
    serialize_addr(&addr, &mut buffer);

    // Only the family survives a two-byte read.
    let restored = unserialize_addr(&buffer[..2]);
    assert_eq!(restored.family(), libc::AF_INET);
    assert_eq!(restored.ip(), "0.0.0.0");
    assert_eq!(restored.port(), 0);
}

#[test]
fn socket_serialization_is_lossy_but_keeps_identity() {
    let engine = Engine::new().unwrap();
    let host = KeyTable::default();

    let mut sock = Socket::create_udp(&engine);
    sock.set_tag("lobby");
    assert!(sock.bind(&SockAddr::from_ip("127.0.0.1", 0)));
    let local = sock.local();
    host.insert(Rc::clone(&local));

    let mut buffer = [0u8; 256];
    let count = sock.serialize(&host, &mut buffer);
    assert_eq!(count, 24 + "lobby".len());

    let mut restored = Socket::unserialize(&engine, &host, &buffer[..count]);
    assert!(!restored.valid());
    assert_eq!(restored.id(), -1);
    assert_eq!(restored.domain(), libc::AF_INET);
    assert_eq!(restored.socket_type(), libc::SOCK_DGRAM);
    assert_eq!(restored.protocol(), libc::IPPROTO_UDP);
    assert_eq!(restored.tag(), "lobby");

    // The local address came back as the same managed object.
    assert!(Rc::ptr_eq(&restored.local(), &local));
}

#[test]
fn socket_header_survives_without_addresses_or_tag() {
    let engine = Engine::new().unwrap();
    let host = KeyTable::default();

    let sock = Socket::create_tcp(&engine);
    let mut buffer = [0u8; 256];
    let count = sock.serialize(&host, &mut buffer);
    assert_eq!(count, 24);

    let mut restored = Socket::unserialize(&engine, &host, &buffer[..count]);
    assert_eq!(restored.socket_type(), libc::SOCK_STREAM);
    assert_eq!(restored.tag(), "");
    assert!(!restored.valid());
    // Key 0 links to nothing; the accessor falls back to a fresh
    // (invalid-socket) address.
    assert_eq!(restored.local().borrow().family(), 0);
}

#[test]
fn short_socket_reads_are_tolerated() {
    let engine = Engine::new().unwrap();
    let host = KeyTable::default();

    let restored = Socket::unserialize(&engine, &host, &[1, 0]);
    assert!(!restored.valid());
    assert_eq!(restored.domain(), 0);
    assert_eq!(restored.tag(), "");
}
