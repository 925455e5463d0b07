//! Embedder contract.
//!
//! The engine is built to live inside a scripting host that owns the
//! managed objects. Script-side address references are plain
//! `Rc<RefCell<_>>` — the host's refcount — and the host supplies the
//! key mapping used when sockets are serialized with address references
//! attached, plus the abort callback for unrecoverable pool failures.
//!
//! Serialization hooks write into a host-provided buffer and report the
//! bytes copied; readers tolerate short input by defaulting to zeroed
//! storage.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use crate::addr::SockAddr;
use crate::data::SockData;

/// A held-shared reference to a managed address.
pub type AddrRef = Rc<RefCell<SockAddr>>;

/// Called when the pool hits an unrecoverable failure. Crossing thread
/// boundaries is the point: the read thread reports through it.
pub type AbortHook = Box<dyn Fn(&str) + Send + Sync>;

/// Key mapping for managed address objects.
///
/// Key 0 means "no reference": `key_of` returns it for untracked
/// addresses and `addr_by_key(0)` resolves to `None`.
pub trait Host {
    fn key_of(&self, addr: &AddrRef) -> i32;
    fn addr_by_key(&self, key: i32) -> Option<AddrRef>;
}

/// Copies the blob verbatim, bounded by the buffer.
pub fn serialize_data(data: &SockData, buffer: &mut [u8]) -> usize {
    let count = data.as_bytes().len().min(buffer.len());
    buffer[..count].copy_from_slice(&data.as_bytes()[..count]);
    count
}

pub fn unserialize_data(bytes: &[u8]) -> SockData {
    SockData::from_bytes(bytes)
}

/// Copies the address storage verbatim, bounded by the buffer.
pub fn serialize_addr(addr: &SockAddr, buffer: &mut [u8]) -> usize {
    let count = addr.as_bytes().len().min(buffer.len());
    buffer[..count].copy_from_slice(&addr.as_bytes()[..count]);
    count
}

/// Zeroed storage overlaid with as many bytes as the input provides.
pub fn unserialize_addr(bytes: &[u8]) -> SockAddr {
    let mut addr = SockAddr::new(0);
    let count = bytes.len().min(mem::size_of::<libc::sockaddr_storage>());
    addr.as_bytes_mut()[..count].copy_from_slice(&bytes[..count]);
    addr
}
