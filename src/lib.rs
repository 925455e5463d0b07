//! Managed non-blocking TCP/UDP sockets for embedding script hosts.
//!
//! The crate exposes three managed object types — [`Socket`],
//! [`SockAddr`], [`SockData`] — plus the [`Engine`] that owns the
//! background receive machinery. Script code drives sockets from one
//! thread with a strict non-blocking contract: every operation either
//! succeeds, reports "try again later" (zero/`None` result with error
//! 0), or fails with a stored native error narrowed to a portable
//! [`SockError`].
//!
//! Inbound traffic is collected off-thread: sockets that connect,
//! accept, or bind for UDP join the engine's pool, whose single read
//! thread drains readable descriptors into per-socket buffers that
//! `recv`/`recv_data` consume. Outbound traffic is unbuffered — sends
//! hit the descriptor directly and report try-again on would-block.
//!
//! ```no_run
//! use sockpool::{Engine, SockAddr, Socket};
//!
//! let engine = Engine::new()?;
//! let mut socket = Socket::create_udp(&engine);
//! socket.bind(&SockAddr::from_ip("0.0.0.0", 0));
//! loop {
//!     match socket.recv() {
//!         Some(text) => println!("got {text}"),
//!         None if socket.last_error() == 0 => continue, // try again
//!         None => break,                                // failed
//!     }
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;
use std::sync::Arc;

mod addr;
mod beacon;
mod buffer;
mod data;
mod errors;
mod host;
mod pool;
mod socket;

pub use addr::SockAddr;
pub use buffer::Buffer;
pub use data::SockData;
pub use errors::{error_string, SockError};
pub use host::{
    serialize_addr, serialize_data, unserialize_addr, unserialize_data, AbortHook, AddrRef, Host,
};
pub use socket::Socket;

/// Owner of the socket pool: one per embedding, created at engine
/// startup and dropped at shutdown. Socket factories borrow it.
///
/// Teardown is deterministic: dropping the engine signals the read
/// thread and joins it with a bounded grace period.
pub struct Engine {
    pool: Arc<pool::Pool>,
}

impl Engine {
    pub fn new() -> io::Result<Engine> {
        Ok(Engine {
            pool: Arc::new(pool::Pool::new()?),
        })
    }

    /// Like [`Engine::new`], wiring the host's abort callback for
    /// unrecoverable pool failures.
    pub fn with_abort(abort: AbortHook) -> io::Result<Engine> {
        let engine = Engine::new()?;
        engine.pool.set_abort(abort);
        Ok(engine)
    }

    /// True while the pool invariants hold: the read thread runs iff
    /// sockets are pooled, and no pooled socket is invalidated.
    pub fn healthy(&self) -> bool {
        self.pool.healthy()
    }

    /// Whether the background read thread is currently live.
    pub fn pool_active(&self) -> bool {
        self.pool.active()
    }

    /// Unregisters every pooled socket. The sockets stay valid but stop
    /// receiving in the background; the read thread winds down.
    pub fn clear_pool(&self) {
        self.pool.clear();
    }

    pub(crate) fn pool(&self) -> Arc<pool::Pool> {
        Arc::clone(&self.pool)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}
