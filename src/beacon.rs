//! Cross-thread wake primitive for the pool's selector.
//!
//! A pipe pair whose receive end sits in the selector's registration set
//! under a reserved token. Any thread signals by writing one byte; the
//! pool thread resets by draining. Multiple signals before a reset
//! collapse into a single readable event.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Mutex;

use mio::unix::pipe;
use mio::{Interest, Registry, Token};

pub(crate) struct Beacon {
    sender: pipe::Sender,
    receiver: Mutex<pipe::Receiver>,
}

impl Beacon {
    /// Creates the pipe pair and registers the receive end with the
    /// selector under `token`. Both ends are non-blocking.
    pub(crate) fn new(registry: &Registry, token: Token) -> io::Result<Beacon> {
        let (sender, mut receiver) = pipe::new()?;
        registry.register(&mut receiver, token, Interest::READABLE)?;
        Ok(Beacon {
            sender,
            receiver: Mutex::new(receiver),
        })
    }

    /// Wakes a concurrently blocking selector. Safe from any thread.
    ///
    /// A full pipe means a wake is already pending, so would-block is
    /// not an error here.
    pub(crate) fn signal(&self) {
        match (&self.sender).write(&[0]) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => self.signal(),
            Err(_) => {}
        }
    }

    /// Drains pending signals so the next one fires a fresh event.
    pub(crate) fn reset(&self) {
        let mut receiver = self.receiver.lock().unwrap();
        let mut scratch = [0u8; 64];
        loop {
            match receiver.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}
