//! Background receive engine.
//!
//! One worker thread per pool, started lazily when the first socket is
//! registered and exiting once the membership drains. The worker blocks
//! in readiness selection over the beacon plus every pooled descriptor
//! and drains readable ones into their incoming buffers. Membership
//! changes signal the beacon so the selector re-enters with the updated
//! registration set.
//!
//! Invariant I: the worker is running iff the membership is non-empty.
//! Invariant II: an invalidated socket is never a member.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::beacon::Beacon;
use crate::errors;
use crate::host::AbortHook;
use crate::socket::Channel;

/// Reserved selector token for the beacon descriptor.
const BEACON: Token = Token(0);

/// Upper bound of one read from a pooled descriptor.
pub(crate) const RECV_CHUNK: usize = 64 * 1024;

/// Grace period the destructor gives the worker before detaching it.
const JOIN_GRACE: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 256;

fn trace_pool() -> bool {
    static TRACE: OnceLock<bool> = OnceLock::new();
    *TRACE.get_or_init(|| std::env::var("SOCKPOOL_TRACE_POOL").as_deref() == Ok("1"))
}

pub(crate) struct Pool {
    /// Held by the worker for its whole run; membership changes go
    /// through the cloned registry instead.
    poll: Mutex<Poll>,
    registry: Registry,
    beacon: Beacon,
    members: Mutex<HashMap<Token, Arc<Channel>>>,
    running: AtomicBool,
    shutdown: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    next_token: AtomicUsize,
    abort: Mutex<Option<AbortHook>>,
}

impl Pool {
    pub(crate) fn new() -> io::Result<Pool> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let beacon = Beacon::new(&registry, BEACON)?;
        Ok(Pool {
            poll: Mutex::new(poll),
            registry,
            beacon,
            members: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
            next_token: AtomicUsize::new(BEACON.0 + 1),
            abort: Mutex::new(None),
        })
    }

    pub(crate) fn set_abort(&self, hook: AbortHook) {
        *self.abort.lock().unwrap() = Some(hook);
    }

    /// Registers a channel and makes sure the worker notices: the 0→1
    /// transition starts the thread, any other change wakes it.
    ///
    /// Invalidated or already-pooled channels are left alone.
    pub(crate) fn add(self: &Arc<Self>, channel: &Arc<Channel>) {
        let mut members = self.members.lock().unwrap();
        let mut state = channel.state.lock().unwrap();
        if state.token.is_some() {
            return;
        }
        let Some(io) = state.io.as_ref() else {
            return;
        };
        let fd = io.as_raw_fd();
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        if self
            .registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
            .is_err()
        {
            return;
        }
        state.token = Some(token);
        drop(state);
        members.insert(token, Arc::clone(channel));

        if !self.running.load(Ordering::Acquire) && !self.shutdown.load(Ordering::Acquire) {
            self.running.store(true, Ordering::Release);
            let pool = Arc::clone(self);
            let handle = thread::spawn(move || run(pool));
            *self.worker.lock().unwrap() = Some(handle);
        } else {
            self.beacon.signal();
        }
    }

    pub(crate) fn remove(&self, channel: &Arc<Channel>) {
        {
            let mut members = self.members.lock().unwrap();
            let mut state = channel.state.lock().unwrap();
            let Some(token) = state.token.take() else {
                return;
            };
            members.remove(&token);
            if let Some(io) = state.io.as_ref() {
                let fd = io.as_raw_fd();
                let _ = self.registry.deregister(&mut SourceFd(&fd));
            }
        }
        self.beacon.signal();
    }

    pub(crate) fn clear(&self) {
        {
            let mut members = self.members.lock().unwrap();
            for channel in members.values() {
                let mut state = channel.state.lock().unwrap();
                state.token = None;
                if let Some(io) = state.io.as_ref() {
                    let fd = io.as_raw_fd();
                    let _ = self.registry.deregister(&mut SourceFd(&fd));
                }
            }
            members.clear();
        }
        self.beacon.signal();
    }

    /// Whether the worker thread is live.
    pub(crate) fn active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Checks Invariants I and II.
    pub(crate) fn healthy(&self) -> bool {
        let members = self.members.lock().unwrap();
        if !members.is_empty() && !self.running.load(Ordering::Acquire) {
            return false;
        }
        members
            .values()
            .all(|channel| channel.state.lock().unwrap().io.is_some())
    }

    /// Stops the worker with a bounded grace period. A thread that does
    /// not come back in time is detached; it holds no locks the script
    /// side needs once `shutdown` is set.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.beacon.signal();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + JOIN_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }

    fn fail(&self, err: &io::Error) {
        let message = format!("socket pool selector failed: {err}");
        if let Some(abort) = self.abort.lock().unwrap().as_ref() {
            abort(&message);
        } else if trace_pool() {
            eprintln!("sockpool: {message}");
        }
    }
}

/// Reads per channel per selector iteration. The bound keeps one busy
/// sender from pinning the worker inside `drain`: the beacon, the
/// shutdown flag, and the other ready sockets are all serviced between
/// visits. Leftover readiness is re-armed instead of looped on.
const READS_PER_VISIT: usize = 4;

enum Drain {
    Keep,
    Evict,
    /// The read bound was hit with the descriptor still flowing; the
    /// caller must re-arm its registration so the selector reports it
    /// again.
    Rearm,
}

/// Drains one readable channel under its lock, at most
/// [`READS_PER_VISIT`] chunks.
///
/// Readiness is delivered edge-style, so a chunk that might leave bytes
/// behind cannot simply be abandoned until the next packet; the read
/// either continues to would-block or the registration is re-armed.
/// A would-block on the first read is just a spurious beacon wake.
fn drain(channel: &Channel, scratch: &mut [u8]) -> Drain {
    let mut state = channel.state.lock().unwrap();
    let mut reads = 0;
    loop {
        if reads == READS_PER_VISIT {
            return Drain::Rearm;
        }
        let Some(io) = state.io.as_ref() else {
            // Invalidated while we were selecting; drop the membership.
            return Drain::Evict;
        };
        let fd = io.as_raw_fd();
        let ret = unsafe {
            libc::recv(
                fd,
                scratch.as_mut_ptr() as *mut libc::c_void,
                scratch.len(),
                0,
            )
        };
        if ret < 0 {
            let errno = errors::raw_os_error(&io::Error::last_os_error());
            if errors::would_block(errno) {
                return Drain::Keep;
            }
            if errno == libc::EINTR {
                continue;
            }
            state.incoming.error = errno;
            return Drain::Evict;
        }
        let count = ret as usize;
        reads += 1;
        if channel.stream {
            state.incoming.append(&scratch[..count]);
            if count == 0 {
                // Peer closed; the EOF element is already queued.
                return Drain::Evict;
            }
        } else {
            // One element per datagram keeps the message boundary.
            state.incoming.push(&scratch[..count]);
        }
    }
}

fn run(pool: Arc<Pool>) {
    let mut poll = pool.poll.lock().unwrap();
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    let mut scratch = vec![0u8; RECV_CHUNK];
    if trace_pool() {
        eprintln!("sockpool: read thread started");
    }

    loop {
        events.clear();
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            pool.running.store(false, Ordering::Release);
            pool.fail(&err);
            return;
        }

        let mut signalled = false;
        let mut ready = Vec::new();
        for event in events.iter() {
            if event.token() == BEACON {
                signalled = true;
            } else {
                ready.push(event.token());
            }
        }
        if signalled {
            pool.beacon.reset();
            if trace_pool() {
                eprintln!("sockpool: read thread signalled");
            }
        }
        if pool.shutdown.load(Ordering::Acquire) {
            pool.running.store(false, Ordering::Release);
            if trace_pool() {
                eprintln!("sockpool: read thread cancelled");
            }
            return;
        }

        let targets: Vec<(Token, Arc<Channel>)> = {
            let members = pool.members.lock().unwrap();
            ready
                .iter()
                .filter_map(|token| {
                    members
                        .get(token)
                        .map(|channel| (*token, Arc::clone(channel)))
                })
                .collect()
        };

        let mut dead = Vec::new();
        let mut rearm = Vec::new();
        for (token, channel) in targets {
            match drain(&channel, &mut scratch) {
                Drain::Keep => {}
                Drain::Evict => dead.push(token),
                Drain::Rearm => rearm.push(token),
            }
        }

        {
            let mut members = pool.members.lock().unwrap();
            for token in dead {
                if let Some(channel) = members.remove(&token) {
                    let mut state = channel.state.lock().unwrap();
                    state.token = None;
                    if let Some(io) = state.io.as_ref() {
                        let fd = io.as_raw_fd();
                        let _ = pool.registry.deregister(&mut SourceFd(&fd));
                    }
                }
            }
            // Re-arming re-queues a still-readable descriptor with the
            // selector, so capped channels come back on the next
            // iteration without being looped on here.
            for token in rearm {
                if let Some(channel) = members.get(&token) {
                    let state = channel.state.lock().unwrap();
                    if let Some(io) = state.io.as_ref() {
                        let fd = io.as_raw_fd();
                        let _ = pool.registry.reregister(
                            &mut SourceFd(&fd),
                            token,
                            Interest::READABLE,
                        );
                    }
                }
            }
            // The next add restarts the thread; that path holds the
            // members lock, so this handoff cannot race.
            if members.is_empty() {
                pool.running.store(false, Ordering::Release);
                if trace_pool() {
                    eprintln!("sockpool: read thread finished");
                }
                return;
            }
        }
    }
}
