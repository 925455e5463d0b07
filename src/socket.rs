//! Managed socket object.
//!
//! Everything here is non-blocking except synchronous `connect` and the
//! bounded wait inside `close`. Operations report through three shapes:
//! a success value, a try-again signal (`None`/`false` with the stored
//! error zeroed), or a failure (`None`/`false` with a non-zero stored
//! error readable through `error_value`/`error_string`).
//!
//! The descriptor and the incoming buffer live in a [`Channel`] shared
//! with the pool's read thread; the channel lock serializes script-side
//! consumption with the background drain.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Type};

use crate::addr::SockAddr;
use crate::buffer::Buffer;
use crate::data::SockData;
use crate::errors::{self, SockError};
use crate::host::{AddrRef, Host};
use crate::pool::{Pool, RECV_CHUNK};
use crate::Engine;

/// Grace period a stream close waits for the peer to answer the
/// shutdown. The legacy implementation passed 500 µs here while calling
/// it half a second; this one really waits 500 ms.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Serialized header: domain, type, protocol, error, local key,
/// remote key, all host-endian i32.
const SERIAL_HEADER: usize = 6 * 4;

/// State shared between a socket and the pool's read thread.
///
/// `io` doubles as the validity flag: `None` is the invalidated state
/// and such a channel can never (re-)enter the pool.
pub(crate) struct Channel {
    /// Stream framing (`append`) versus datagram framing (`push`).
    pub(crate) stream: bool,
    pub(crate) state: Mutex<ChannelState>,
}

pub(crate) struct ChannelState {
    pub(crate) io: Option<socket2::Socket>,
    pub(crate) incoming: Buffer,
    /// Selector token while pooled.
    pub(crate) token: Option<mio::Token>,
}

impl Channel {
    fn new(stream: bool, io: Option<socket2::Socket>) -> Arc<Channel> {
        Arc::new(Channel {
            stream,
            state: Mutex::new(ChannelState {
                io,
                incoming: Buffer::new(),
                token: None,
            }),
        })
    }
}

pub struct Socket {
    pool: Arc<Pool>,
    channel: Arc<Channel>,
    domain: i32,
    socket_type: i32,
    protocol: i32,
    error: i32,
    local: Option<AddrRef>,
    remote: Option<AddrRef>,
    tag: String,
}

impl Socket {
    /// Creates a socket for an explicit domain/type/protocol triple.
    ///
    /// The descriptor is switched to non-blocking unconditionally; a
    /// creation failure leaves an invalid socket whose stored error
    /// says why.
    pub fn create(engine: &Engine, domain: i32, socket_type: i32, protocol: i32) -> Socket {
        let mut error = 0;
        let io = match socket2::Socket::new(
            Domain::from(domain),
            Type::from(socket_type),
            Some(Protocol::from(protocol)),
        ) {
            Ok(io) => {
                if let Err(err) = io.set_nonblocking(true) {
                    error = errors::raw_os_error(&err);
                }
                Some(io)
            }
            Err(err) => {
                error = errors::raw_os_error(&err);
                None
            }
        };
        Socket {
            pool: engine.pool(),
            channel: Channel::new(socket_type == libc::SOCK_STREAM, io),
            domain,
            socket_type,
            protocol,
            error,
            local: None,
            remote: None,
            tag: String::new(),
        }
    }

    pub fn create_udp(engine: &Engine) -> Socket {
        Socket::create(engine, libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP)
    }

    pub fn create_tcp(engine: &Engine) -> Socket {
        Socket::create(engine, libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP)
    }

    pub fn create_udp6(engine: &Engine) -> Socket {
        Socket::create(engine, libc::AF_INET6, libc::SOCK_DGRAM, libc::IPPROTO_UDP)
    }

    pub fn create_tcp6(engine: &Engine) -> Socket {
        Socket::create(engine, libc::AF_INET6, libc::SOCK_STREAM, libc::IPPROTO_TCP)
    }

    pub fn valid(&self) -> bool {
        self.channel.state.lock().unwrap().io.is_some()
    }

    /// Raw descriptor, or -1 once invalidated.
    pub fn id(&self) -> i32 {
        self.channel
            .state
            .lock()
            .unwrap()
            .io
            .as_ref()
            .map_or(-1, |io| io.as_raw_fd())
    }

    pub fn domain(&self) -> i32 {
        self.domain
    }

    pub fn socket_type(&self) -> i32 {
        self.socket_type
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.tag = tag.to_string();
    }

    /// Native code of the last operation.
    pub fn last_error(&self) -> i32 {
        self.error
    }

    pub fn error_value(&self) -> SockError {
        SockError::classify(self.error)
    }

    pub fn error_string(&self) -> String {
        errors::error_string(self.error)
    }

    /// The bound address, materialized on first access and kept for the
    /// socket's lifetime. Bind refreshes it.
    pub fn local(&mut self) -> AddrRef {
        if self.local.is_none() {
            let mut addr = SockAddr::new(0);
            match self.channel.state.lock().unwrap().io.as_ref() {
                Some(io) => match io.local_addr() {
                    Ok(raw) => {
                        addr = SockAddr::from_socket2(&raw);
                        self.error = 0;
                    }
                    Err(err) => self.error = errors::raw_os_error(&err),
                },
                None => self.error = libc::EBADF,
            }
            self.local = Some(Rc::new(RefCell::new(addr)));
        }
        Rc::clone(self.local.as_ref().unwrap())
    }

    /// The peer address, materialized on first access. Connect and
    /// accept refresh it.
    pub fn remote(&mut self) -> AddrRef {
        if self.remote.is_none() {
            let mut addr = SockAddr::new(0);
            match self.channel.state.lock().unwrap().io.as_ref() {
                Some(io) => match io.peer_addr() {
                    Ok(raw) => {
                        addr = SockAddr::from_socket2(&raw);
                        self.error = 0;
                    }
                    Err(err) => self.error = errors::raw_os_error(&err),
                },
                None => self.error = libc::EBADF,
            }
            self.remote = Some(Rc::new(RefCell::new(addr)));
        }
        Rc::clone(self.remote.as_ref().unwrap())
    }

    fn refresh_local(&self) {
        if let Some(cell) = &self.local {
            if let Some(io) = self.channel.state.lock().unwrap().io.as_ref() {
                if let Ok(raw) = io.local_addr() {
                    *cell.borrow_mut() = SockAddr::from_socket2(&raw);
                }
            }
        }
    }

    fn refresh_remote(&self) {
        if let Some(cell) = &self.remote {
            if let Some(io) = self.channel.state.lock().unwrap().io.as_ref() {
                if let Ok(raw) = io.peer_addr() {
                    *cell.borrow_mut() = SockAddr::from_socket2(&raw);
                }
            }
        }
    }

    /// Binds to a local address. A freshly bound UDP socket enters the
    /// pool right away: it can receive without a remote.
    pub fn bind(&mut self, addr: &SockAddr) -> bool {
        let result = {
            let state = self.channel.state.lock().unwrap();
            match state.io.as_ref() {
                Some(io) => io.bind(&addr.to_socket2()),
                None => Err(io::Error::from_raw_os_error(libc::EBADF)),
            }
        };
        match result {
            Ok(()) => {
                self.error = 0;
                self.refresh_local();
                if self.socket_type == libc::SOCK_DGRAM {
                    self.pool.add(&self.channel);
                }
                true
            }
            Err(err) => {
                self.error = errors::raw_os_error(&err);
                false
            }
        }
    }

    /// A negative backlog selects the platform maximum.
    pub fn listen(&mut self, backlog: i32) -> bool {
        let backlog = if backlog < 0 { libc::SOMAXCONN } else { backlog };
        let result = {
            let state = self.channel.state.lock().unwrap();
            match state.io.as_ref() {
                Some(io) => io.listen(backlog),
                None => Err(io::Error::from_raw_os_error(libc::EBADF)),
            }
        };
        match result {
            Ok(()) => {
                self.error = 0;
                true
            }
            Err(err) => {
                self.error = errors::raw_os_error(&err);
                false
            }
        }
    }

    /// Connects to a remote address and, on success, joins the pool.
    /// UDP "connects" by binding the remote, so it succeeds at once.
    ///
    /// Synchronous mode flips the descriptor to blocking for the one
    /// call. Asynchronous mode translates the in-progress family into
    /// the try-again signal: `false` with error 0.
    pub fn connect(&mut self, addr: &SockAddr, async_mode: bool) -> bool {
        let target = addr.to_socket2();
        let result = {
            let state = self.channel.state.lock().unwrap();
            match state.io.as_ref() {
                Some(io) => {
                    if async_mode {
                        io.connect(&target)
                    } else {
                        let _ = io.set_nonblocking(false);
                        let result = io.connect(&target);
                        let _ = io.set_nonblocking(true);
                        result
                    }
                }
                None => Err(io::Error::from_raw_os_error(libc::EBADF)),
            }
        };
        match result {
            Ok(()) => {
                self.error = 0;
                self.refresh_remote();
                self.pool.add(&self.channel);
                true
            }
            Err(err) => {
                let errno = errors::raw_os_error(&err);
                self.error = if errors::connect_pending(errno) { 0 } else { errno };
                false
            }
        }
    }

    /// Non-blocking accept. `None` with error 0 means try again; a
    /// returned connection inherits the triple, is non-blocking, and is
    /// already pooled.
    pub fn accept(&mut self) -> Option<Socket> {
        let result = {
            let state = self.channel.state.lock().unwrap();
            match state.io.as_ref() {
                Some(io) => io.accept(),
                None => Err(io::Error::from_raw_os_error(libc::EBADF)),
            }
        };
        match result {
            Ok((io, _)) => {
                self.error = 0;
                let _ = io.set_nonblocking(true);
                let conn = Socket {
                    pool: Arc::clone(&self.pool),
                    channel: Channel::new(self.channel.stream, Some(io)),
                    domain: self.domain,
                    socket_type: self.socket_type,
                    protocol: self.protocol,
                    error: 0,
                    local: None,
                    remote: None,
                    tag: String::new(),
                };
                self.pool.add(&conn.channel);
                Some(conn)
            }
            Err(err) => {
                let errno = errors::raw_os_error(&err);
                self.error = if errors::would_block(errno) { 0 } else { errno };
                None
            }
        }
    }

    /// Closes the socket. Streams first shut down the send side and
    /// wait up to [`CLOSE_GRACE`] for the peer to answer; if it does,
    /// the socket stays alive so queued data and the end-of-stream can
    /// still be received (the read thread invalidation path takes over
    /// from there). Datagram sockets and unanswered streams close now.
    pub fn close(&mut self) {
        if self.channel.stream {
            let fd = {
                let state = self.channel.state.lock().unwrap();
                match state.io.as_ref() {
                    Some(io) => {
                        let _ = io.shutdown(Shutdown::Write);
                        Some(io.as_raw_fd())
                    }
                    None => None,
                }
            };
            // The wait runs without the channel lock: the read thread
            // must be able to keep draining this and other sockets
            // while we sit in poll. Nothing invalidates the descriptor
            // meanwhile — only the script thread does that.
            if let Some(fd) = fd {
                if wait_readable(fd, CLOSE_GRACE) {
                    self.error = 0;
                    return;
                }
            }
        }
        self.pool.remove(&self.channel);
        self.channel.state.lock().unwrap().io = None;
        self.error = 0;
    }

    /// Sends a string to the connected remote. `false` with error 0
    /// means try again later.
    pub fn send(&mut self, text: &str) -> bool {
        self.send_bytes(text.as_bytes())
    }

    pub fn send_data(&mut self, data: &SockData) -> bool {
        self.send_bytes(data.as_bytes())
    }

    fn send_bytes(&mut self, mut bytes: &[u8]) -> bool {
        let state = self.channel.state.lock().unwrap();
        let Some(io) = state.io.as_ref() else {
            self.error = libc::EBADF;
            return false;
        };
        while !bytes.is_empty() {
            match io.send(bytes) {
                Ok(count) => bytes = &bytes[count..],
                Err(err) => {
                    let errno = errors::raw_os_error(&err);
                    if errno == libc::EINTR {
                        continue;
                    }
                    self.error = if errors::would_block(errno) { 0 } else { errno };
                    return false;
                }
            }
        }
        self.error = 0;
        true
    }

    /// Sends a string to an explicit address (datagram sockets).
    pub fn send_to(&mut self, addr: &SockAddr, text: &str) -> bool {
        self.send_bytes_to(addr, text.as_bytes())
    }

    pub fn send_data_to(&mut self, addr: &SockAddr, data: &SockData) -> bool {
        self.send_bytes_to(addr, data.as_bytes())
    }

    fn send_bytes_to(&mut self, addr: &SockAddr, mut bytes: &[u8]) -> bool {
        let target = addr.to_socket2();
        let state = self.channel.state.lock().unwrap();
        let Some(io) = state.io.as_ref() else {
            self.error = libc::EBADF;
            return false;
        };
        while !bytes.is_empty() {
            match io.send_to(bytes, &target) {
                Ok(count) => bytes = &bytes[count..],
                Err(err) => {
                    let errno = errors::raw_os_error(&err);
                    if errno == libc::EINTR {
                        continue;
                    }
                    self.error = if errors::would_block(errno) { 0 } else { errno };
                    return false;
                }
            }
        }
        self.error = 0;
        true
    }

    /// Consumes the next received string from the incoming buffer.
    ///
    /// `None` with error 0 means nothing has arrived yet. `None` with a
    /// non-zero error surfaces an asynchronous read failure and
    /// invalidates the socket. An empty string from a stream is the
    /// peer's close and also invalidates — the documented hazard being
    /// that stream data starting with a zero byte reads back the same
    /// way; binary protocols want [`Socket::recv_data`].
    pub fn recv(&mut self) -> Option<String> {
        let (span, stream_eof) = {
            let mut state = self.channel.state.lock().unwrap();
            if state.incoming.empty() {
                self.error = state.incoming.error;
                drop(state);
                if self.error != 0 {
                    // The read thread already evicted us; finish the job.
                    self.invalidate();
                }
                return None;
            }
            let head = state.incoming.front().unwrap();
            let end = head.iter().position(|&b| b == 0).unwrap_or(head.len());
            let span = String::from_utf8_lossy(&head[..end]).into_owned();
            if self.channel.stream {
                state.incoming.extract();
            } else {
                state.incoming.pop();
            }
            let stream_eof = span.is_empty() && self.channel.stream;
            (span, stream_eof)
        };
        self.error = 0;
        if stream_eof {
            self.invalidate();
        }
        Some(span)
    }

    /// Like [`Socket::recv`] but yields the whole head element with
    /// zero bytes intact, so an empty blob from a stream is a true
    /// end-of-stream.
    pub fn recv_data(&mut self) -> Option<SockData> {
        let (data, stream_eof) = {
            let mut state = self.channel.state.lock().unwrap();
            if state.incoming.empty() {
                self.error = state.incoming.error;
                drop(state);
                if self.error != 0 {
                    self.invalidate();
                }
                return None;
            }
            let head = state.incoming.front().unwrap().to_vec();
            state.incoming.pop();
            let stream_eof = head.is_empty() && self.channel.stream;
            (SockData::from_bytes(&head), stream_eof)
        };
        self.error = 0;
        if stream_eof {
            self.invalidate();
        }
        Some(data)
    }

    /// Receives one datagram directly from the descriptor, writing the
    /// sender into `source`. The stored error keeps the raw code, so an
    /// empty queue reads back as `PleaseTryAgain`.
    pub fn recv_from(&mut self, source: &mut SockAddr) -> Option<String> {
        self.recv_from_bytes(source).map(|bytes| {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        })
    }

    pub fn recv_data_from(&mut self, source: &mut SockAddr) -> Option<SockData> {
        self.recv_from_bytes(source)
            .map(|bytes| SockData::from_bytes(&bytes))
    }

    fn recv_from_bytes(&mut self, source: &mut SockAddr) -> Option<Vec<u8>> {
        let state = self.channel.state.lock().unwrap();
        let Some(io) = state.io.as_ref() else {
            self.error = libc::EBADF;
            return None;
        };
        let mut buffer = vec![0u8; RECV_CHUNK];
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::recvfrom(
                io.as_raw_fd(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if ret < 0 {
            self.error = errors::raw_os_error(&io::Error::last_os_error());
            return None;
        }
        self.error = 0;
        *source = SockAddr::from_raw_storage(storage);
        buffer.truncate(ret as usize);
        Some(buffer)
    }

    /// Reserved; reads nothing yet.
    pub fn get_option(&mut self, _level: i32, _option: i32) -> i32 {
        0
    }

    /// Reserved; writes nothing yet.
    pub fn set_option(&mut self, _level: i32, _option: i32, _value: i32) {}

    /// Writes the serialized form into `buffer` and reports the bytes
    /// copied. Sockets do not survive a save/restore cycle: only the
    /// triple, the last error, the address keys and the tag are kept.
    pub fn serialize(&self, host: &dyn Host, buffer: &mut [u8]) -> usize {
        let mut serial = Vec::with_capacity(SERIAL_HEADER + self.tag.len());
        let header = [
            self.domain,
            self.socket_type,
            self.protocol,
            self.error,
            self.local.as_ref().map_or(0, |addr| host.key_of(addr)),
            self.remote.as_ref().map_or(0, |addr| host.key_of(addr)),
        ];
        for value in header {
            serial.extend_from_slice(&value.to_ne_bytes());
        }
        serial.extend_from_slice(self.tag.as_bytes());
        let count = serial.len().min(buffer.len());
        buffer[..count].copy_from_slice(&serial[..count]);
        count
    }

    /// Rebuilds a socket from its serialized form. The result is born
    /// invalidated; addresses are re-linked through their keys.
    pub fn unserialize(engine: &Engine, host: &dyn Host, bytes: &[u8]) -> Socket {
        let mut header = [0i32; 6];
        for (index, slot) in header.iter_mut().enumerate() {
            let start = index * 4;
            if start + 4 <= bytes.len() {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes[start..start + 4]);
                *slot = i32::from_ne_bytes(raw);
            }
        }
        let tag = if bytes.len() > SERIAL_HEADER {
            String::from_utf8_lossy(&bytes[SERIAL_HEADER..]).into_owned()
        } else {
            String::new()
        };
        Socket {
            pool: engine.pool(),
            channel: Channel::new(header[1] == libc::SOCK_STREAM, None),
            domain: header[0],
            socket_type: header[1],
            protocol: header[2],
            error: header[3],
            local: host.addr_by_key(header[4]),
            remote: host.addr_by_key(header[5]),
            tag,
        }
    }

    /// Takes the descriptor out of the pool and out of service.
    fn invalidate(&mut self) {
        self.pool.remove(&self.channel);
        self.channel.state.lock().unwrap().io = None;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Dispose semantics: forced close, no graceful shutdown.
        self.pool.remove(&self.channel);
        if let Ok(mut state) = self.channel.state.lock() {
            state.io = None;
        }
    }
}

/// Single-descriptor readable wait, used by the stream close grace.
fn wait_readable(fd: RawFd, timeout: Duration) -> bool {
    let mut poll_fd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let ret = unsafe { libc::poll(&mut poll_fd, 1, timeout_ms) };
    ret > 0
}
