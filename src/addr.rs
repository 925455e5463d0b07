//! Family-agnostic socket address value object.
//!
//! Storage is a zeroed `sockaddr_storage` stamped with its family, big
//! enough for any supported variant; the accessors interpret it through
//! the family-specific layouts. Name resolution goes through the
//! platform resolver and therefore blocks.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use crate::data::SockData;

const STORAGE_SIZE: usize = mem::size_of::<libc::sockaddr_storage>();

pub struct SockAddr {
    storage: libc::sockaddr_storage,
}

impl SockAddr {
    /// Zeroed storage stamped with `family`.
    ///
    /// The aliases -1 and -2 select IPv4 and IPv6 so script code does
    /// not need the numeric `AF_*` values.
    pub fn new(family: i32) -> SockAddr {
        let family = match family {
            -1 => libc::AF_INET,
            -2 => libc::AF_INET6,
            other => other,
        };
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = family as libc::sa_family_t;
        SockAddr { storage }
    }

    /// `new` followed by `set_address`. Blocking.
    pub fn from_string(text: &str, family: i32) -> SockAddr {
        let mut addr = SockAddr::new(family);
        addr.set_address(text);
        addr
    }

    /// Copies at most one storage worth of raw bytes.
    pub fn from_data(data: &SockData) -> SockAddr {
        let mut addr = SockAddr::new(0);
        let count = data.as_bytes().len().min(STORAGE_SIZE);
        addr.as_bytes_mut()[..count].copy_from_slice(&data.as_bytes()[..count]);
        addr
    }

    /// Numeric IPv4 literal plus port.
    pub fn from_ip(ip: &str, port: u16) -> SockAddr {
        let mut addr = SockAddr::new(libc::AF_INET);
        addr.set_ip(ip);
        addr.set_port(port);
        addr
    }

    /// Numeric IPv6 literal plus port.
    pub fn from_ipv6(ip: &str, port: u16) -> SockAddr {
        let mut addr = SockAddr::new(libc::AF_INET6);
        addr.set_ip(ip);
        addr.set_port(port);
        addr
    }

    pub fn family(&self) -> i32 {
        self.storage.ss_family as i32
    }

    /// Address length as reported by the family.
    pub(crate) fn len(&self) -> libc::socklen_t {
        let size = match self.family() {
            f if f == libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
            f if f == libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
            _ => STORAGE_SIZE,
        };
        size as libc::socklen_t
    }

    pub fn port(&self) -> u16 {
        match self.family() {
            f if f == libc::AF_INET => u16::from_be(self.v4().sin_port),
            f if f == libc::AF_INET6 => u16::from_be(self.v6().sin6_port),
            _ => 0,
        }
    }

    /// Writes the family's port field; families without one ignore it.
    pub fn set_port(&mut self, port: u16) {
        match self.family() {
            f if f == libc::AF_INET => self.v4_mut().sin_port = port.to_be(),
            f if f == libc::AF_INET6 => self.v6_mut().sin6_port = port.to_be(),
            _ => {}
        }
    }

    /// The numeric address as text; empty for non-IP families.
    pub fn ip(&self) -> String {
        match self.family() {
            f if f == libc::AF_INET => {
                Ipv4Addr::from(u32::from_be(self.v4().sin_addr.s_addr)).to_string()
            }
            f if f == libc::AF_INET6 => {
                Ipv6Addr::from(self.v6().sin6_addr.s6_addr).to_string()
            }
            _ => String::new(),
        }
    }

    /// Parses a numeric literal into the family's address bytes.
    /// Unparsable input leaves the storage unchanged.
    pub fn set_ip(&mut self, ip: &str) {
        match self.family() {
            f if f == libc::AF_INET => {
                if let Ok(parsed) = ip.parse::<Ipv4Addr>() {
                    self.v4_mut().sin_addr.s_addr = u32::from(parsed).to_be();
                }
            }
            f if f == libc::AF_INET6 => {
                if let Ok(parsed) = ip.parse::<Ipv6Addr>() {
                    self.v6_mut().sin6_addr.s6_addr = parsed.octets();
                }
            }
            _ => {}
        }
    }

    /// Reverse-resolves the stored address to `scheme://host`,
    /// `host:port`, or `host`. Blocking; empty on total failure.
    pub fn address(&self) -> String {
        let Some(sockaddr) = self.as_socket_addr() else {
            return String::new();
        };
        match dns_lookup::getnameinfo(&sockaddr, 0) {
            Ok((host, service)) => {
                if service.is_empty() {
                    host
                } else if service.parse::<u16>().is_ok() {
                    format!("{host}:{service}")
                } else {
                    format!("{service}://{host}")
                }
            }
            // Service lookup failed; retry with the numeric port.
            Err(_) => match dns_lookup::getnameinfo(&sockaddr, libc::NI_NUMERICSERV) {
                Ok((host, service)) => format!("{host}:{service}"),
                Err(_) => String::new(),
            },
        }
    }

    /// Resolves `scheme://host[:port]` or `host[:port]` and overwrites
    /// the storage with the first result. Blocking; resolution failure
    /// leaves the storage unchanged.
    ///
    /// IPv6 storage never splits on the final colon, so bare literals
    /// like `::1` pass through to the resolver intact.
    pub fn set_address(&mut self, text: &str) {
        let mut node = text;
        let mut service = "";
        if let Some(index) = node.find("://") {
            service = &node[..index];
            node = &node[index + 3..];
        }
        if self.family() != libc::AF_INET6 {
            if let Some(index) = node.rfind(':') {
                service = &node[index + 1..];
                node = &node[..index];
            }
        }

        let mut flags = libc::AI_ADDRCONFIG | libc::AI_V4MAPPED;
        if node.is_empty() {
            flags |= libc::AI_PASSIVE;
        }
        let hints = dns_lookup::AddrInfoHints {
            socktype: 0,
            protocol: 0,
            address: if self.family() != 0 {
                self.family()
            } else {
                libc::AF_UNSPEC
            },
            flags,
        };

        let node = (!node.is_empty()).then_some(node);
        let service = (!service.is_empty()).then_some(service);
        if let Ok(mut results) = dns_lookup::getaddrinfo(node, service, Some(hints)) {
            if let Some(Ok(info)) = results.next() {
                *self = SockAddr::from_socket2(&socket2::SockAddr::from(info.sockaddr));
            }
        }
    }

    /// The storage as a std address, when the family has one.
    pub(crate) fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self.family() {
            f if f == libc::AF_INET => {
                let v4 = self.v4();
                Some(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr)),
                    u16::from_be(v4.sin_port),
                )))
            }
            f if f == libc::AF_INET6 => {
                let v6 = self.v6();
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(v6.sin6_addr.s6_addr),
                    u16::from_be(v6.sin6_port),
                    v6.sin6_flowinfo,
                    v6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    pub(crate) fn from_raw_storage(storage: libc::sockaddr_storage) -> SockAddr {
        SockAddr { storage }
    }

    pub(crate) fn from_socket2(addr: &socket2::SockAddr) -> SockAddr {
        let mut out = SockAddr::new(0);
        let count = (addr.len() as usize).min(STORAGE_SIZE);
        unsafe {
            ptr::copy_nonoverlapping(
                addr.as_ptr() as *const u8,
                &mut out.storage as *mut libc::sockaddr_storage as *mut u8,
                count,
            );
        }
        out
    }

    pub(crate) fn to_socket2(&self) -> socket2::SockAddr {
        // The kernel validates the contents; arbitrary bytes only earn
        // an EINVAL from the syscall, same as the C original.
        unsafe { socket2::SockAddr::new(self.storage, self.len()) }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.storage as *const libc::sockaddr_storage as *const u8,
                STORAGE_SIZE,
            )
        }
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.storage as *mut libc::sockaddr_storage as *mut u8,
                STORAGE_SIZE,
            )
        }
    }

    fn v4(&self) -> &libc::sockaddr_in {
        unsafe { &*(&self.storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) }
    }

    fn v4_mut(&mut self) -> &mut libc::sockaddr_in {
        unsafe { &mut *(&mut self.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in) }
    }

    fn v6(&self) -> &libc::sockaddr_in6 {
        unsafe { &*(&self.storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6) }
    }

    fn v6_mut(&mut self) -> &mut libc::sockaddr_in6 {
        unsafe {
            &mut *(&mut self.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
        }
    }
}

impl Clone for SockAddr {
    fn clone(&self) -> SockAddr {
        SockAddr {
            storage: self.storage,
        }
    }
}

impl PartialEq for SockAddr {
    fn eq(&self, other: &SockAddr) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SockAddr {}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SockAddr")
            .field("family", &self.family())
            .field("ip", &self.ip())
            .field("port", &self.port())
            .finish()
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> SockAddr {
        SockAddr::from_socket2(&socket2::SockAddr::from(addr))
    }
}
