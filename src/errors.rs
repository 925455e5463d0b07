//! Portable classification of native socket error codes.
//!
//! Script code never sees raw errno values; every error stored on a
//! socket can be narrowed to one of the thirteen kinds below. The
//! mapping is total: unknown non-zero codes fall into [`SockError::Other`].

use std::fmt;
use std::io;

/// Portable error kind surfaced to the embedding host.
///
/// The discriminants are part of the script-facing contract and must not
/// be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SockError {
    NoError = 0,
    Other = 1,
    AccessDenied = 2,
    AddressNotAvailable = 3,
    PleaseTryAgain = 4,
    SocketNotValid = 5,
    Disconnected = 6,
    Invalid = 7,
    Unsupported = 8,
    HostNotReached = 9,
    NotEnoughResources = 10,
    NetworkNotAvailable = 11,
    NotConnected = 12,
}

impl SockError {
    /// Maps a native error code to its portable kind.
    ///
    /// Several libc constants alias each other on Linux (EAGAIN ==
    /// EWOULDBLOCK, EOPNOTSUPP == ENOTSUP), so the arms use guards
    /// instead of constant patterns.
    pub fn classify(errno: i32) -> SockError {
        match errno {
            0 => SockError::NoError,
            e if e == libc::EACCES || e == libc::EPERM => SockError::AccessDenied,
            e if e == libc::EADDRINUSE
                || e == libc::EADDRNOTAVAIL
                || e == libc::EAFNOSUPPORT =>
            {
                SockError::AddressNotAvailable
            }
            e if e == libc::EAGAIN
                || e == libc::EWOULDBLOCK
                || e == libc::EALREADY
                || e == libc::EINPROGRESS
                || e == libc::EINTR =>
            {
                SockError::PleaseTryAgain
            }
            e if e == libc::EBADF || e == libc::ENOTSOCK => SockError::SocketNotValid,
            e if e == libc::ECONNABORTED
                || e == libc::ECONNREFUSED
                || e == libc::ECONNRESET
                || e == libc::ENETRESET =>
            {
                SockError::Disconnected
            }
            e if e == libc::EDESTADDRREQ
                || e == libc::EINVAL
                || e == libc::EPROTOTYPE
                || e == libc::EFAULT
                || e == libc::EISCONN =>
            {
                SockError::Invalid
            }
            e if e == libc::EOPNOTSUPP
                || e == libc::EPROTO
                || e == libc::EPROTONOSUPPORT
                || e == libc::ESOCKTNOSUPPORT =>
            {
                SockError::Unsupported
            }
            e if e == libc::EHOSTUNREACH => SockError::HostNotReached,
            e if e == libc::EMFILE
                || e == libc::ENFILE
                || e == libc::ENOBUFS
                || e == libc::ENOMEM =>
            {
                SockError::NotEnoughResources
            }
            e if e == libc::ENETDOWN || e == libc::ENETUNREACH => {
                SockError::NetworkNotAvailable
            }
            e if e == libc::ENOTCONN
                || e == libc::EPIPE
                || e == libc::ESHUTDOWN
                || e == libc::ETIMEDOUT =>
            {
                SockError::NotConnected
            }
            _ => SockError::Other,
        }
    }

    /// The constant name used in the script-facing error table.
    pub fn name(self) -> &'static str {
        match self {
            SockError::NoError => "NoError",
            SockError::Other => "OtherError",
            SockError::AccessDenied => "AccessDenied",
            SockError::AddressNotAvailable => "AddressNotAvailable",
            SockError::PleaseTryAgain => "PleaseTryAgain",
            SockError::SocketNotValid => "SocketNotValid",
            SockError::Disconnected => "Disconnected",
            SockError::Invalid => "Invalid",
            SockError::Unsupported => "Unsupported",
            SockError::HostNotReached => "HostNotReached",
            SockError::NotEnoughResources => "NotEnoughResources",
            SockError::NetworkNotAvailable => "NetworkNotAvailable",
            SockError::NotConnected => "NotConnected",
        }
    }
}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// True for the codes the non-blocking paths treat as "no progress".
pub(crate) fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

/// True for the codes an asynchronous connect reports while under way.
pub(crate) fn connect_pending(errno: i32) -> bool {
    errno == libc::EINPROGRESS || errno == libc::EALREADY
}

/// Human-readable text for a native error code, platform phrasing.
pub fn error_string(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}

/// Native code of an `io::Error`, with a conservative fallback for
/// synthesized errors that carry no errno.
pub(crate) fn raw_os_error(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_the_clusters() {
        assert_eq!(SockError::classify(0), SockError::NoError);
        assert_eq!(SockError::classify(libc::EACCES), SockError::AccessDenied);
        assert_eq!(SockError::classify(libc::EPERM), SockError::AccessDenied);
        assert_eq!(
            SockError::classify(libc::EADDRINUSE),
            SockError::AddressNotAvailable
        );
        assert_eq!(
            SockError::classify(libc::EADDRNOTAVAIL),
            SockError::AddressNotAvailable
        );
        assert_eq!(
            SockError::classify(libc::EAFNOSUPPORT),
            SockError::AddressNotAvailable
        );
        assert_eq!(
            SockError::classify(libc::EWOULDBLOCK),
            SockError::PleaseTryAgain
        );
        assert_eq!(
            SockError::classify(libc::EINPROGRESS),
            SockError::PleaseTryAgain
        );
        assert_eq!(SockError::classify(libc::EINTR), SockError::PleaseTryAgain);
        assert_eq!(SockError::classify(libc::EBADF), SockError::SocketNotValid);
        assert_eq!(
            SockError::classify(libc::ENOTSOCK),
            SockError::SocketNotValid
        );
        assert_eq!(
            SockError::classify(libc::ECONNRESET),
            SockError::Disconnected
        );
        assert_eq!(
            SockError::classify(libc::ECONNREFUSED),
            SockError::Disconnected
        );
        assert_eq!(SockError::classify(libc::EINVAL), SockError::Invalid);
        assert_eq!(SockError::classify(libc::EISCONN), SockError::Invalid);
        assert_eq!(
            SockError::classify(libc::EOPNOTSUPP),
            SockError::Unsupported
        );
        assert_eq!(
            SockError::classify(libc::EHOSTUNREACH),
            SockError::HostNotReached
        );
        assert_eq!(
            SockError::classify(libc::EMFILE),
            SockError::NotEnoughResources
        );
        assert_eq!(
            SockError::classify(libc::ENOBUFS),
            SockError::NotEnoughResources
        );
        assert_eq!(
            SockError::classify(libc::ENETUNREACH),
            SockError::NetworkNotAvailable
        );
        assert_eq!(SockError::classify(libc::ENOTCONN), SockError::NotConnected);
        assert_eq!(SockError::classify(libc::EPIPE), SockError::NotConnected);
        assert_eq!(
            SockError::classify(libc::ETIMEDOUT),
            SockError::NotConnected
        );
        // Anything unrecognized is still classified.
        assert_eq!(SockError::classify(libc::EXDEV), SockError::Other);
    }

    #[test]
    fn discriminants_are_stable() {
        assert_eq!(SockError::NoError as i32, 0);
        assert_eq!(SockError::PleaseTryAgain as i32, 4);
        assert_eq!(SockError::NotConnected as i32, 12);
    }

    #[test]
    fn error_string_is_nonempty() {
        assert!(!error_string(libc::ECONNREFUSED).is_empty());
    }
}
