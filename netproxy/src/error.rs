//! Error types for netproxy operations.

use std::io;
use std::net::SocketAddr;

use netproxy_proto::AddressError;

/// Alias for `Result<T, netproxy::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the sandboxee-side proxy protocol.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The target address could not be built or decoded.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// A local system call (socket, dup2, sigaction, connect) failed.
    #[error("{op}: {source}")]
    LocalResource {
        /// The operation that failed.
        op: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The control channel failed or closed mid-exchange.
    #[error("control channel: {0}")]
    Transport(#[source] io::Error),

    /// The supervisor sent something unexpected, or the call is not valid
    /// in the current mode.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The supervisor refused or failed to connect to the target.
    #[error("supervisor could not connect to {addr}: {message}")]
    RemoteConnect {
        /// The requested target.
        addr: SocketAddr,
        /// OS error number reported by the supervisor.
        errno: i32,
        /// Supervisor-provided description.
        message: String,
    },

    /// Data read from the peer did not match expectations.
    #[error("unexpected payload: {0}")]
    Validation(String),

    /// A seccomp filter could not be compiled or applied.
    #[cfg(target_os = "linux")]
    #[error("seccomp filter: {0}")]
    Filter(#[from] seccompiler::Error),
}

impl Error {
    /// Wraps a failed local system call.
    pub const fn local(op: &'static str, source: io::Error) -> Self {
        Self::LocalResource { op, source }
    }

    /// The errno a trapped `connect(2)` reports for this error.
    #[cfg(target_os = "linux")]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Address(AddressError::UnsupportedFamily(_)) => libc::EAFNOSUPPORT,
            Self::Address(_) => libc::EINVAL,
            Self::LocalResource { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::Transport(_) => libc::ECONNABORTED,
            Self::Protocol(_) => libc::EPROTO,
            Self::RemoteConnect { errno, .. } => *errno,
            Self::Validation(_) | Self::Filter(_) => libc::EIO,
        }
    }
}

/// Control-channel failures: malformed frames are protocol violations,
/// everything else is a transport failure.
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::Protocol(e.to_string())
        } else {
            Self::Transport(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_are_classified() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "closed");
        assert!(matches!(Error::from(eof), Error::Transport(_)));

        let bad = io::Error::new(io::ErrorKind::InvalidData, "expected Fd frame");
        assert!(matches!(Error::from(bad), Error::Protocol(m) if m.contains("Fd frame")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn errno_for_trapped_connect() {
        let remote = Error::RemoteConnect {
            addr: "[::1]:1".parse().unwrap(),
            errno: libc::ECONNREFUSED,
            message: "refused".into(),
        };
        assert_eq!(remote.errno(), libc::ECONNREFUSED);
        assert_eq!(Error::from(AddressError::Truncated(0)).errno(), libc::EINVAL);
        assert_eq!(
            Error::from(AddressError::UnsupportedFamily(1)).errno(),
            libc::EAFNOSUPPORT
        );
        let local = Error::local("dup2", io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(local.errno(), libc::EMFILE);
    }
}
