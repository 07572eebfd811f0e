//! Manual-mode proxy client.
//!
//! Sends the `sockaddr` a sandboxee wants to reach over the control channel
//! and splices the supervisor's connected socket onto the caller's
//! descriptor.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard};

use netproxy_proto::{Comms, ProxyStatus, TargetAddress};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Control channel shared by every component of the sandboxee.
pub type SharedComms = Arc<Mutex<Comms>>;

/// Locks the channel for one complete exchange.
pub(crate) fn lock(comms: &SharedComms) -> Result<MutexGuard<'_, Comms>> {
    comms
        .lock()
        .map_err(|_| Error::Protocol("control channel lock poisoned".into()))
}

/// Handle for requesting supervisor-side connects.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    /// Channel to the supervisor.
    comms: SharedComms,
}

impl ProxyClient {
    /// Creates a client on the given channel.
    pub const fn new(comms: SharedComms) -> Self {
        Self { comms }
    }

    /// Connects `sock` to the target encoded in `addr` (raw `sockaddr`
    /// bytes) through the supervisor.
    ///
    /// On success `sock` refers to a socket connected to the target. On
    /// failure `sock` is left untouched. A malformed address fails before
    /// anything is sent.
    ///
    /// Emits no tracing events: this is the path the `SIGSYS` handler runs.
    pub fn connect(&self, sock: BorrowedFd<'_>, addr: &[u8]) -> Result<()> {
        let target = TargetAddress::from_bytes(addr)?;
        let connected = self.exchange(&target, addr)?;
        dup2(&connected, sock)
    }

    /// Like [`ProxyClient::connect`], for an already-built address.
    pub fn connect_to(&self, sock: BorrowedFd<'_>, target: &TargetAddress) -> Result<()> {
        debug!(%target, "sending proxy request");
        self.connect(sock, &target.to_bytes())?;
        info!(%target, fd = sock.as_raw_fd(), "connected through supervisor");
        Ok(())
    }

    /// Runs one request/response exchange and returns the connected socket.
    fn exchange(&self, target: &TargetAddress, addr: &[u8]) -> Result<OwnedFd> {
        let mut comms = lock(&self.comms)?;
        comms.send_bytes(addr)?;

        match comms.recv_msg::<ProxyStatus>()? {
            ProxyStatus::Connected => Ok(comms.recv_fd()?),
            ProxyStatus::Denied(message) => Err(Error::RemoteConnect {
                addr: target.socket_addr(),
                errno: libc::EACCES,
                message,
            }),
            ProxyStatus::Failed { errno, message } => Err(Error::RemoteConnect {
                addr: target.socket_addr(),
                errno,
                message,
            }),
            other => Err(Error::Protocol(format!(
                "unexpected proxy response {other:?}"
            ))),
        }
    }
}

/// Makes `target`'s descriptor number refer to `connected`'s socket.
///
/// `connected` itself is closed when the caller drops it.
fn dup2(connected: &OwnedFd, target: BorrowedFd<'_>) -> Result<()> {
    loop {
        // SAFETY: both descriptors are open for the duration of the call;
        // dup2 atomically replaces `target`, which the caller keeps owning.
        let ret = unsafe { libc::dup2(connected.as_raw_fd(), target.as_raw_fd()) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::local("dup2", err));
        }
    }
}
