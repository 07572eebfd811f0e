//! Supervisor side of the control channel.
//!
//! The supervisor owns the parent end of the channel. It answers the entry
//! handshake with a [`SandboxPolicy`], hands the sandboxee any integers it
//! needs (the port to reach, in the demonstration), and then performs every
//! `connect(2)` the sandboxee asks for, subject to an [`AllowedHosts`] list.

mod hosts;

use std::io;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::time::Duration;

use netproxy_proto::{
    Comms, Hello, HelloAck, PROTOCOL_VERSION, ProxyStatus, SandboxPolicy, TargetAddress,
};
use tracing::{debug, info, warn};

pub use self::hosts::AllowedHosts;
use crate::error::{Error, Result};

/// Upper bound on a single proxied connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-run request counters returned by [`Supervisor::serve`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ServeStats {
    /// Requests answered with a connected socket.
    pub connected: u64,
    /// Requests refused by the allow list.
    pub denied: u64,
    /// Malformed requests and failed connects.
    pub failed: u64,
}

/// Parent end of one sandboxee's control channel.
#[derive(Debug)]
pub struct Supervisor {
    /// Channel to the sandboxee.
    comms: Comms,
    /// Policy sent at entry.
    policy: SandboxPolicy,
    /// Targets the sandboxee may reach.
    hosts: AllowedHosts,
}

impl Supervisor {
    /// Creates a supervisor that denies every proxied connect until
    /// [`Supervisor::allowed_hosts`] says otherwise.
    pub const fn new(comms: Comms, policy: SandboxPolicy) -> Self {
        Self {
            comms,
            policy,
            hosts: AllowedHosts::new(),
        }
    }

    /// Sets the allow list.
    #[must_use]
    pub fn allowed_hosts(mut self, hosts: AllowedHosts) -> Self {
        self.hosts = hosts;
        self
    }

    /// Answers the sandboxee's [`Hello`] with the policy.
    ///
    /// A version mismatch is reported to the sandboxee before failing here.
    pub fn accept_entry(&mut self) -> Result<Hello> {
        let hello: Hello = self.comms.recv_msg()?;
        if hello.version != PROTOCOL_VERSION {
            let reason = format!(
                "protocol version {} is not supported (expected {PROTOCOL_VERSION})",
                hello.version
            );
            self.comms.send_msg(&HelloAck::Error(reason.clone()))?;
            return Err(Error::Protocol(reason));
        }
        self.comms.send_msg(&HelloAck::Policy(self.policy))?;
        info!(pid = hello.pid, policy = ?self.policy, "sandboxee entered");
        Ok(hello)
    }

    /// Sends the port the sandboxee should connect to.
    pub fn send_port(&mut self, port: i32) -> Result<()> {
        debug!(port, "sending port");
        Ok(self.comms.send_i32(port)?)
    }

    /// Serves proxy requests until the sandboxee closes the channel.
    pub fn serve(mut self) -> Result<ServeStats> {
        let mut stats = ServeStats::default();
        loop {
            let request = match self.comms.recv_bytes() {
                Ok(request) => request,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            self.handle_request(&request, &mut stats)?;
        }
        debug!(?stats, "sandboxee closed the control channel");
        Ok(stats)
    }

    /// Answers one request; only channel errors are returned.
    fn handle_request(&mut self, request: &[u8], stats: &mut ServeStats) -> Result<()> {
        let target = match TargetAddress::from_bytes(request) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "malformed proxy request");
                stats.failed += 1;
                self.comms.send_msg(&ProxyStatus::Failed {
                    errno: libc::EINVAL,
                    message: e.to_string(),
                })?;
                return Ok(());
            }
        };

        let addr = target.socket_addr();
        if !self.hosts.is_allowed(&addr) {
            warn!(%target, "proxy request denied");
            stats.denied += 1;
            self.comms
                .send_msg(&ProxyStatus::Denied(format!("{target} is not allowed")))?;
            return Ok(());
        }

        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                info!(%target, "proxied connect");
                stats.connected += 1;
                self.comms.send_msg(&ProxyStatus::Connected)?;
                self.comms.send_fd(stream.as_fd())?;
            }
            Err(e) => {
                warn!(%target, error = %e, "proxied connect failed");
                stats.failed += 1;
                self.comms.send_msg(&ProxyStatus::Failed {
                    errno: e.raw_os_error().unwrap_or(libc::EIO),
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}
