//! Protocol message types for sandboxee ↔ supervisor communication.

use serde::{Deserialize, Serialize};

/// Descriptor number on which the sandboxee inherits the control channel.
pub const CLIENT_COMMS_FD: i32 = 1023;

/// Version of the entry handshake; both sides must agree.
pub const PROTOCOL_VERSION: u32 = 1;

/// First message on the channel, sent by the sandboxee when it is ready to
/// be confined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Hello {
    /// Sandboxee protocol version.
    pub version: u32,
    /// Process ID of the sandboxee.
    pub pid: u32,
}

/// Supervisor reply to [`Hello`].
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum HelloAck {
    /// Handshake accepted; the sandboxee must apply this policy.
    Policy(SandboxPolicy),
    /// Handshake rejected (e.g. version mismatch).
    Error(String),
}

/// Restrictions the sandboxee applies to itself during entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Whether the supervisor serves proxy connect requests.
    pub network_proxy: bool,
    /// Make direct `connect(2)` calls fail with `EPERM`.
    pub deny_connect: bool,
}

/// Supervisor reply to a proxy connect request.
///
/// [`ProxyStatus::Connected`] is always followed by exactly one
/// descriptor frame carrying the connected socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ProxyStatus {
    /// The supervisor connected to the target.
    Connected,
    /// The allow list rejected the target.
    Denied(String),
    /// The request was malformed or the connect attempt failed.
    Failed {
        /// OS error number describing the failure.
        errno: i32,
        /// Human-readable description.
        message: String,
    },
}
