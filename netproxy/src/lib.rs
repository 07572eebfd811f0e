//! Outbound TCP for network-sandboxed processes.
//!
//! A sandboxee without network access asks its supervisor, over an
//! inherited control channel, to `connect(2)` on its behalf. The supervisor
//! checks the target against an allow list, connects, and passes the
//! connected socket back; the sandboxee splices it onto its own descriptor.
//!
//! Two modes are available on the sandboxee side:
//!
//! - **Manual**: call [`ProxyClient::connect`] with a socket and a
//!   `sockaddr`.
//! - **Automatic**: [`Sandbox::install_network_proxy_handler`] traps every
//!   `connect(2)` with seccomp and services it from a `SIGSYS` handler.
//!
//! # Sandboxee
//!
//! ```no_run
//! use std::os::fd::AsFd;
//! use std::net::TcpListener;
//!
//! use netproxy::{Sandbox, proto::{CLIENT_COMMS_FD, Comms, TargetAddress}};
//!
//! let comms = Comms::from_inherited_fd(CLIENT_COMMS_FD)?;
//! let sandbox = Sandbox::enter(comms)?;
//! let port = sandbox.recv_i32()?;
//! # let sock = TcpListener::bind("[::1]:0")?;
//! let target = TargetAddress::new(netproxy::proto::Family::V6, "::1", u16::try_from(port)?)?;
//! if let Some(client) = sandbox.proxy_client() {
//!     client.connect_to(sock.as_fd(), &target)?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(target_os = "linux")]
mod client;
mod error;
#[cfg(target_os = "linux")]
mod filter;
#[cfg(target_os = "linux")]
mod handler;
#[cfg(target_os = "linux")]
pub mod jail;
#[cfg(target_os = "linux")]
mod proxy;
#[cfg(target_os = "linux")]
pub mod supervisor;

pub use netproxy_proto as proto;

#[cfg(target_os = "linux")]
pub use client::Sandbox;
pub use error::{Error, Result};
#[cfg(target_os = "linux")]
pub use proxy::{ProxyClient, SharedComms};
#[cfg(target_os = "linux")]
pub use supervisor::{AllowedHosts, ServeStats, Supervisor};
