//! Sandboxee side of sandbox entry.
//!
//! [`Sandbox::enter`] performs the entry handshake on the control channel,
//! applies the supervisor's policy to the calling process, and returns the
//! handles the rest of the program needs: the network proxy client (when the
//! policy enables it), the handler installer, and the channel itself.

use std::sync::{Arc, Mutex};

use netproxy_proto::{Comms, Hello, HelloAck, PROTOCOL_VERSION, SandboxPolicy};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::proxy::{self, ProxyClient, SharedComms};
use crate::{filter, handler};

/// A process that has completed sandbox entry.
#[derive(Debug)]
pub struct Sandbox {
    /// Channel to the supervisor, shared with the proxy client.
    comms: SharedComms,
    /// Policy received during entry.
    policy: SandboxPolicy,
    /// Present iff the policy enables the network proxy.
    proxy: Option<ProxyClient>,
}

impl Sandbox {
    /// Performs the entry handshake and confines the calling process.
    ///
    /// Sends [`Hello`], waits for the supervisor's [`HelloAck`], and applies
    /// the received [`SandboxPolicy`].
    pub fn enter(mut comms: Comms) -> Result<Self> {
        comms.send_msg(&Hello {
            version: PROTOCOL_VERSION,
            pid: std::process::id(),
        })?;

        let policy = match comms.recv_msg::<HelloAck>()? {
            HelloAck::Policy(policy) => policy,
            HelloAck::Error(e) => return Err(Error::Protocol(format!("entry rejected: {e}"))),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected entry reply {other:?}"
                )));
            }
        };
        debug!(?policy, "received sandbox policy");

        if policy.deny_connect {
            filter::apply(&filter::deny_connect()?)?;
        }
        info!("sandbox entered");

        let comms = Arc::new(Mutex::new(comms));
        let proxy = policy
            .network_proxy
            .then(|| ProxyClient::new(Arc::clone(&comms)));
        Ok(Self {
            comms,
            policy,
            proxy,
        })
    }

    /// Policy applied during entry.
    pub const fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// The manual-mode proxy client, if the policy enables the proxy.
    pub const fn proxy_client(&self) -> Option<&ProxyClient> {
        self.proxy.as_ref()
    }

    /// Switches the process to automatic mode.
    ///
    /// Holds the channel for the duration so no proxy traffic interleaves
    /// with installation. Fails if the proxy is disabled or a handler is
    /// already installed.
    pub fn install_network_proxy_handler(&self) -> Result<()> {
        let Some(client) = &self.proxy else {
            return Err(Error::Protocol(
                "network proxy is disabled by the sandbox policy".into(),
            ));
        };
        let _idle = proxy::lock(&self.comms)?;
        handler::install(client.clone())
    }

    /// Receives an `i32` from the supervisor.
    pub fn recv_i32(&self) -> Result<i32> {
        Ok(proxy::lock(&self.comms)?.recv_i32()?)
    }
}
