//! CIDR allow list for proxied connects.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// One allowed network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    /// Network address; host bits are cleared on insertion.
    addr: IpAddr,
    /// Prefix length in bits.
    prefix: u8,
}

impl Network {
    /// Whether `ip` falls inside this network.
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                mask_v4(ip, self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                mask_v6(ip, self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

/// Clears the host bits of `ip`.
fn mask_v4(ip: Ipv4Addr, prefix: u8) -> u32 {
    u32::from(ip) & u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

/// Clears the host bits of `ip`.
fn mask_v6(ip: Ipv6Addr, prefix: u8) -> u128 {
    u128::from(ip) & u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

/// Networks the supervisor will connect to on a sandboxee's behalf.
///
/// An empty list denies everything. IPv4-mapped IPv6 targets are not
/// unwrapped; allow them explicitly if needed.
#[derive(Debug, Clone, Default)]
pub struct AllowedHosts {
    /// Allowed networks, checked in insertion order.
    networks: Vec<Network>,
}

impl AllowedHosts {
    /// Creates an empty (deny-all) list.
    pub const fn new() -> Self {
        Self {
            networks: Vec::new(),
        }
    }

    /// Allows `addr/prefix`. Prefixes longer than the address are clamped.
    #[must_use]
    pub fn allow(mut self, addr: IpAddr, prefix: u8) -> Self {
        let (addr, prefix) = match addr {
            IpAddr::V4(v4) => {
                let prefix = prefix.min(32);
                (IpAddr::V4(mask_v4(v4, prefix).into()), prefix)
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.min(128);
                (IpAddr::V6(mask_v6(v6, prefix).into()), prefix)
            }
        };
        self.networks.push(Network { addr, prefix });
        self
    }

    /// Allows `127.0.0.0/8` and `::1/128`.
    #[must_use]
    pub fn allow_loopback(self) -> Self {
        self.allow(Ipv4Addr::LOCALHOST.into(), 8)
            .allow(Ipv6Addr::LOCALHOST.into(), 128)
    }

    /// Whether a connect to `target` is permitted.
    pub fn is_allowed(&self, target: &SocketAddr) -> bool {
        self.networks.iter().any(|n| n.contains(target.ip()))
    }
}
