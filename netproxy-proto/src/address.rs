//! Target addresses and their `sockaddr` serialization.
//!
//! Proxy requests carry the raw Linux `struct sockaddr_in` /
//! `struct sockaddr_in6` bytes the sandboxee would have passed to
//! `connect(2)`: native-endian family, network-order port, then the address.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// `sizeof(struct sockaddr_in)`.
const SOCKADDR_IN_LEN: usize = 16;
/// `sizeof(struct sockaddr_in6)`.
const SOCKADDR_IN6_LEN: usize = 28;

/// Address family of a [`TargetAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Family {
    /// `AF_INET`.
    V4,
    /// `AF_INET6`.
    V6,
}

impl Family {
    /// The `AF_*` constant for this family.
    pub const fn raw(self) -> i32 {
        match self {
            Self::V4 => libc::AF_INET,
            Self::V6 => libc::AF_INET6,
        }
    }

    /// Maps an `AF_*` constant to a family.
    pub fn from_raw(raw: i32) -> Result<Self, AddressError> {
        match raw {
            libc::AF_INET => Ok(Self::V4),
            libc::AF_INET6 => Ok(Self::V6),
            other => Err(AddressError::UnsupportedFamily(other)),
        }
    }

    /// Size of the serialized `sockaddr` for this family.
    pub const fn sockaddr_len(self) -> usize {
        match self {
            Self::V4 => SOCKADDR_IN_LEN,
            Self::V6 => SOCKADDR_IN6_LEN,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        })
    }
}

/// Errors building or decoding a [`TargetAddress`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AddressError {
    /// The literal does not parse as an address of the requested family.
    #[error("invalid {family} address literal {literal:?}")]
    InvalidLiteral {
        /// Requested family.
        family: Family,
        /// The rejected literal.
        literal: String,
    },

    /// The `sockaddr` declares a family other than `AF_INET`/`AF_INET6`.
    #[error("unsupported address family {0}")]
    UnsupportedFamily(i32),

    /// The buffer is too short to hold a family field.
    #[error("address buffer of {0} bytes is too short")]
    Truncated(usize),

    /// The buffer length does not match the declared family.
    #[error("{family} sockaddr must be {expected} bytes, got {actual}")]
    Length {
        /// Declared family.
        family: Family,
        /// Expected `sockaddr` size.
        expected: usize,
        /// Actual buffer size.
        actual: usize,
    },
}

/// Endpoint a sandboxee wants to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    /// Address, port, and (for IPv6) flow info and scope.
    addr: SocketAddr,
}

impl TargetAddress {
    /// Builds an address from a textual literal of the given family.
    ///
    /// ```
    /// use netproxy_proto::{Family, TargetAddress};
    ///
    /// let addr = TargetAddress::new(Family::V6, "::1", 31337).unwrap();
    /// assert_eq!(addr.port(), 31337);
    /// assert!(TargetAddress::new(Family::V4, "::1", 80).is_err());
    /// ```
    pub fn new(family: Family, literal: &str, port: u16) -> Result<Self, AddressError> {
        let invalid = || AddressError::InvalidLiteral {
            family,
            literal: literal.to_owned(),
        };
        let ip = match family {
            Family::V4 => IpAddr::V4(literal.parse::<Ipv4Addr>().map_err(|_| invalid())?),
            Family::V6 => IpAddr::V6(literal.parse::<Ipv6Addr>().map_err(|_| invalid())?),
        };
        Ok(Self {
            addr: SocketAddr::new(ip, port),
        })
    }

    /// Address family.
    pub const fn family(&self) -> Family {
        match self.addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    /// Port in host byte order.
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The equivalent standard-library socket address.
    pub const fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serializes to `struct sockaddr_in` / `struct sockaddr_in6` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.family().sockaddr_len());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let family = self.family().raw() as u16;
        buf.extend_from_slice(&family.to_ne_bytes());
        buf.extend_from_slice(&self.addr.port().to_be_bytes());
        match self.addr {
            SocketAddr::V4(v4) => {
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&[0u8; 8]);
            }
            SocketAddr::V6(v6) => {
                buf.extend_from_slice(&v6.flowinfo().to_ne_bytes());
                buf.extend_from_slice(&v6.ip().octets());
                buf.extend_from_slice(&v6.scope_id().to_ne_bytes());
            }
        }
        buf
    }

    /// Reconstructs an address from `sockaddr` bytes.
    ///
    /// The buffer length must match the declared family exactly.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, AddressError> {
        let &[f0, f1, ..] = buf else {
            return Err(AddressError::Truncated(buf.len()));
        };
        let family = Family::from_raw(i32::from(u16::from_ne_bytes([f0, f1])))?;
        if buf.len() != family.sockaddr_len() {
            return Err(AddressError::Length {
                family,
                expected: family.sockaddr_len(),
                actual: buf.len(),
            });
        }

        let port = u16::from_be_bytes([buf[2], buf[3]]);
        let addr = match family {
            Family::V4 => {
                let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
                SocketAddr::V4(SocketAddrV4::new(ip, port))
            }
            Family::V6 => {
                let flowinfo = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[8..24]);
                let scope_id = u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]);
                SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                ))
            }
        };
        Ok(Self { addr })
    }
}

impl From<SocketAddr> for TargetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_loopback_layout() {
        let addr = TargetAddress::new(Family::V6, "::1", 31337).unwrap();
        let bytes = addr.to_bytes();

        assert_eq!(bytes.len(), SOCKADDR_IN6_LEN);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let family = libc::AF_INET6 as u16;
        assert_eq!(&bytes[..2], &family.to_ne_bytes());
        // Port in network byte order.
        assert_eq!(&bytes[2..4], &[0x7a, 0x69]);
        assert_eq!(bytes[23], 1);
        assert!(bytes[8..23].iter().all(|b| *b == 0));
    }

    #[test]
    fn ipv4_layout_is_padded() {
        let addr = TargetAddress::new(Family::V4, "127.0.0.1", 8080).unwrap();
        let bytes = addr.to_bytes();

        assert_eq!(bytes.len(), SOCKADDR_IN_LEN);
        assert_eq!(&bytes[2..4], &8080u16.to_be_bytes());
        assert_eq!(&bytes[4..8], &[127, 0, 0, 1]);
        assert_eq!(&bytes[8..], &[0u8; 8]);
    }

    #[test]
    fn supervisor_sees_the_same_endpoint() {
        for (family, literal) in [(Family::V4, "10.1.2.3"), (Family::V6, "fe80::1")] {
            let addr = TargetAddress::new(family, literal, 443).unwrap();
            let decoded = TargetAddress::from_bytes(&addr.to_bytes()).unwrap();
            assert_eq!(decoded, addr);
            assert_eq!(decoded.family(), family);
        }
    }

    #[test]
    fn matches_std_sockaddr_in6() {
        // The serialized layout must be what the kernel sees for a real socket address.
        let std_addr: SocketAddr = "[::1]:9".parse().unwrap();
        let addr = TargetAddress::from(std_addr);
        // SAFETY: sockaddr_in6 is plain old data; zeroed is a valid value.
        #[allow(unsafe_code)]
        let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        }
        raw.sin6_port = 9u16.to_be();
        raw.sin6_addr.s6_addr = Ipv6Addr::LOCALHOST.octets();
        // SAFETY: reading the bytes of a fully initialized repr(C) struct.
        #[allow(unsafe_code)]
        let raw_bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(&raw).cast::<u8>(),
                size_of::<libc::sockaddr_in6>(),
            )
        };
        assert_eq!(addr.to_bytes(), raw_bytes);
    }

    #[test]
    fn rejects_literal_of_other_family() {
        let err = TargetAddress::new(Family::V4, "::1", 1).unwrap_err();
        assert!(matches!(err, AddressError::InvalidLiteral { family: Family::V4, .. }));
        assert!(TargetAddress::new(Family::V6, "localhost", 1).is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = TargetAddress::new(Family::V6, "::1", 80).unwrap().to_bytes();
        bytes.truncate(SOCKADDR_IN_LEN);
        assert_eq!(
            TargetAddress::from_bytes(&bytes).unwrap_err(),
            AddressError::Length {
                family: Family::V6,
                expected: SOCKADDR_IN6_LEN,
                actual: SOCKADDR_IN_LEN,
            }
        );
    }

    #[test]
    fn rejects_unsupported_family() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let unix = libc::AF_UNIX as u16;
        let mut bytes = vec![0u8; 110];
        bytes[..2].copy_from_slice(&unix.to_ne_bytes());
        assert_eq!(
            TargetAddress::from_bytes(&bytes).unwrap_err(),
            AddressError::UnsupportedFamily(libc::AF_UNIX)
        );
        assert_eq!(
            TargetAddress::from_bytes(&[2]).unwrap_err(),
            AddressError::Truncated(1)
        );
    }
}
