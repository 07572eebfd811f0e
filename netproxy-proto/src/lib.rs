//! Wire protocol for the sandboxee ↔ supervisor control channel.
//!
//! Every frame carries an 8-byte header (`u32` little-endian tag, `u32`
//! little-endian length) followed by the payload. Structured messages are
//! serialized with [`postcard`]; connected sockets travel as `SCM_RIGHTS`
//! ancillary data attached to an empty [`Tag::Fd`] frame.

mod address;
mod codec;
#[cfg(target_os = "linux")]
mod comms;
mod message;

pub use address::{AddressError, Family, TargetAddress};
pub use codec::{HEADER_LEN, Header, MAX_FRAME, Tag, decode, encode, read_frame, write_frame};
#[cfg(target_os = "linux")]
pub use comms::Comms;
pub use message::{CLIENT_COMMS_FD, Hello, HelloAck, PROTOCOL_VERSION, ProxyStatus, SandboxPolicy};
