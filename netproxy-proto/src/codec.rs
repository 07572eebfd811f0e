//! Tagged, length-prefixed frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 LE tag][u32 LE length][payload]`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Frame type carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u32)]
pub enum Tag {
    /// A little-endian `i32`; the payload is always 4 bytes.
    Int32 = 1,
    /// An opaque byte buffer.
    Bytes = 2,
    /// A postcard-encoded message.
    Message = 3,
    /// An empty payload whose header carries an `SCM_RIGHTS` descriptor.
    Fd = 4,
}

impl Tag {
    /// Maps a raw header value back to a tag.
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Int32),
            2 => Some(Self::Bytes),
            3 => Some(Self::Message),
            4 => Some(Self::Fd),
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame type.
    pub tag: Tag,
    /// Payload length in bytes.
    pub len: u32,
}

impl Header {
    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&(self.tag as u32).to_le_bytes());
        buf[4..].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Parses and validates a header.
    pub fn from_bytes(buf: [u8; HEADER_LEN]) -> io::Result<Self> {
        let [t0, t1, t2, t3, l0, l1, l2, l3] = buf;
        let raw_tag = u32::from_le_bytes([t0, t1, t2, t3]);
        let len = u32::from_le_bytes([l0, l1, l2, l3]);
        let tag = Tag::from_u32(raw_tag).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame tag {raw_tag:#x}"),
            )
        })?;
        if len > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds 16 MiB limit",
            ));
        }
        Ok(Self { tag, len })
    }

    /// Fails with `InvalidData` unless the header has the `expected` tag.
    pub fn expect(self, expected: Tag) -> io::Result<Self> {
        if self.tag == expected {
            Ok(self)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {expected:?} frame, got {:?}", self.tag),
            ))
        }
    }
}

/// Writes one frame with the given tag and payload.
pub fn write_frame<W: Write>(w: &mut W, tag: Tag, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;
    w.write_all(&Header { tag, len }.to_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Reads one frame, failing unless its tag is `expected`.
pub fn read_frame<R: Read>(r: &mut R, expected: Tag) -> io::Result<Vec<u8>> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)?;
    let header = Header::from_bytes(buf)?.expect(expected)?;
    let mut payload = vec![0u8; header.len as usize];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

/// Encodes `msg` with postcard and writes it as a [`Tag::Message`] frame.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(w, Tag::Message, &payload)
}

/// Reads a [`Tag::Message`] frame from `r` and decodes it.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let payload = read_frame(r, Tag::Message)?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hello, HelloAck, ProxyStatus, SandboxPolicy};

    #[test]
    fn roundtrip_hello() {
        let mut buf = Vec::new();
        encode(&mut buf, &Hello { version: 1, pid: 42 }).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        let decoded: Hello = decode(&mut cursor).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.pid, 42);
    }

    #[test]
    fn roundtrip_policy_ack() {
        let ack = HelloAck::Policy(SandboxPolicy {
            network_proxy: true,
            deny_connect: false,
        });

        let mut buf = Vec::new();
        encode(&mut buf, &ack).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        match decode::<HelloAck>(&mut cursor).unwrap() {
            HelloAck::Policy(p) => {
                assert!(p.network_proxy);
                assert!(!p.deny_connect);
            }
            HelloAck::Error(e) => panic!("expected Policy, got error {e}"),
        }
    }

    #[test]
    fn int32_frame_is_little_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Tag::Int32, &31337i32.to_le_bytes()).unwrap();
        assert_eq!(&buf[..4], &1u32.to_le_bytes());
        assert_eq!(&buf[4..8], &4u32.to_le_bytes());
        assert_eq!(&buf[8..], &[0x69, 0x7a, 0x00, 0x00]);
    }

    #[test]
    fn rejects_unexpected_tag() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Tag::Bytes, b"abc").unwrap();

        let mut cursor = io::Cursor::new(&buf);
        let err = decode::<ProxyStatus>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&0xdead_u32.to_le_bytes());
        let err = Header::from_bytes(header).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_frame() {
        // Craft a frame header claiming 32 MiB
        let header = Header {
            tag: Tag::Bytes,
            len: 32 * 1024 * 1024,
        };
        let mut cursor = io::Cursor::new(header.to_bytes());
        let result = read_frame(&mut cursor, Tag::Bytes);
        assert!(result.is_err());
    }

    #[test]
    fn truncated_payload_is_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Tag::Bytes, b"hello").unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = io::Cursor::new(&buf);
        let err = read_frame(&mut cursor, Tag::Bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
