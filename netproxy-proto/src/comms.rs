//! Control channel over a connected Unix stream socket.
//!
//! Reads are unbuffered: a descriptor frame's `SCM_RIGHTS` payload is
//! attached to its header bytes, so nothing may read ahead of [`Comms::recv_fd`].

#![allow(unsafe_code)]

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg};
use serde::{Deserialize, Serialize};

use crate::codec::{self, HEADER_LEN, Header, Tag};

/// One end of the sandboxee ↔ supervisor control channel.
#[derive(Debug)]
pub struct Comms {
    /// The underlying Unix stream socket.
    stream: UnixStream,
}

impl Comms {
    /// Wraps a connected Unix stream socket.
    pub const fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Creates a connected pair of channel ends.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Takes ownership of a channel inherited at a well-known descriptor
    /// (normally [`CLIENT_COMMS_FD`](crate::CLIENT_COMMS_FD)).
    ///
    /// Fails if `fd` is not open. The caller must not use `fd` afterwards.
    pub fn from_inherited_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the descriptor is open and was handed to this process for
        // exclusive use by the channel.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::new(UnixStream::from(owned)))
    }

    /// Sends a little-endian `i32`.
    pub fn send_i32(&mut self, value: i32) -> io::Result<()> {
        codec::write_frame(&mut self.stream, Tag::Int32, &value.to_le_bytes())
    }

    /// Receives a little-endian `i32`.
    pub fn recv_i32(&mut self) -> io::Result<i32> {
        let payload = codec::read_frame(&mut self.stream, Tag::Int32)?;
        let bytes: [u8; 4] = payload.as_slice().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("int32 frame carries {} bytes", payload.len()),
            )
        })?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Sends a length-prefixed byte buffer.
    pub fn send_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        codec::write_frame(&mut self.stream, Tag::Bytes, buf)
    }

    /// Receives a length-prefixed byte buffer.
    pub fn recv_bytes(&mut self) -> io::Result<Vec<u8>> {
        codec::read_frame(&mut self.stream, Tag::Bytes)
    }

    /// Sends a postcard-encoded message.
    pub fn send_msg(&mut self, msg: &impl Serialize) -> io::Result<()> {
        codec::encode(&mut self.stream, msg)
    }

    /// Receives a postcard-encoded message.
    pub fn recv_msg<T: for<'de> Deserialize<'de>>(&mut self) -> io::Result<T> {
        codec::decode(&mut self.stream)
    }

    /// Passes a duplicate of `fd` to the peer.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let header = Header {
            tag: Tag::Fd,
            len: 0,
        }
        .to_bytes();
        let fds = [fd.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(&header)];

        let sent = loop {
            match sendmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Err(Errno::EINTR) => {}
                other => break other?,
            }
        };
        // The descriptor rides on the first chunk; a short send only leaves
        // plain header bytes behind.
        self.stream.write_all(&header[sent..])
    }

    /// Receives a descriptor passed with [`Comms::send_fd`].
    ///
    /// The descriptor is received close-on-exec and owned by the caller.
    pub fn recv_fd(&mut self) -> io::Result<OwnedFd> {
        let mut header = [0u8; HEADER_LEN];
        let (filled, fd) = loop {
            match recv_with_fd(self.stream.as_raw_fd(), &mut header) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => break other?,
            }
        };
        if filled == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed while waiting for a descriptor",
            ));
        }
        self.stream.read_exact(&mut header[filled..])?;

        // Validate after draining the header so a stray descriptor is still
        // owned (and closed) on the error path.
        let header = Header::from_bytes(header)?.expect(Tag::Fd)?;
        if header.len != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "descriptor frame carries a payload",
            ));
        }
        fd.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "descriptor frame arrived without a descriptor",
            )
        })
    }
}

impl AsFd for Comms {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl From<Comms> for OwnedFd {
    fn from(comms: Comms) -> Self {
        comms.stream.into()
    }
}

/// Performs one `recvmsg(2)` into `buf`, collecting at most one descriptor.
///
/// Any additional descriptors in the same message are closed.
fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = nix::cmsg_space!(RawFd);
    let msg = recvmsg::<()>(sock, &mut iov, Some(&mut space), MsgFlags::MSG_CMSG_CLOEXEC)?;

    let mut received = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for raw in fds {
                // SAFETY: the kernel installed this descriptor for us; nothing
                // else refers to it yet.
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                if received.is_none() {
                    received = Some(owned);
                }
            }
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    Ok((msg.bytes, received))
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::{Hello, ProxyStatus};

    #[test]
    fn int_and_bytes_roundtrip() {
        let (mut a, mut b) = Comms::pair().unwrap();
        a.send_i32(31337).unwrap();
        a.send_bytes(b"payload").unwrap();
        a.send_i32(-1).unwrap();

        assert_eq!(b.recv_i32().unwrap(), 31337);
        assert_eq!(b.recv_bytes().unwrap(), b"payload");
        assert_eq!(b.recv_i32().unwrap(), -1);
    }

    #[test]
    fn messages_roundtrip() {
        let (mut a, mut b) = Comms::pair().unwrap();
        a.send_msg(&Hello { version: 1, pid: 7 }).unwrap();
        a.send_msg(&ProxyStatus::Denied("nope".into())).unwrap();

        let hello: Hello = b.recv_msg().unwrap();
        assert_eq!(hello.pid, 7);
        let status: ProxyStatus = b.recv_msg().unwrap();
        assert_eq!(status, ProxyStatus::Denied("nope".into()));
    }

    #[test]
    fn passes_descriptor() {
        let (mut a, mut b) = Comms::pair().unwrap();
        let (mut near, far) = UnixStream::pair().unwrap();

        a.send_fd(far.as_fd()).unwrap();
        drop(far);
        let received = UnixStream::from(b.recv_fd().unwrap());

        near.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        (&received).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn received_descriptor_is_cloexec() {
        let (mut a, mut b) = Comms::pair().unwrap();
        let (_near, far) = UnixStream::pair().unwrap();

        a.send_fd(far.as_fd()).unwrap();
        let fd = b.recv_fd().unwrap();
        // SAFETY: F_GETFD on a descriptor we own.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, libc::FD_CLOEXEC);
    }

    #[test]
    fn fd_after_other_frames() {
        let (mut a, mut b) = Comms::pair().unwrap();
        let (_near, far) = UnixStream::pair().unwrap();

        a.send_msg(&ProxyStatus::Connected).unwrap();
        a.send_fd(far.as_fd()).unwrap();
        a.send_i32(5).unwrap();

        assert_eq!(b.recv_msg::<ProxyStatus>().unwrap(), ProxyStatus::Connected);
        b.recv_fd().unwrap();
        assert_eq!(b.recv_i32().unwrap(), 5);
    }

    #[test]
    fn recv_fd_without_descriptor_is_protocol_error() {
        let (mut a, mut b) = Comms::pair().unwrap();
        a.send_i32(1).unwrap();
        let err = b.recv_fd().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn closed_channel_is_eof() {
        let (a, mut b) = Comms::pair().unwrap();
        drop(a);
        assert_eq!(b.recv_i32().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(b.recv_fd().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn inherited_fd_must_be_open() {
        let err = Comms::from_inherited_fd(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
