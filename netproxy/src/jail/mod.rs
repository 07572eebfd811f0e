//! Launching the sandboxee.
//!
//! The child end of the control channel is placed on
//! [`CLIENT_COMMS_FD`](netproxy_proto::CLIENT_COMMS_FD); every other
//! inherited descriptor above stderr is closed before `exec`.

mod pre_exec;

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::debug;

/// Spawns `program` with `channel` on the well-known descriptor.
pub fn spawn<I, S>(program: &Path, args: I, channel: OwnedFd) -> io::Result<Child>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    spawn_command(cmd, channel)
}

/// Like [`spawn`], for a caller-configured command (stdio, environment).
///
/// `channel` is closed in the caller once the child is running, leaving the
/// child as its only holder.
pub fn spawn_command(mut cmd: Command, channel: OwnedFd) -> io::Result<Child> {
    pre_exec::apply(&mut cmd, channel.as_raw_fd());
    let child = cmd.spawn()?;
    debug!(
        pid = child.id(),
        program = ?cmd.get_program(),
        "sandboxee spawned"
    );
    Ok(child)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use netproxy_proto::{CLIENT_COMMS_FD, Comms};

    use super::*;

    #[test]
    fn channel_lands_on_well_known_fd() {
        let (_parent, child_end) = Comms::pair().unwrap();
        let script = format!("[ -S /proc/self/fd/{CLIENT_COMMS_FD} ]");
        let status = spawn(Path::new("/bin/sh"), ["-c", &script], child_end.into())
            .unwrap()
            .wait()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn other_descriptors_are_closed() {
        let (_parent, child_end) = Comms::pair().unwrap();
        // A descriptor without close-on-exec that the child must not see.
        let (inherited, _peer) = UnixStream::pair().unwrap();
        pre_exec::clear_cloexec(inherited.as_raw_fd()).unwrap();
        let script = format!("[ ! -e /proc/self/fd/{} ]", inherited.as_raw_fd());
        let status = spawn(Path::new("/bin/sh"), ["-c", &script], child_end.into())
            .unwrap()
            .wait()
            .unwrap();
        assert!(status.success());
    }
}
