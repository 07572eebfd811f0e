//! Pre-exec setup for the sandboxee.
//!
//! Applied after `fork()` but before `exec()`:
//! 1. **Channel**: `dup2` the control channel onto the well-known descriptor
//!    (`dup2` clears `FD_CLOEXEC` on the copy).
//! 2. **Die with parent**: `PR_SET_PDEATHSIG(SIGKILL)`.
//! 3. **FD cleanup**: close every inherited descriptor >= 3 except the
//!    channel.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

use netproxy_proto::CLIENT_COMMS_FD;

/// Installs the pre-exec hook; `channel` must stay open until spawn.
pub fn apply(cmd: &mut Command, channel: RawFd) {
    // SAFETY: only async-signal-safe syscalls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if channel == CLIENT_COMMS_FD {
                clear_cloexec(channel)?;
            } else if libc::dup2(channel, CLIENT_COMMS_FD) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);

            close_inherited_fds();
            Ok(())
        });
    }
}

/// Clears `FD_CLOEXEC` on `fd`.
pub(super) fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number is async-signal-safe.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Closes descriptors in `[3, CLIENT_COMMS_FD)` and above `CLIENT_COMMS_FD`.
#[allow(clippy::cast_sign_loss)]
fn close_inherited_fds() {
    let keep = CLIENT_COMMS_FD as u32;

    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range is an async-signal-safe syscall.
        let below = unsafe { libc::syscall(libc::SYS_close_range, 3_u32, keep - 1, 0_u32) };
        let above = unsafe { libc::syscall(libc::SYS_close_range, keep + 1, u32::MAX, 0_u32) };
        if below == 0 && above == 0 {
            return;
        }
    }

    // Fallback: close up to sysconf(_SC_OPEN_MAX).
    // SAFETY: sysconf and close are async-signal-safe.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = i32::try_from(max_fd).ok().filter(|&n| n > 0).unwrap_or(1024);
    for fd in (3..limit).filter(|&fd| fd != CLIENT_COMMS_FD) {
        unsafe { libc::close(fd) };
    }
}
