//! Automatic mode: transparent interception of `connect(2)`.
//!
//! A seccomp filter turns every `connect(2)` into `SIGSYS`. The handler
//! pulls the descriptor and `sockaddr` out of the trapped syscall's
//! registers, runs the same exchange as [`ProxyClient::connect`], and writes
//! `0` or `-errno` into the return register, so the interrupted call returns
//! as if it had completed locally.
//!
//! The handler is not async-signal-safe: it allocates and takes the channel
//! lock. It relies on `SIGSYS` being raised synchronously by the trapped
//! `connect(2)`, so it only runs where the program itself called `connect`,
//! which must not happen while that thread holds the channel lock or is
//! inside the allocator. [`ProxyClient::connect`] emits no tracing events,
//! so the handler never contends for the logging writer.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::os::fd::BorrowedFd;
use std::sync::OnceLock;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::debug;

use crate::error::{Error, Result};
use crate::filter;
use crate::proxy::ProxyClient;

/// `si_code` for signals raised by `SECCOMP_RET_TRAP`.
const SYS_SECCOMP: i32 = 1;

/// Client used by the signal handler. Set exactly once.
static HANDLER_CLIENT: OnceLock<ProxyClient> = OnceLock::new();

/// Switches the process to automatic mode.
///
/// Must be called once, before any `connect(2)`. A second call fails
/// without touching the installed handler.
pub(crate) fn install(client: ProxyClient) -> Result<()> {
    claim(&HANDLER_CLIENT, client)?;

    let action = SigAction::new(
        SigHandler::SigAction(on_sigsys),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    // SAFETY: `on_sigsys` only touches the process-wide client, which is
    // initialized above and never replaced.
    unsafe { sigaction(Signal::SIGSYS, &action) }
        .map_err(|e| Error::local("sigaction", e.into()))?;

    filter::apply(&filter::trap_connect()?)?;
    debug!("network proxy handler installed");
    Ok(())
}

/// Stores the handler's client, rejecting a second installation.
fn claim(slot: &OnceLock<ProxyClient>, client: ProxyClient) -> Result<()> {
    if !supported_arch() {
        return Err(Error::Protocol(format!(
            "network proxy handler is not supported on {}",
            std::env::consts::ARCH
        )));
    }
    slot.set(client)
        .map_err(|_| Error::Protocol("network proxy handler is already installed".into()))
}

/// Whether register access is implemented for this architecture.
const fn supported_arch() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// `SIGSYS` handler servicing trapped `connect(2)` calls.
extern "C" fn on_sigsys(_signo: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    if info.is_null() || context.is_null() {
        return;
    }
    // SAFETY: the kernel passes valid siginfo/ucontext pointers to
    // SA_SIGINFO handlers.
    let (info, context) = unsafe { (&*info, &mut *context.cast::<libc::ucontext_t>()) };
    if info.si_code != SYS_SECCOMP {
        return;
    }

    let Some(call) = regs::syscall(context) else {
        return;
    };
    let result = if call.nr == libc::SYS_connect {
        handle_connect(call.args)
    } else {
        -i64::from(libc::ENOSYS)
    };
    regs::set_return(context, result);
}

/// Services one trapped `connect(fd, addr, addrlen)`; returns `0` or `-errno`.
fn handle_connect(args: [u64; 3]) -> i64 {
    let Some(client) = HANDLER_CLIENT.get() else {
        return -i64::from(libc::ENOSYS);
    };
    let Ok(fd) = i32::try_from(args[0]) else {
        return -i64::from(libc::EBADF);
    };
    let addr_ptr = args[1] as *const u8;
    let Ok(addr_len) = usize::try_from(args[2]) else {
        return -i64::from(libc::EINVAL);
    };
    if fd < 0 {
        return -i64::from(libc::EBADF);
    }
    if addr_ptr.is_null() || addr_len > size_of::<libc::sockaddr_storage>() {
        return -i64::from(libc::EINVAL);
    }

    // SAFETY: the trapped caller passed `addr_len` readable bytes at
    // `addr_ptr` (bounded by sockaddr_storage above), and `fd` stays open
    // for the duration of its own connect call.
    let (sock, addr) = unsafe {
        (
            BorrowedFd::borrow_raw(fd),
            std::slice::from_raw_parts(addr_ptr, addr_len),
        )
    };
    match client.connect(sock, addr) {
        Ok(()) => 0,
        Err(e) => -i64::from(e.errno()),
    }
}

/// A trapped syscall as seen in the signal context.
#[derive(Debug, Clone, Copy)]
struct TrappedCall {
    /// Syscall number.
    nr: i64,
    /// First three arguments.
    args: [u64; 3],
}

#[cfg(target_arch = "x86_64")]
mod regs {
    //! x86_64: number in `rax` (restored by the kernel on trap), arguments
    //! in `rdi`, `rsi`, `rdx`, result in `rax`.

    use super::TrappedCall;

    #[allow(clippy::cast_sign_loss)]
    pub(super) fn syscall(ctx: &libc::ucontext_t) -> Option<TrappedCall> {
        let gregs = &ctx.uc_mcontext.gregs;
        let reg = |r: libc::c_int| usize::try_from(r).ok().map(|i| gregs[i]);
        Some(TrappedCall {
            nr: reg(libc::REG_RAX)?,
            args: [
                reg(libc::REG_RDI)? as u64,
                reg(libc::REG_RSI)? as u64,
                reg(libc::REG_RDX)? as u64,
            ],
        })
    }

    pub(super) fn set_return(ctx: &mut libc::ucontext_t, value: i64) {
        if let Ok(i) = usize::try_from(libc::REG_RAX) {
            ctx.uc_mcontext.gregs[i] = value;
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod regs {
    //! aarch64: number in `x8`, arguments in `x0`..`x2`, result in `x0`.

    use super::TrappedCall;

    #[allow(clippy::cast_possible_wrap)]
    pub(super) fn syscall(ctx: &libc::ucontext_t) -> Option<TrappedCall> {
        let regs = &ctx.uc_mcontext.regs;
        Some(TrappedCall {
            nr: regs[8] as i64,
            args: [regs[0], regs[1], regs[2]],
        })
    }

    #[allow(clippy::cast_sign_loss)]
    pub(super) fn set_return(ctx: &mut libc::ucontext_t, value: i64) {
        ctx.uc_mcontext.regs[0] = value as u64;
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod regs {
    use super::TrappedCall;

    pub(super) const fn syscall(_ctx: &libc::ucontext_t) -> Option<TrappedCall> {
        None
    }

    pub(super) const fn set_return(_ctx: &mut libc::ucontext_t, _value: i64) {}
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use netproxy_proto::Comms;

    use super::*;

    fn client() -> ProxyClient {
        let (ours, _theirs) = Comms::pair().unwrap();
        ProxyClient::new(Arc::new(Mutex::new(ours)))
    }

    #[test]
    fn second_install_is_diagnosed() {
        let slot = OnceLock::new();
        claim(&slot, client()).unwrap();
        let err = claim(&slot, client()).unwrap_err();
        assert!(matches!(err, Error::Protocol(m) if m.contains("already installed")));
    }

    #[test]
    fn trap_before_install_reports_enosys() {
        // The test process never installs the handler.
        assert_eq!(handle_connect([3, 0, 28]), -i64::from(libc::ENOSYS));
    }
}
