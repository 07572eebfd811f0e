//! Seccomp filters applied by the sandboxee to itself.
//!
//! Both filters only match `connect(2)`; every other syscall falls through
//! to `Allow` so earlier filters keep deciding for them.

use std::collections::BTreeMap;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, TargetArch};

use crate::error::Result;

/// Compiles a filter that applies `action` to `connect(2)` only.
fn connect_filter(action: SeccompAction) -> Result<BpfProgram> {
    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(seccompiler::Error::Backend)?;
    let rules = BTreeMap::from([(libc::SYS_connect, vec![])]);
    let filter = SeccompFilter::new(rules, SeccompAction::Allow, action, arch)
        .map_err(seccompiler::Error::Backend)?;
    let program: BpfProgram = filter.try_into().map_err(seccompiler::Error::Backend)?;
    Ok(program)
}

/// Filter making direct `connect(2)` calls fail with `EPERM`.
pub fn deny_connect() -> Result<BpfProgram> {
    #[allow(clippy::cast_sign_loss)]
    connect_filter(SeccompAction::Errno(libc::EPERM as u32))
}

/// Filter raising `SIGSYS` on every `connect(2)`.
pub fn trap_connect() -> Result<BpfProgram> {
    connect_filter(SeccompAction::Trap)
}

/// Applies `program` to every thread of the process.
///
/// Sets `PR_SET_NO_NEW_PRIVS` first, as seccomp requires for unprivileged
/// callers.
pub fn apply(program: &BpfProgram) -> Result<()> {
    seccompiler::apply_filter_all_threads(program)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_compile_for_host_arch() {
        let deny = deny_connect().unwrap();
        let trap = trap_connect().unwrap();
        assert!(!deny.is_empty());
        assert_eq!(deny.len(), trap.len());
    }
}
