//! Linux namespace management for container isolation.
//!
//! Every namespace is opt-in: a [`Namespaces`] value with all fields false
//! unshares nothing.

pub mod user;
pub mod uts;

use corral_common::error::{CorralError, Result};
use corral_common::types::Namespaces;
use nix::sched::{CloneFlags, unshare};

/// Returns the clone flags matching the requested namespaces.
#[must_use]
pub fn clone_flags(namespaces: &Namespaces) -> CloneFlags {
    [
        (namespaces.ipc, CloneFlags::CLONE_NEWIPC),
        (namespaces.uts, CloneFlags::CLONE_NEWUTS),
        (namespaces.mount, CloneFlags::CLONE_NEWNS),
        (namespaces.pid, CloneFlags::CLONE_NEWPID),
        (namespaces.net, CloneFlags::CLONE_NEWNET),
        (namespaces.user, CloneFlags::CLONE_NEWUSER),
    ]
    .into_iter()
    .filter(|(enabled, _)| *enabled)
    .fold(CloneFlags::empty(), |flags, (_, flag)| flags | flag)
}

/// Moves the calling process into fresh copies of the requested namespaces.
///
/// With a PID namespace only children forked afterwards land inside it.
///
/// # Errors
///
/// Returns `CorralError::Os` if `unshare(2)` fails.
pub fn unshare_namespaces(namespaces: &Namespaces) -> Result<()> {
    let flags = clone_flags(namespaces);
    if flags.is_empty() {
        return Ok(());
    }
    unshare(flags).map_err(|e| CorralError::os(format!("unshare {flags:?}"), e))?;
    tracing::debug!(?flags, "namespaces unshared");
    Ok(())
}
