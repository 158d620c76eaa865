//! Privilege restriction for unprivileged containers.

use corral_common::error::{CorralError, Result};

/// Sets `PR_SET_NO_NEW_PRIVS` on the calling process so that neither it nor
/// its descendants can gain privileges through setuid binaries or file
/// capabilities.
///
/// # Errors
///
/// Returns `CorralError::Os` if `prctl(2)` fails.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes integer arguments only and touches
    // no memory owned by this process.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(CorralError::os(
            "prctl(PR_SET_NO_NEW_PRIVS)",
            std::io::Error::last_os_error(),
        ));
    }
    tracing::debug!("no_new_privs set");
    Ok(())
}
