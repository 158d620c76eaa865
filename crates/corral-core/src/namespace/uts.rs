//! UTS namespace hostname control.

use corral_common::error::{CorralError, Result};

/// Sets the hostname of the calling process's UTS namespace.
///
/// # Errors
///
/// Returns `CorralError::Os` if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname)
        .map_err(|e| CorralError::os(format!("sethostname {hostname}"), e))?;
    tracing::debug!(hostname, "hostname set");
    Ok(())
}
