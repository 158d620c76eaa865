//! Root directory switching via `chroot(2)`.

use std::path::Path;

use corral_common::error::{CorralError, Result};
use nix::unistd::{chdir, chroot};

/// Makes `new_root` the root directory of the calling process and moves the
/// working directory to the new `/`.
///
/// # Errors
///
/// Returns `CorralError::Os` if `chroot(2)` or `chdir(2)` fails.
pub fn enter_root(new_root: &Path) -> Result<()> {
    chroot(new_root).map_err(|e| CorralError::os(format!("chroot {}", new_root.display()), e))?;
    chdir("/").map_err(|e| CorralError::os("chdir /", e))?;
    tracing::debug!(root = %new_root.display(), "changed root");
    Ok(())
}
