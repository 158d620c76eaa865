//! Disk usage of a container root filesystem.

use std::path::Path;

use corral_common::error::{CorralError, Result};
use nix::sys::statvfs::statvfs;

/// Returns the bytes in use on the filesystem holding `root`.
///
/// # Errors
///
/// Returns an error if `statvfs(2)` fails or the result does not fit in an
/// `i64`.
pub fn disk_used(root: &Path) -> Result<i64> {
    let stat = statvfs(root).map_err(|e| CorralError::os(format!("statvfs {}", root.display()), e))?;
    #[allow(clippy::useless_conversion)]
    let used = u64::from(stat.blocks())
        .saturating_sub(u64::from(stat.blocks_free()))
        .saturating_mul(u64::from(stat.fragment_size()));
    i64::try_from(used).map_err(|e| {
        CorralError::io(
            root,
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("disk usage overflow: {e}")),
        )
    })
}
