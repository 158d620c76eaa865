//! User namespace id mapping.
//!
//! Maps container uids/gids onto an unprivileged host range.

use std::fs;
use std::path::PathBuf;

use corral_common::error::{CorralError, Result};
use corral_common::types::IdMap;

/// Writes the uid and gid maps of the user namespace `pid` lives in.
///
/// `setgroups` is denied first, which unprivileged writers require before
/// a gid map is accepted.
///
/// # Errors
///
/// Returns an error if writing `/proc/<pid>/setgroups`, `uid_map` or
/// `gid_map` fails.
pub fn write_id_maps(pid: i32, uid_map: &IdMap, gid_map: &IdMap) -> Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));

    let setgroups = proc_dir.join("setgroups");
    if setgroups.exists() {
        fs::write(&setgroups, "deny").map_err(|e| CorralError::io(&setgroups, e))?;
    }

    for (file, map) in [("uid_map", uid_map), ("gid_map", gid_map)] {
        let path = proc_dir.join(file);
        fs::write(&path, map.to_proc_line()).map_err(|e| CorralError::io(&path, e))?;
    }

    tracing::debug!(pid, %uid_map, %gid_map, "wrote uid/gid maps");
    Ok(())
}
