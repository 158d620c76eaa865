//! Mount-table helpers for container setup and teardown.

use std::fs;
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Returns mount points at or below `dir`, in reverse order of appearance
/// in `table`.
///
/// `table` uses the `/proc/mounts` format, where the second field is the
/// mount point with spaces and other specials octal-escaped. The kernel
/// lists parents before the mounts stacked under them, so the returned
/// order unmounts children first.
#[must_use]
pub fn nested_mounts(table: &str, dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape(field)))
        .filter(|point| point.starts_with(dir))
        .collect();
    found.reverse();
    found
}

/// Decodes the `\NNN` octal escapes used in `/proc/mounts`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = bytes.get(i + 1..i + 4).and_then(octal) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn octal(digits: &[u8]) -> Option<u8> {
    digits.iter().try_fold(0u8, |acc, &d| {
        if (b'0'..=b'7').contains(&d) {
            acc.checked_mul(8)?.checked_add(d - b'0')
        } else {
            None
        }
    })
}

/// Lazily unmounts every mount point at or below `dir`, deepest first.
///
/// Mounts that disappear in the meantime are skipped.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read or an unmount fails
/// for another reason.
pub fn unmount_nested(dir: &Path) -> Result<()> {
    let table = fs::read_to_string(MOUNT_TABLE).map_err(|e| CorralError::io(MOUNT_TABLE, e))?;
    for point in nested_mounts(&table, dir) {
        match umount2(&point, MntFlags::MNT_DETACH) {
            Ok(()) => tracing::debug!(path = %point.display(), "unmounted"),
            Err(Errno::EINVAL | Errno::ENOENT) => {}
            Err(e) => {
                return Err(CorralError::os(format!("umount {}", point.display()), e));
            }
        }
    }
    Ok(())
}

/// Stops mount events propagating from the current mount namespace back to
/// the host.
///
/// # Errors
///
/// Returns `CorralError::Os` if `mount(2)` fails.
pub fn make_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| CorralError::os("make / private", e))
}

/// Mounts a fresh `proc` filesystem at `target`, creating the directory if
/// needed.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or `mount(2)` fails.
pub fn mount_proc(target: &Path) -> Result<()> {
    fs::create_dir_all(target).map_err(|e| CorralError::io(target, e))?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| CorralError::os(format!("mount proc on {}", target.display()), e))?;
    tracing::debug!(path = %target.display(), "mounted proc");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
tmpfs /c/a tmpfs rw 0 0
proc /proc proc rw 0 0
tmpfs /c/a/b tmpfs rw 0 0
tmpfs /c/a/b/c tmpfs rw 0 0
tmpfs /c/ab tmpfs rw 0 0
";

    #[test]
    fn nested_mounts_are_returned_deepest_first() {
        let found = nested_mounts(TABLE, Path::new("/c/a"));
        assert_eq!(
            found,
            vec![
                PathBuf::from("/c/a/b/c"),
                PathBuf::from("/c/a/b"),
                PathBuf::from("/c/a"),
            ]
        );
    }

    #[test]
    fn sibling_prefixes_are_not_nested() {
        let found = nested_mounts(TABLE, Path::new("/c/a"));
        assert!(!found.contains(&PathBuf::from("/c/ab")));
    }

    #[test]
    fn escaped_mount_points_are_decoded() {
        let table = "tmpfs /var/lib/my\\040dir/rootfs tmpfs rw 0 0\n";
        let found = nested_mounts(table, Path::new("/var/lib/my dir"));
        assert_eq!(found, vec![PathBuf::from("/var/lib/my dir/rootfs")]);
    }

    #[test]
    fn unmount_nested_ignores_unmounted_directories() {
        let dir = tempfile::tempdir().unwrap();
        unmount_nested(dir.path()).unwrap();
    }
}
