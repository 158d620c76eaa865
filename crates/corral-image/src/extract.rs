//! Tar extraction confined to a target directory.
//!
//! The stream may be a plain tar or gzip-compressed; compression is detected
//! from the first bytes rather than a file name. Absolute entry paths are
//! re-rooted under the target and any entry containing `..` aborts the
//! extraction.

use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use corral_common::error::{CorralError, Result};
use corral_common::types::IdMap;
use flate2::read::GzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How entries are written to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Apply the mode bits recorded in the archive.
    pub preserve_permissions: bool,
    /// Apply the uid/gid recorded in the archive.
    pub preserve_ownership: bool,
    /// Shift recorded ids into a user namespace range before applying them.
    pub id_shift: Option<IdMap>,
}

impl ExtractOptions {
    /// Options for a container root filesystem: permissions and ownership
    /// are kept, shifted by `id_shift` when the container has its own user
    /// namespace.
    #[must_use]
    pub const fn rootfs(id_shift: Option<IdMap>) -> Self {
        Self {
            preserve_permissions: true,
            preserve_ownership: true,
            id_shift,
        }
    }
}

/// Counts of what an extraction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Entries unpacked.
    pub entries: usize,
    /// Entries skipped because they resolved to the target itself.
    pub skipped: usize,
}

/// Unpacks the tar stream `reader` into `target`.
///
/// # Errors
///
/// Returns an error if the stream is not a valid archive, an entry path
/// contains `..`, or a file cannot be written.
pub fn extract<R: Read>(mut reader: R, target: &Path, options: &ExtractOptions) -> Result<ExtractSummary> {
    let mut head = [0u8; GZIP_MAGIC.len()];
    let filled = read_head(&mut reader, &mut head).map_err(|e| CorralError::io(target, e))?;
    let compressed = head[..filled] == GZIP_MAGIC;
    let stream = Cursor::new(head[..filled].to_vec()).chain(reader);
    let input: Box<dyn Read + '_> = if compressed {
        Box::new(GzDecoder::new(stream))
    } else {
        Box::new(stream)
    };
    tracing::debug!(target = %target.display(), compressed, "extracting image");

    let shifted = options.id_shift.is_some();
    let mut archive = tar::Archive::new(input);
    archive.set_preserve_permissions(options.preserve_permissions);
    archive.set_preserve_ownerships(options.preserve_ownership && !shifted);
    archive.set_overwrite(true);

    let mut summary = ExtractSummary::default();
    let entries = archive.entries().map_err(|e| CorralError::io(target, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CorralError::io(target, e))?;
        let raw = entry
            .path()
            .map_err(|e| CorralError::io(target, e))?
            .into_owned();
        let relative = confine(&raw).map_err(|e| CorralError::io(&raw, e))?;
        if relative.as_os_str().is_empty() {
            summary.skipped += 1;
            continue;
        }

        let unpacked = entry
            .unpack_in(target)
            .map_err(|e| CorralError::io(target.join(&relative), e))?;
        if !unpacked {
            summary.skipped += 1;
            continue;
        }
        if options.preserve_ownership {
            if let Some(map) = &options.id_shift {
                let header = entry.header();
                let uid = header.uid().map_err(|e| CorralError::io(&raw, e))?;
                let gid = header.gid().map_err(|e| CorralError::io(&raw, e))?;
                let path = target.join(&relative);
                std::os::unix::fs::lchown(&path, Some(shift(map, uid)), Some(shift(map, gid)))
                    .map_err(|e| CorralError::io(&path, e))?;
            }
        }
        summary.entries += 1;
    }

    tracing::info!(
        target = %target.display(),
        entries = summary.entries,
        skipped = summary.skipped,
        "image extracted"
    );
    Ok(summary)
}

/// Fills `head` from `reader`, stopping early only at end of stream, and
/// returns how many bytes were read.
fn read_head<R: Read>(reader: &mut R, head: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < head.len() {
        match reader.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Strips root and `.` components from an entry path, rejecting `..`.
fn confine(path: &Path) -> io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("archive entry {} escapes the target directory", path.display()),
                ));
            }
        }
    }
    Ok(out)
}

/// Maps an id recorded in the archive onto the host range of `map`. Ids
/// outside the mapped range fall back to the start of the range.
fn shift(map: &IdMap, id: u64) -> u32 {
    let inside = u64::from(map.inside);
    let offset = id
        .checked_sub(inside)
        .filter(|offset| *offset < u64::from(map.count))
        .unwrap_or(0);
    u32::try_from(u64::from(map.outside) + offset).unwrap_or(map.outside)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &[u8], mode: u32, data: &[u8]) {
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    fn archive(entries: &[(&[u8], u32, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, mode, data) in entries {
            append_file(&mut builder, name, *mode, data);
        }
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn plain_tar_is_extracted_with_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let tar = archive(&[(b"bin/tool", 0o750, b"#!/bin/sh\n"), (b"etc/motd", 0o644, b"hi")]);
        let options = ExtractOptions {
            preserve_permissions: true,
            ..ExtractOptions::default()
        };

        let summary = extract(&tar[..], dir.path(), &options).unwrap();

        assert_eq!(summary.entries, 2);
        assert_eq!(fs::read(dir.path().join("etc/motd")).unwrap(), b"hi");
        let mode = fs::metadata(dir.path().join("bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn gzip_stream_is_detected_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let tar = gzip(&archive(&[(b"hello.txt", 0o644, b"compressed")]));

        let summary = extract(&tar[..], dir.path(), &ExtractOptions::default()).unwrap();

        assert_eq!(summary.entries, 1);
        assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), b"compressed");
    }

    struct OneByte<'a>(&'a [u8]);

    impl Read for OneByte<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match (self.0.split_first(), buf.first_mut()) {
                (Some((byte, rest)), Some(slot)) => {
                    *slot = *byte;
                    self.0 = rest;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    #[test]
    fn gzip_is_detected_when_reads_are_short() {
        let dir = tempfile::tempdir().unwrap();
        let tar = gzip(&archive(&[(b"hello.txt", 0o644, b"trickled")]));

        let summary = extract(OneByte(&tar), dir.path(), &ExtractOptions::default()).unwrap();

        assert_eq!(summary.entries, 1);
        assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), b"trickled");
    }

    #[test]
    fn plain_tar_survives_short_reads() {
        let dir = tempfile::tempdir().unwrap();
        let tar = archive(&[(b"a", 0o644, b"x")]);

        let summary = extract(OneByte(&tar), dir.path(), &ExtractOptions::default()).unwrap();

        assert_eq!(summary.entries, 1);
    }

    #[test]
    fn absolute_paths_are_jailed() {
        let dir = tempfile::tempdir().unwrap();
        let tar = archive(&[(b"/etc/hostname", 0o644, b"jailed")]);

        let _ = extract(&tar[..], dir.path(), &ExtractOptions::default()).unwrap();

        assert_eq!(fs::read(dir.path().join("etc/hostname")).unwrap(), b"jailed");
    }

    #[test]
    fn parent_components_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rootfs");
        fs::create_dir(&target).unwrap();
        let tar = archive(&[(b"../escape", 0o644, b"nope")]);

        let err = extract(&tar[..], &target, &ExtractOptions::default()).unwrap_err();

        assert!(err.to_string().contains("escapes"));
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract(&[0x1f, 0x8b, 0, 0][..], dir.path(), &ExtractOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn ids_shift_into_mapped_range() {
        let map = IdMap::default();
        assert_eq!(shift(&map, 0), 100_000);
        assert_eq!(shift(&map, 1000), 101_000);
        assert_eq!(shift(&map, 70_000), 100_000);
    }
}
