//! Resource usage of running containers.
//!
//! CPU and memory come from the container's cgroup accounting files, disk
//! usage from filesystem statistics of its root filesystem.

use std::path::Path;

use corral_common::error::{CorralError, Result};
use corral_common::types::ContainerId;
use corral_core::cgroup::Cgroup;
use corral_core::cgroup::disk::disk_used;
use serde::{Deserialize, Serialize};

use crate::container::Container;

/// Snapshot of a container's resource usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Container this snapshot belongs to.
    pub container_id: ContainerId,
    /// Total CPU time consumed, in nanoseconds.
    pub cpu_usage_ns: u64,
    /// Current memory usage in bytes.
    pub memory_usage_bytes: u64,
    /// Bytes used on the filesystem holding the root filesystem.
    pub disk_used_bytes: i64,
}

/// Collects a metrics snapshot for `container`.
///
/// # Errors
///
/// Returns `CorralError::InvalidState` if the container has no cgroup, and
/// an I/O error if an accounting file or the filesystem cannot be read.
pub fn collect_metrics(container: &Container) -> Result<MetricsSnapshot> {
    let cgroup = container.cgroup().ok_or_else(|| CorralError::InvalidState {
        message: format!("container {} has no cgroup", container.id()),
    })?;
    collect(container.id(), &cgroup, &container.rootfs())
}

fn collect(container_id: ContainerId, cgroup: &Cgroup, rootfs: &Path) -> Result<MetricsSnapshot> {
    tracing::debug!(id = %container_id, cgroup = cgroup.name(), "collecting metrics");
    Ok(MetricsSnapshot {
        container_id,
        cpu_usage_ns: cgroup.cpu_used()?,
        memory_usage_bytes: cgroup.memory_used()?,
        disk_used_bytes: disk_used(rootfs)?,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use corral_core::cgroup::Hierarchy;

    use super::*;

    #[test]
    fn reads_accounting_files() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = Arc::new(Hierarchy::new(dir.path(), ["cpuacct", "memory"]));
        let cgroup = Cgroup::open(&hierarchy, "corral/abcd1234").unwrap();
        for (controller, file, value) in [
            ("cpuacct", "cpuacct.usage", "123456789\n"),
            ("memory", "memory.usage_in_bytes", "4096\n"),
        ] {
            let path = cgroup.path(controller);
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join(file), value).unwrap();
        }

        let id = ContainerId::generate();
        let snapshot = collect(id, &cgroup, dir.path()).unwrap();

        assert_eq!(snapshot.container_id, id);
        assert_eq!(snapshot.cpu_usage_ns, 123_456_789);
        assert_eq!(snapshot.memory_usage_bytes, 4096);
        assert!(snapshot.disk_used_bytes >= 0);
    }

    #[test]
    fn missing_accounting_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = Arc::new(Hierarchy::new(dir.path(), ["cpuacct", "memory"]));
        let cgroup = Cgroup::open(&hierarchy, "gone").unwrap();

        let err = collect(ContainerId::generate(), &cgroup, dir.path()).unwrap_err();
        assert!(err.is_not_found());
    }
}
