//! CPU bandwidth control and accounting for v1 cgroups.
//!
//! The quota is expressed against the CFS period. The child's period must
//! equal the parent's for the limit to take effect, so the period is copied
//! from the controller root before the quota is written.

use corral_common::error::Result;

use super::{Cgroup, read_u64, write_value};

const CPU_CONTROLLER: &str = "cpu";
const CPUACCT_CONTROLLER: &str = "cpuacct";
const CFS_PERIOD_FILE: &str = "cpu.cfs_period_us";
const CFS_QUOTA_FILE: &str = "cpu.cfs_quota_us";
const USAGE_FILE: &str = "cpuacct.usage";

impl Cgroup {
    /// Limits the group to `ms_per_sec` milliseconds of CPU time per
    /// wall-clock second.
    ///
    /// # Errors
    ///
    /// Returns an error if the host period cannot be read, the quota
    /// overflows, or a control file cannot be written.
    pub fn limit_cpu(&self, ms_per_sec: u64) -> Result<()> {
        let root = self.hierarchy().controller_path(CPU_CONTROLLER);
        let period = read_u64(&root.join(CFS_PERIOD_FILE))?;
        let quota = ms_per_sec
            .checked_mul(period / 1000)
            .ok_or_else(|| self.error(format!("cpu quota for {ms_per_sec}ms/s overflows")))?;

        let dir = self.path(CPU_CONTROLLER);
        write_value(&dir.join(CFS_PERIOD_FILE), period)?;
        write_value(&dir.join(CFS_QUOTA_FILE), quota)?;
        tracing::debug!(cgroup = %self.name(), period, quota, "cpu limit set");
        Ok(())
    }

    /// Returns the total CPU time consumed by the group, in nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if `cpuacct.usage` cannot be read.
    pub fn cpu_used(&self) -> Result<u64> {
        read_u64(&self.path(CPUACCT_CONTROLLER).join(USAGE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::cgroup::tests::{fake_cgroup_dirs, fake_hierarchy};

    #[test]
    fn quota_scales_with_host_period() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = fake_hierarchy(dir.path());
        fake_cgroup_dirs(&hierarchy, "web");
        fs::write(dir.path().join("cpu/cpu.cfs_period_us"), "100000\n").unwrap();
        fs::write(dir.path().join("cpu/web/cpu.cfs_period_us"), "").unwrap();
        fs::write(dir.path().join("cpu/web/cpu.cfs_quota_us"), "-1").unwrap();
        let cgroup = Cgroup::new(&hierarchy, "web").unwrap();

        cgroup.limit_cpu(250).unwrap();

        let period = fs::read_to_string(dir.path().join("cpu/web/cpu.cfs_period_us")).unwrap();
        let quota = fs::read_to_string(dir.path().join("cpu/web/cpu.cfs_quota_us")).unwrap();
        assert_eq!(period, "100000");
        assert_eq!(quota, "25000");
    }

    #[test]
    fn missing_host_period_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = fake_hierarchy(dir.path());
        fake_cgroup_dirs(&hierarchy, "web");
        let cgroup = Cgroup::new(&hierarchy, "web").unwrap();
        assert!(cgroup.limit_cpu(100).is_err());
    }

    #[test]
    fn cpu_used_reads_accounting_file() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = fake_hierarchy(dir.path());
        fake_cgroup_dirs(&hierarchy, "web");
        fs::write(dir.path().join("cpuacct/web/cpuacct.usage"), "123456789\n").unwrap();
        let cgroup = Cgroup::new(&hierarchy, "web").unwrap();
        assert_eq!(cgroup.cpu_used().unwrap(), 123_456_789);
    }
}
