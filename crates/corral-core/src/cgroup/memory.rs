//! Memory limits and accounting for v1 cgroups.

use corral_common::error::Result;

use super::{Cgroup, read_u64, write_value};

const MEMORY_CONTROLLER: &str = "memory";

impl Cgroup {
    /// Sets the hard memory limit in bytes.
    ///
    /// The current usage is not checked; the kernel decides what happens
    /// when the limit is below it.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the write.
    pub fn limit_memory(&self, bytes: u64) -> Result<()> {
        write_value(
            &self.path(MEMORY_CONTROLLER).join("memory.limit_in_bytes"),
            bytes,
        )?;
        tracing::debug!(cgroup = %self.name(), bytes, "memory limit set");
        Ok(())
    }

    /// Returns the memory currently charged to the group, in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `memory.usage_in_bytes` cannot be read.
    pub fn memory_used(&self) -> Result<u64> {
        read_u64(&self.path(MEMORY_CONTROLLER).join("memory.usage_in_bytes"))
    }
}
