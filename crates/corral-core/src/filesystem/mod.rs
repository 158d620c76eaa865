//! Filesystem isolation for containers.
//!
//! Provides the `chroot` switch used by the spawner and the init
//! supervisor, and the mount-table scanning used by teardown.

pub mod chroot;
pub mod mount;
