//! # corral-core
//!
//! Low-level Linux isolation primitives for the corral runtime.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v1**: one directory per controller, task membership, signaling,
//!   CPU and memory limits, and accounting reads.
//! - **Namespaces**: clone flags for IPC, UTS, mount, PID, network and user
//!   isolation, plus uid/gid map writing.
//! - **Filesystem**: `chroot`, mount-table scanning and nested unmounts.
//! - **Spawning**: the re-exec based namespace/chroot spawner and its
//!   in-process "spawn mode" entry point.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod spawn;
