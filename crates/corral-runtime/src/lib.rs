//! Container lifecycle management for the corral runtime.
//!
//! A [`manager::Manager`] owns the registry of live containers. Each
//! [`container::Container`] runs its startup steps in a background thread,
//! hands the process tree to a [`spawner::Spawner`], and tears everything
//! down again on stop or exit. [`api::ControlPlane`] is the surface exposed
//! to callers outside the process.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod api;
pub mod container;
pub mod enter;
pub mod manager;
pub mod metrics;
pub mod spawner;
