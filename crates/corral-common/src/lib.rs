//! # corral-common
//!
//! Shared types, error definitions, configuration models, manifests, and
//! constants used across the entire corral workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the foundational primitives that all other
//! crates build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod envmap;
pub mod error;
pub mod manifest;
pub mod types;
