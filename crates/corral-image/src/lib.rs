//! # corral-image
//!
//! Container filesystem images for the corral runtime.
//!
//! Handles:
//! - **Extraction**: plain or gzip-compressed tar streams, sniffed by magic
//!   bytes, unpacked with paths confined to the target directory.
//! - **Hashing**: a pass-through reader computing the SHA-512 digest of
//!   everything read from the image stream.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod extract;
pub mod hash;
