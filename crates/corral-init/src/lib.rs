//! # corral-init
//!
//! The init supervisor that runs as PID 1 inside every container, and the
//! host-side client that talks to it.
//!
//! - **Protocol**: line-oriented, length-prefixed framing of nested string
//!   groups, and the typed requests carried in it.
//! - **Supervisor**: named process table, zombie reaping, and `WAIT`
//!   wake-ups.
//! - **Server**: the Unix socket accept loop with signal handling.
//! - **Client**: a blocking client with a hard per-request deadline.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod supervisor;
