//! Unified error types for the corral workspace.
//!
//! Each higher-level crate defines its own domain-specific error enum that wraps
//! these common variants when appropriate.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CorralError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A system call failed.
    #[error("{operation} failed: {source}")]
    Os {
        /// Operation and context, e.g. `chroot /var/lib/corral/ab12cd34/rootfs`.
        operation: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// An image manifest failed validation.
    #[error("invalid manifest: {message}")]
    InvalidManifest {
        /// Description of the validation failure.
        message: String,
    },

    /// A cgroup could not be created or manipulated.
    #[error("cgroup {name}: {message}")]
    Cgroup {
        /// Hierarchical cgroup name.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the conflict.
        message: String,
    },

    /// The container process tree could not be launched.
    #[error("spawn failed: {message}")]
    Spawn {
        /// Description of the failure.
        message: String,
    },

    /// The in-container init supervisor rejected or failed a request.
    #[error("init supervisor: {message}")]
    Init {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CorralError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a syscall error with the operation that produced it.
    pub fn os(operation: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Os {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Returns true when the underlying I/O error is `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io { source, .. } | Self::Os { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            Self::NotFound { .. } => true,
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;
