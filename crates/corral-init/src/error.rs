//! Error types of the init supervisor and its client.

use corral_common::error::CorralError;
use thiserror::Error;

/// A request could not be decoded.
///
/// The peer only ever sees `PROTOCOL ERROR`; the detail is for logs.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Reading from the connection failed.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    /// The stream ended inside a frame.
    #[error("unexpected end of stream")]
    Truncated,
    /// The version line was not the supported version.
    #[error("unsupported protocol version {0:?}")]
    Version(String),
    /// A count or length line was not a decimal number.
    #[error("invalid number {0:?}")]
    Number(String),
    /// A count or length exceeded its limit.
    #[error("{what} of {value} exceeds limit {limit}")]
    Limit {
        /// Which field overflowed.
        what: &'static str,
        /// Value received.
        value: usize,
        /// Largest accepted value.
        limit: usize,
    },
    /// A string was not valid UTF-8.
    #[error("string is not valid UTF-8")]
    Utf8,
    /// The command verb is not known.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    /// The groups do not have the shape the command requires.
    #[error("malformed {command} request: {message}")]
    Shape {
        /// Command verb.
        command: &'static str,
        /// What is wrong with the arguments.
        message: String,
    },
}

/// A client request did not produce a successful reply.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The deadline passed before the reply was complete.
    #[error("request timed out")]
    Timeout,
    /// The supervisor rejected the framing of the request.
    #[error("supervisor reported a protocol error")]
    Protocol,
    /// The supervisor accepted the request but the command failed.
    #[error("request failed: {0}")]
    Rejected(String),
    /// The supervisor hit an internal error handling the request.
    #[error("supervisor internal error")]
    Internal,
    /// The reply did not follow the protocol.
    #[error("malformed reply: {0}")]
    Malformed(String),
    /// Connecting, writing or reading failed.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Returns true for [`ClientError::Timeout`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<ClientError> for CorralError {
    fn from(err: ClientError) -> Self {
        Self::Init {
            message: err.to_string(),
        }
    }
}
