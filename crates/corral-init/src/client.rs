//! Blocking host-side client for the init supervisor.
//!
//! Every request opens a new connection. The configured timeout is a hard
//! deadline covering connect, write and the complete reply; when it passes
//! the connection is dropped and [`ClientError::Timeout`] is returned.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::protocol::{Request, StartRequest, encode};

const OK_LINE: &str = "REQUEST OK";
const FAILED_LINE: &str = "REQUEST FAILED";
const PROTOCOL_ERROR_LINE: &str = "PROTOCOL ERROR";
const INTERNAL_ERROR_LINE: &str = "INTERNAL ERROR";

/// Connection settings for one supervisor socket.
#[derive(Debug, Clone)]
pub struct Client {
    path: PathBuf,
    timeout: Duration,
}

impl Client {
    /// Creates a client for the socket at `path`.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Returns the socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends `request` and returns the payload lines of a successful reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when the deadline passes, and the
    /// matching variant for failed, rejected or malformed replies.
    pub fn request(&self, request: &Request) -> Result<Vec<String>, ClientError> {
        let deadline = Instant::now() + self.timeout;
        let mut stream = UnixStream::connect(&self.path)?;

        stream.set_write_timeout(Some(remaining(deadline)?))?;
        stream
            .write_all(&encode(&request.to_groups()))
            .map_err(timeout_or_io)?;

        let mut reply = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            stream.set_read_timeout(Some(remaining(deadline)?))?;
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => reply.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(timeout_or_io(e)),
            }
        }
        parse_reply(&reply)
    }

    /// Changes the supervisor's root directory.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub fn chroot(&self, directory: &str, privileged: bool) -> Result<(), ClientError> {
        self.request(&Request::Chroot {
            directory: directory.into(),
            privileged,
        })
        .map(drop)
    }

    /// Sets the container hostname.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub fn set_hostname(&self, hostname: &str) -> Result<(), ClientError> {
        self.request(&Request::SetHostname {
            hostname: hostname.into(),
        })
        .map(drop)
    }

    /// Starts a supervised process.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub fn start(&self, start: StartRequest) -> Result<(), ClientError> {
        self.request(&Request::Start(start)).map(drop)
    }

    /// Returns the status string of every tracked process.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub fn status(&self) -> Result<BTreeMap<String, String>, ClientError> {
        let lines = self.request(&Request::Status)?;
        let mut pairs = lines.chunks_exact(2);
        let status = pairs
            .by_ref()
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        if pairs.remainder().is_empty() {
            Ok(status)
        } else {
            Err(ClientError::Malformed("odd number of status lines".into()))
        }
    }

    /// Blocks until a running process exits, or returns at once when none
    /// is running.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub fn wait(&self) -> Result<(), ClientError> {
        self.request(&Request::Wait).map(drop)
    }
}

fn remaining(deadline: Instant) -> Result<Duration, ClientError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(ClientError::Timeout)
    } else {
        Ok(left)
    }
}

fn timeout_or_io(err: io::Error) -> ClientError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout,
        _ => ClientError::Io(err),
    }
}

/// Interprets a complete reply.
///
/// Successful replies are `REQUEST OK\n`, payload lines, and for `STATUS`
/// an `END` line; the payload is returned without the terminator.
fn parse_reply(reply: &[u8]) -> Result<Vec<String>, ClientError> {
    let text = std::str::from_utf8(reply)
        .map_err(|_| ClientError::Malformed("reply is not UTF-8".into()))?;
    let Some(body) = text.strip_suffix('\n') else {
        return Err(ClientError::Malformed(format!("unterminated reply {text:?}")));
    };
    let mut lines = body.split('\n');
    match lines.next() {
        Some(OK_LINE) => {
            let mut payload: Vec<String> = lines.map(ToString::to_string).collect();
            if payload.last().is_some_and(|line| line.is_empty() || line == "END") {
                let _ = payload.pop();
            }
            Ok(payload)
        }
        Some(FAILED_LINE) => Err(ClientError::Rejected(lines.collect::<Vec<_>>().join(" "))),
        Some(PROTOCOL_ERROR_LINE) => Err(ClientError::Protocol),
        Some(INTERNAL_ERROR_LINE) => Err(ClientError::Internal),
        _ => Err(ClientError::Malformed(format!("unexpected reply {text:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_reply_has_empty_payload() {
        assert!(parse_reply(b"REQUEST OK\n\n").unwrap().is_empty());
    }

    #[test]
    fn status_reply_payload_excludes_terminator() {
        let lines = parse_reply(b"REQUEST OK\napp\nrunning\nEND\n").unwrap();
        assert_eq!(lines, vec!["app", "running"]);
    }

    #[test]
    fn failure_replies_are_classified() {
        assert!(matches!(
            parse_reply(b"REQUEST FAILED\nno such file\n"),
            Err(ClientError::Rejected(msg)) if msg == "no such file"
        ));
        assert!(matches!(parse_reply(b"PROTOCOL ERROR\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse_reply(b"INTERNAL ERROR\n"), Err(ClientError::Internal)));
        assert!(matches!(parse_reply(b""), Err(ClientError::Malformed(_))));
    }

    #[test]
    fn missing_socket_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(dir.path().join("init.sock"), Duration::from_secs(1));
        assert!(matches!(client.wait(), Err(ClientError::Io(_))));
    }

    #[test]
    fn silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let client = Client::new(&path, Duration::from_millis(200));

        let err = client.status().unwrap_err();

        assert!(err.is_timeout());
        drop(listener);
    }
}
