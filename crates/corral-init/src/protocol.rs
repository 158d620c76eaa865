//! Wire format of the init supervisor.
//!
//! A request is a list of groups, each a list of byte strings:
//!
//! ```text
//! 1\n                  protocol version
//! <N>\n                number of groups
//!   <M>\n              number of strings in the group
//!     <len>\n<bytes>   each string, no separator after the bytes
//! ```
//!
//! Strings must be UTF-8; any other byte sequence is a protocol error, so
//! paths, arguments and environment entries that are not valid UTF-8
//! cannot be sent.
//!
//! The first string of the first group is the command verb. Replies are
//! plain lines: [`REPLY_OK`], [`REPLY_FAILED`] followed by a message line,
//! [`REPLY_PROTOCOL_ERROR`], or [`REPLY_INTERNAL_ERROR`].

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::ProtocolError;

/// The only supported protocol version.
pub const VERSION: &str = "1";

/// Reply to any request that could not be decoded.
pub const REPLY_PROTOCOL_ERROR: &str = "PROTOCOL ERROR\n";

/// Successful reply with no payload.
pub const REPLY_OK: &str = "REQUEST OK\n\n";

/// First line of a reply to a command that failed.
pub const REPLY_FAILED: &str = "REQUEST FAILED\n";

/// Reply when the handler itself crashed.
pub const REPLY_INTERNAL_ERROR: &str = "INTERNAL ERROR\n";

/// Terminator of a `STATUS` reply.
pub const STATUS_END: &str = "END";

/// Largest accepted string, in bytes.
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Largest accepted number of groups, and of strings in one group.
pub const MAX_ITEMS: usize = 4096;

/// Longest accepted number line, newline excluded.
const MAX_NUMBER_LEN: usize = 20;

/// Decoded request body.
pub type Groups = Vec<Vec<String>>;

/// Encodes `groups` in the wire format.
#[must_use]
pub fn encode(groups: &[Vec<String>]) -> Vec<u8> {
    let mut out = format!("{VERSION}\n{}\n", groups.len()).into_bytes();
    for group in groups {
        out.extend_from_slice(format!("{}\n", group.len()).as_bytes());
        for value in group {
            out.extend_from_slice(format!("{}\n", value.len()).as_bytes());
            out.extend_from_slice(value.as_bytes());
        }
    }
    out
}

/// Where the decoder is within a request.
enum Frame {
    Version,
    GroupCount,
    StringCount { groups_left: usize },
    Length { groups_left: usize, strings_left: usize },
    Bytes { groups_left: usize, strings_left: usize, len: usize },
    Done,
}

/// Reads one complete request.
///
/// # Errors
///
/// Returns a [`ProtocolError`] on any framing violation; nothing of a
/// partially read request is returned.
pub async fn read_groups<R>(reader: &mut R) -> Result<Groups, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut groups: Groups = Vec::new();
    let mut frame = Frame::Version;
    loop {
        frame = match frame {
            Frame::Version => {
                let line = read_line(reader).await?;
                if line != VERSION {
                    return Err(ProtocolError::Version(line));
                }
                Frame::GroupCount
            }
            Frame::GroupCount => {
                let count = read_number(reader, "group count", MAX_ITEMS).await?;
                groups.reserve(count);
                Frame::StringCount { groups_left: count }
            }
            Frame::StringCount { groups_left: 0 } => Frame::Done,
            Frame::StringCount { groups_left } => {
                let count = read_number(reader, "string count", MAX_ITEMS).await?;
                groups.push(Vec::with_capacity(count));
                Frame::Length {
                    groups_left: groups_left - 1,
                    strings_left: count,
                }
            }
            Frame::Length {
                groups_left,
                strings_left: 0,
            } => Frame::StringCount { groups_left },
            Frame::Length {
                groups_left,
                strings_left,
            } => {
                let len = read_number(reader, "string length", MAX_STRING_LEN).await?;
                Frame::Bytes {
                    groups_left,
                    strings_left,
                    len,
                }
            }
            Frame::Bytes {
                groups_left,
                strings_left,
                len,
            } => {
                let mut bytes = vec![0; len];
                let _ = reader.read_exact(&mut bytes).await.map_err(eof)?;
                let value = String::from_utf8(bytes).map_err(|_| ProtocolError::Utf8)?;
                if let Some(group) = groups.last_mut() {
                    group.push(value);
                }
                Frame::Length {
                    groups_left,
                    strings_left: strings_left - 1,
                }
            }
            Frame::Done => return Ok(groups),
        };
    }
}

fn eof(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(err)
    }
}

/// Reads a `\n`-terminated line of at most [`MAX_NUMBER_LEN`] bytes.
async fn read_line<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(MAX_NUMBER_LEN + 1).unwrap_or(u64::MAX);
    let _ = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(if buf.len() >= MAX_NUMBER_LEN {
            ProtocolError::Number(String::from_utf8_lossy(&buf).into_owned())
        } else {
            ProtocolError::Truncated
        });
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::Utf8)
}

async fn read_number<R>(
    reader: &mut R,
    what: &'static str,
    limit: usize,
) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    if line.is_empty() || !line.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::Number(line));
    }
    let value: usize = line.parse().map_err(|_| ProtocolError::Number(line.clone()))?;
    if value > limit {
        return Err(ProtocolError::Limit { what, value, limit });
    }
    Ok(value)
}

/// Arguments of a `START` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Process name; generated when absent or empty.
    pub name: Option<String>,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Working directory.
    pub working_directory: String,
    /// Complete environment as `KEY=VALUE`.
    pub environment: Vec<String>,
    /// File stdout is appended to.
    pub stdout: String,
    /// File stderr is appended to.
    pub stderr: String,
    /// Uid to run as.
    pub uid: u32,
    /// Gid to run as.
    pub gid: u32,
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Change the supervisor's root directory.
    Chroot {
        /// New root.
        directory: String,
        /// Skip setting `no_new_privs`.
        privileged: bool,
    },
    /// Set the container hostname.
    SetHostname {
        /// New hostname.
        hostname: String,
    },
    /// Replace the supervisor with a command.
    Exec {
        /// Command and arguments.
        command: Vec<String>,
        /// Complete environment as `KEY=VALUE`.
        environment: Vec<String>,
        /// File stdout is appended to.
        stdout: String,
        /// File stderr is appended to.
        stderr: String,
    },
    /// Start a supervised process.
    Start(StartRequest),
    /// Report every tracked process.
    Status,
    /// Block until a running process exits.
    Wait,
}

const CHROOT: &str = "CHROOT";
const SETHOSTNAME: &str = "SETHOSTNAME";
const EXEC: &str = "EXEC";
const START: &str = "START";
const STATUS: &str = "STATUS";
const WAIT: &str = "WAIT";

impl Request {
    /// Returns the command verb.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Chroot { .. } => CHROOT,
            Self::SetHostname { .. } => SETHOSTNAME,
            Self::Exec { .. } => EXEC,
            Self::Start(_) => START,
            Self::Status => STATUS,
            Self::Wait => WAIT,
        }
    }

    /// Interprets decoded groups. Arity is strict: missing or extra groups
    /// or strings are errors.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownCommand`] or [`ProtocolError::Shape`].
    pub fn from_groups(groups: Groups) -> Result<Self, ProtocolError> {
        let Some(verb) = groups.first().and_then(|head| head.first()).cloned() else {
            return Err(ProtocolError::UnknownCommand(String::new()));
        };
        let mut groups = groups.into_iter();
        let head = groups.next().unwrap_or_default();
        let rest: Vec<Vec<String>> = groups.collect();

        match verb.as_str() {
            CHROOT => {
                expect_groups(CHROOT, &rest, 0)?;
                let [_, directory, privileged] = take_exact(CHROOT, head)?;
                Ok(Self::Chroot {
                    directory,
                    privileged: parse_bool(CHROOT, &privileged)?,
                })
            }
            SETHOSTNAME => {
                expect_groups(SETHOSTNAME, &rest, 0)?;
                let [_, hostname] = take_exact(SETHOSTNAME, head)?;
                Ok(Self::SetHostname { hostname })
            }
            EXEC => {
                expect_groups(EXEC, &rest, 3)?;
                let [_] = take_exact(EXEC, head)?;
                let mut rest = rest.into_iter();
                let command = non_empty(EXEC, rest.next().unwrap_or_default())?;
                let environment = checked_env(EXEC, rest.next().unwrap_or_default())?;
                let [stdout, stderr] = take_exact(EXEC, rest.next().unwrap_or_default())?;
                Ok(Self::Exec {
                    command,
                    environment,
                    stdout,
                    stderr,
                })
            }
            START => {
                expect_groups(START, &rest, 5)?;
                let name = match head.len() {
                    1 => None,
                    2 => head.into_iter().nth(1).filter(|name| !name.is_empty()),
                    n => return Err(shape(START, format!("first group has {n} strings"))),
                };
                let mut rest = rest.into_iter();
                let command = non_empty(START, rest.next().unwrap_or_default())?;
                let [working_directory] = take_exact(START, rest.next().unwrap_or_default())?;
                let environment = checked_env(START, rest.next().unwrap_or_default())?;
                let [stdout, stderr] = take_exact(START, rest.next().unwrap_or_default())?;
                let [uid, gid] = take_exact(START, rest.next().unwrap_or_default())?;
                Ok(Self::Start(StartRequest {
                    name,
                    command,
                    working_directory,
                    environment,
                    stdout,
                    stderr,
                    uid: parse_id(&uid)?,
                    gid: parse_id(&gid)?,
                }))
            }
            STATUS => {
                expect_groups(STATUS, &rest, 0)?;
                let [_] = take_exact(STATUS, head)?;
                Ok(Self::Status)
            }
            WAIT => {
                expect_groups(WAIT, &rest, 0)?;
                let [_] = take_exact(WAIT, head)?;
                Ok(Self::Wait)
            }
            _ => Err(ProtocolError::UnknownCommand(verb)),
        }
    }

    /// Renders the request as wire groups.
    #[must_use]
    pub fn to_groups(&self) -> Groups {
        match self {
            Self::Chroot {
                directory,
                privileged,
            } => vec![vec![CHROOT.into(), directory.clone(), privileged.to_string()]],
            Self::SetHostname { hostname } => vec![vec![SETHOSTNAME.into(), hostname.clone()]],
            Self::Exec {
                command,
                environment,
                stdout,
                stderr,
            } => vec![
                vec![EXEC.into()],
                command.clone(),
                environment.clone(),
                vec![stdout.clone(), stderr.clone()],
            ],
            Self::Start(start) => {
                let mut head = vec![START.to_string()];
                head.extend(start.name.clone());
                vec![
                    head,
                    start.command.clone(),
                    vec![start.working_directory.clone()],
                    start.environment.clone(),
                    vec![start.stdout.clone(), start.stderr.clone()],
                    vec![start.uid.to_string(), start.gid.to_string()],
                ]
            }
            Self::Status => vec![vec![STATUS.into()]],
            Self::Wait => vec![vec![WAIT.into()]],
        }
    }
}

fn shape(command: &'static str, message: String) -> ProtocolError {
    ProtocolError::Shape { command, message }
}

fn expect_groups(command: &'static str, rest: &[Vec<String>], want: usize) -> Result<(), ProtocolError> {
    if rest.len() == want {
        Ok(())
    } else {
        Err(shape(
            command,
            format!("expected {} groups, got {}", want + 1, rest.len() + 1),
        ))
    }
}

fn take_exact<const N: usize>(command: &'static str, group: Vec<String>) -> Result<[String; N], ProtocolError> {
    let len = group.len();
    group
        .try_into()
        .map_err(|_| shape(command, format!("expected {N} strings in group, got {len}")))
}

fn non_empty(command: &'static str, group: Vec<String>) -> Result<Vec<String>, ProtocolError> {
    if group.is_empty() {
        Err(shape(command, "command group is empty".into()))
    } else {
        Ok(group)
    }
}

fn checked_env(command: &'static str, group: Vec<String>) -> Result<Vec<String>, ProtocolError> {
    if let Some(bad) = group
        .iter()
        .find(|var| var.split_once('=').is_none_or(|(key, _)| key.is_empty()))
    {
        return Err(shape(command, format!("invalid environment entry {bad:?}")));
    }
    Ok(group)
}

fn parse_bool(command: &'static str, value: &str) -> Result<bool, ProtocolError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(shape(command, format!("invalid boolean {other:?}"))),
    }
}

fn parse_id(value: &str) -> Result<u32, ProtocolError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::Number(value.to_string()));
    }
    value
        .parse()
        .map_err(|_| ProtocolError::Number(value.to_string()))
}

/// Splits a `KEY=VALUE` list into pairs.
#[must_use]
pub fn env_pairs(environment: &[String]) -> Vec<(&str, &str)> {
    environment
        .iter()
        .filter_map(|var| var.split_once('='))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(raw: &[&[&str]]) -> Groups {
        raw.iter()
            .map(|group| group.iter().map(ToString::to_string).collect())
            .collect()
    }

    async fn decode(bytes: &[u8]) -> Result<Groups, ProtocolError> {
        let mut reader = bytes;
        read_groups(&mut reader).await
    }

    #[tokio::test]
    async fn start_request_survives_the_wire() {
        let sent = groups(&[
            &["START", "name"],
            &["cmd", "arg"],
            &["dir"],
            &["ENV=1"],
            &["out", "err"],
            &["99", "99"],
        ]);
        let received = decode(&encode(&sent)).await.unwrap();
        assert_eq!(received, sent);

        let Request::Start(start) = Request::from_groups(received).unwrap() else {
            panic!("expected START");
        };
        assert_eq!(start.name.as_deref(), Some("name"));
        assert_eq!(start.command, vec!["cmd", "arg"]);
        assert_eq!(start.uid, 99);
    }

    #[tokio::test]
    async fn non_utf8_strings_are_rejected() {
        assert!(matches!(
            decode(b"1\n1\n1\n2\n\xff\xfe").await,
            Err(ProtocolError::Utf8)
        ));
    }

    #[test]
    fn encoding_is_byte_exact() {
        let bytes = encode(&groups(&[&["SETHOSTNAME", "box"], &[""]]));
        assert_eq!(bytes, b"1\n2\n2\n11\nSETHOSTNAME3\nbox1\n0\n");
    }

    #[tokio::test]
    async fn zero_length_strings_are_legal() {
        let received = decode(b"1\n1\n2\n0\n4\nWAIT").await.unwrap();
        assert_eq!(received, groups(&[&["", "WAIT"]]));
    }

    #[tokio::test]
    async fn framing_errors_are_detected() {
        assert!(matches!(decode(b"0\n1\n1\n4\nWAIT").await, Err(ProtocolError::Version(_))));
        assert!(matches!(decode(b"1\nx\n").await, Err(ProtocolError::Number(_))));
        assert!(matches!(decode(b"1\n-1\n").await, Err(ProtocolError::Number(_))));
        assert!(matches!(decode(b"1\n1\n1\n10\nWAIT").await, Err(ProtocolError::Truncated)));
        assert!(matches!(decode(b"1\n1").await, Err(ProtocolError::Truncated)));
        assert!(matches!(decode(b"1\n99999\n").await, Err(ProtocolError::Limit { .. })));
        assert!(matches!(
            decode(b"1\n111111111111111111111111111111\n").await,
            Err(ProtocolError::Number(_))
        ));
    }

    #[test]
    fn arity_is_strict() {
        assert!(Request::from_groups(groups(&[&["STATUS"]])).is_ok());
        assert!(Request::from_groups(groups(&[&["STATUS"], &[]])).is_err());
        assert!(Request::from_groups(groups(&[&["WAIT", "now"]])).is_err());
        assert!(Request::from_groups(groups(&[&["CHROOT", "/x"]])).is_err());
        assert!(Request::from_groups(groups(&[&["CHROOT", "/x", "yes"]])).is_err());
        assert!(Request::from_groups(groups(&[&["EXEC"], &[], &[], &["o", "e"]])).is_err());
        assert!(Request::from_groups(Vec::new()).is_err());
    }

    #[test]
    fn unknown_verbs_are_rejected() {
        assert!(matches!(
            Request::from_groups(groups(&[&["REBOOT"]])),
            Err(ProtocolError::UnknownCommand(verb)) if verb == "REBOOT"
        ));
    }

    #[test]
    fn environment_entries_need_a_key() {
        let bad = groups(&[&["EXEC"], &["/bin/true"], &["=x"], &["o", "e"]]);
        assert!(Request::from_groups(bad).is_err());
        let bad = groups(&[&["EXEC"], &["/bin/true"], &["NOEQUALS"], &["o", "e"]]);
        assert!(Request::from_groups(bad).is_err());
    }

    #[test]
    fn requests_render_back_to_groups() {
        let requests = [
            Request::Chroot {
                directory: "/rootfs".into(),
                privileged: false,
            },
            Request::SetHostname {
                hostname: "box".into(),
            },
            Request::Start(StartRequest {
                name: None,
                command: vec!["/bin/sleep".into(), "1".into()],
                working_directory: "/".into(),
                environment: vec!["PATH=/bin".into()],
                stdout: "/dev/null".into(),
                stderr: "/dev/null".into(),
                uid: 0,
                gid: 0,
            }),
            Request::Status,
            Request::Wait,
        ];
        for request in requests {
            assert_eq!(Request::from_groups(request.to_groups()).unwrap(), request);
        }
    }

    #[test]
    fn blank_start_name_means_generated() {
        let raw = groups(&[&["START", ""], &["/bin/true"], &["/"], &[], &["o", "e"], &["0", "0"]]);
        let Request::Start(start) = Request::from_groups(raw).unwrap() else {
            panic!("expected START");
        };
        assert_eq!(start.name, None);
    }
}
