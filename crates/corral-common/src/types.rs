//! Domain primitive types used across the corral workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CorralError, Result};

/// Length of the display identifier derived from a container UUID.
pub const SHORT_NAME_LEN: usize = 8;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(Uuid);

impl ContainerId {
    /// Wraps an existing UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the stable 8-character display name used for the cgroup and
    /// the container directory.
    ///
    /// Truncation collisions between live containers are not detected.
    #[must_use]
    pub fn short_name(&self) -> String {
        let mut buf = Uuid::encode_buffer();
        let simple = self.0.simple().encode_lower(&mut buf);
        simple[..SHORT_NAME_LEN].to_string()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(Self).map_err(|_| CorralError::NotFound {
            kind: "container",
            id: s.to_string(),
        })
    }
}

/// Lifecycle state of a container.
///
/// Transitions only move forward:
/// `New -> Starting -> Running -> {Stopping -> Stopped, Exited}`. A failed
/// startup moves `Starting -> Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Allocated but startup has not begun.
    New,
    /// Startup steps are running.
    Starting,
    /// The process tree is up.
    Running,
    /// Teardown is in progress.
    Stopping,
    /// Teardown finished after an explicit stop.
    Stopped,
    /// The process tree exited on its own.
    Exited,
}

impl ContainerState {
    /// Returns whether moving from `self` to `next` keeps the lifecycle monotonic.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Starting | Self::Stopping)
                | (Self::Starting, Self::Running | Self::Stopping)
                | (Self::Running, Self::Stopping | Self::Exited)
                | (Self::Stopping, Self::Stopped)
        )
    }

    /// Returns true for `Stopped` and `Exited`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exited)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Linux namespaces a container may request. Each one is opt-in.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Namespaces {
    /// Isolate System V IPC and POSIX message queues.
    pub ipc: bool,
    /// Isolate hostname and domain name.
    pub uts: bool,
    /// Isolate the mount table.
    pub mount: bool,
    /// Isolate the process id space.
    pub pid: bool,
    /// Isolate the network stack.
    pub net: bool,
    /// Isolate user and group ids.
    pub user: bool,
}

impl Namespaces {
    /// Every namespace enabled.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            ipc: true,
            uts: true,
            mount: true,
            pid: true,
            net: true,
            user: true,
        }
    }

    /// Returns the names of namespaces set in `self` but not in `other`.
    #[must_use]
    pub fn missing_from(&self, other: &Self) -> Vec<&'static str> {
        [
            ("ipc", self.ipc, other.ipc),
            ("uts", self.uts, other.uts),
            ("mount", self.mount, other.mount),
            ("pid", self.pid, other.pid),
            ("net", self.net, other.net),
            ("user", self.user, other.user),
        ]
        .into_iter()
        .filter(|(_, wanted, present)| *wanted && !*present)
        .map(|(name, _, _)| name)
        .collect()
    }
}

/// A contiguous uid or gid mapping for a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the namespace.
    pub inside: u32,
    /// First id on the host.
    pub outside: u32,
    /// Number of ids mapped.
    pub count: u32,
}

impl IdMap {
    /// Renders the mapping in `/proc/<pid>/uid_map` format.
    #[must_use]
    pub fn to_proc_line(&self) -> String {
        format!("{} {} {}", self.inside, self.outside, self.count)
    }
}

impl Default for IdMap {
    fn default() -> Self {
        Self {
            inside: 0,
            outside: 100_000,
            count: 65_536,
        }
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inside, self.outside, self.count)
    }
}

impl FromStr for IdMap {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CorralError::Config {
            message: format!("invalid id map {s:?}, expected inside:outside:count"),
        };
        let mut parts = s.split(':').map(str::parse::<u32>);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(inside)), Some(Ok(outside)), Some(Ok(count)), None) => Ok(Self {
                inside,
                outside,
                count,
            }),
            _ => Err(invalid()),
        }
    }
}
