//! Runtime configuration passed explicitly to the manager and cgroup layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CorralError, Result};
use crate::types::{IdMap, Namespaces};

/// Root configuration for the corral runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding one subdirectory per container.
    pub containers_dir: PathBuf,
    /// Cgroup mount root with one subdirectory per controller.
    pub cgroup_root: PathBuf,
    /// Parent cgroup name under which container cgroups are created.
    pub cgroup_parent: String,
    /// Controllers every container cgroup is created in.
    pub controllers: Vec<String>,
    /// Host path of the stage3 init binary copied into each container.
    pub init_binary: PathBuf,
    /// Namespaces every manifest must request to be accepted.
    pub required_namespaces: Namespaces,
    /// Uid/gid mapping used when a container requests a user namespace.
    pub user_namespace_map: IdMap,
    /// How long to wait for the stage3 socket to appear, in milliseconds.
    pub init_socket_timeout_ms: u64,
    /// Deadline applied to each stage3 request, in milliseconds.
    pub init_request_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            containers_dir: PathBuf::from(constants::DEFAULT_CONTAINERS_DIR),
            cgroup_root: PathBuf::from(constants::DEFAULT_CGROUP_ROOT),
            cgroup_parent: constants::DEFAULT_CGROUP_PARENT.to_string(),
            controllers: constants::CGROUP_CONTROLLERS
                .iter()
                .map(ToString::to_string)
                .collect(),
            init_binary: PathBuf::from(constants::DEFAULT_INIT_BINARY),
            required_namespaces: Namespaces::default(),
            user_namespace_map: IdMap::default(),
            init_socket_timeout_ms: 10_000,
            init_request_timeout_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration from a JSON file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CorralError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.controllers.is_empty() {
            return Err(CorralError::Config {
                message: "at least one cgroup controller is required".into(),
            });
        }
        if self.cgroup_parent.is_empty() || self.cgroup_parent.starts_with('/') {
            return Err(CorralError::Config {
                message: format!(
                    "cgroup parent must be a relative name, got {:?}",
                    self.cgroup_parent
                ),
            });
        }
        if self.user_namespace_map.count == 0 {
            return Err(CorralError::Config {
                message: "user namespace map must cover at least one id".into(),
            });
        }
        Ok(())
    }

    /// Stage3 socket wait timeout.
    #[must_use]
    pub const fn init_socket_timeout(&self) -> Duration {
        Duration::from_millis(self.init_socket_timeout_ms)
    }

    /// Stage3 per-request deadline.
    #[must_use]
    pub const fn init_request_timeout(&self) -> Duration {
        Duration::from_millis(self.init_request_timeout_ms)
    }
}
