//! Image and runtime manifests.
//!
//! The image manifest describes what to run; corral reads the app's exec
//! command, environment, identity and isolators and otherwise treats the
//! document opaquely. The runtime manifest is corral's own record of a
//! container instance and gains the content digest of the extracted image.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};
use crate::types::{ContainerId, Namespaces};

/// A container image descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Image name, e.g. `example.com/web`.
    pub name: String,
    /// Free-form labels carried through untouched.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// The application to run.
    pub app: Option<App>,
}

/// The application an image runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Command and arguments; the first element is an absolute path.
    pub exec: Vec<String>,
    /// Uid the app runs as inside the container.
    #[serde(default)]
    pub user: u32,
    /// Gid the app runs as inside the container.
    #[serde(default)]
    pub group: u32,
    /// Working directory inside the container.
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    /// Declared environment variables, applied in order.
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    /// Privilege, namespace and resource requirements.
    #[serde(default)]
    pub isolators: Isolators,
}

fn default_working_directory() -> String {
    "/".to_string()
}

/// One declared environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Raw value; `$NAME` references are expanded at container start.
    pub value: String,
}

/// Isolation and resource requirements of an app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Isolators {
    /// Run without `no_new_privs` inside the container.
    pub privileged: bool,
    /// Namespaces to unshare.
    pub namespaces: Namespaces,
    /// CPU time allowed per wall-clock second, in milliseconds.
    pub cpu_ms_per_sec: Option<u64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
}

impl ImageManifest {
    /// Parses a manifest from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Serialization` if the bytes are not a manifest.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reads a manifest from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| CorralError::io(path, e))?;
        Self::from_slice(&bytes)
    }

    /// Returns the app, which validation guarantees is present.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::InvalidManifest` if the manifest has no app.
    pub fn require_app(&self) -> Result<&App> {
        self.app.as_ref().ok_or_else(|| CorralError::InvalidManifest {
            message: format!("image {:?} declares no app", self.name),
        })
    }

    /// Checks the fields corral depends on.
    ///
    /// `required` lists namespaces the host policy insists on; a manifest
    /// that does not request every one of them is rejected.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::InvalidManifest` describing the first problem.
    pub fn validate(&self, required: &Namespaces) -> Result<()> {
        let invalid =
            |message: String| -> Result<()> { Err(CorralError::InvalidManifest { message }) };

        if self.name.trim().is_empty() {
            return invalid("name is required".into());
        }
        let app = self.require_app()?;
        let Some(command) = app.exec.first() else {
            return invalid("app.exec must not be empty".into());
        };
        if !command.starts_with('/') {
            return invalid(format!("app.exec[0] must be an absolute path, got {command:?}"));
        }
        if !app.working_directory.starts_with('/') {
            return invalid(format!(
                "app.workingDirectory must be absolute, got {:?}",
                app.working_directory
            ));
        }
        for var in &app.environment {
            if var.name.is_empty() || var.name.contains('=') || var.name.contains('\0') {
                return invalid(format!("invalid environment variable name {:?}", var.name));
            }
        }
        if app.isolators.cpu_ms_per_sec == Some(0) {
            return invalid("cpuMsPerSec must be positive".into());
        }
        if app.isolators.memory_bytes == Some(0) {
            return invalid("memoryBytes must be positive".into());
        }
        let missing = required.missing_from(&app.isolators.namespaces);
        if !missing.is_empty() {
            return invalid(format!(
                "policy requires namespaces not requested by the image: {}",
                missing.join(", ")
            ));
        }
        Ok(())
    }
}

/// Corral's record of a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeManifest {
    /// Container identifier.
    pub id: ContainerId,
    /// Name of the image the container runs.
    pub image_name: String,
    /// Content digest of the image stream, set once extraction finishes.
    pub image_digest: Option<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

impl RuntimeManifest {
    /// Creates a record for a new container.
    #[must_use]
    pub fn new(id: ContainerId, image: &ImageManifest) -> Self {
        Self {
            id,
            image_name: image.name.clone(),
            image_digest: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ImageManifest {
        ImageManifest::from_slice(
            br#"{
                "name": "example.com/web",
                "app": {
                    "exec": ["/bin/server", "--port", "8080"],
                    "user": 1000,
                    "environment": [{"name": "PORT", "value": "8080"}],
                    "isolators": {"namespaces": {"pid": true, "mount": true}, "memoryBytes": 1048576}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_declared_fields() {
        let m = manifest();
        let app = m.require_app().unwrap();
        assert_eq!(app.exec[0], "/bin/server");
        assert_eq!(app.user, 1000);
        assert_eq!(app.group, 0);
        assert_eq!(app.working_directory, "/");
        assert!(app.isolators.namespaces.pid);
        assert!(!app.isolators.namespaces.net);
        assert_eq!(app.isolators.memory_bytes, Some(1_048_576));
    }

    #[test]
    fn valid_manifest_passes() {
        manifest().validate(&Namespaces::default()).unwrap();
    }

    #[test]
    fn missing_app_is_rejected() {
        let mut m = manifest();
        m.app = None;
        assert!(matches!(
            m.validate(&Namespaces::default()),
            Err(CorralError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn relative_exec_is_rejected() {
        let mut m = manifest();
        if let Some(app) = m.app.as_mut() {
            app.exec = vec!["server".into()];
        }
        let err = m.validate(&Namespaces::default()).unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn policy_required_namespace_must_be_requested() {
        let required = Namespaces {
            user: true,
            ..Namespaces::default()
        };
        let err = manifest().validate(&required).unwrap_err();
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn runtime_manifest_starts_without_digest() {
        let m = manifest();
        let rm = RuntimeManifest::new(ContainerId::generate(), &m);
        assert_eq!(rm.image_name, "example.com/web");
        assert!(rm.image_digest.is_none());
    }
}
