//! Control-plane operations exposed to callers outside the runtime.
//!
//! Creating a container is a two-step exchange: [`ControlPlane::create`]
//! accepts the manifest and returns an upload id, then
//! [`ControlPlane::upload_image`] streams the image and starts the
//! container.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};

use corral_common::error::{CorralError, Result};
use corral_common::manifest::{ImageManifest, RuntimeManifest};
use corral_common::types::{ContainerId, ContainerState};
use serde::Serialize;
use uuid::Uuid;

use crate::container::Container;
use crate::enter::{self, EnterSession};
use crate::manager::Manager;

/// One line of a container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    /// Container id.
    pub id: ContainerId,
    /// Image name from the manifest.
    pub name: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Creation timestamp.
    pub created_at: String,
}

/// Everything known about one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerDetails {
    /// Image manifest.
    pub manifest: ImageManifest,
    /// Runtime manifest, including the image digest once extracted.
    pub runtime_manifest: RuntimeManifest,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Error that aborted startup, if any.
    pub startup_error: Option<String>,
}

impl ContainerSummary {
    fn of(container: &Container) -> Self {
        let runtime_manifest = container.runtime_manifest();
        Self {
            id: container.id(),
            name: runtime_manifest.image_name,
            state: container.state(),
            created_at: runtime_manifest.created_at,
        }
    }
}

/// The runtime's external surface.
pub struct ControlPlane {
    manager: Arc<Manager>,
    uploads: Mutex<HashMap<Uuid, ImageManifest>>,
}

impl ControlPlane {
    /// Wraps `manager`.
    #[must_use]
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the underlying manager.
    #[must_use]
    pub const fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Validates a JSON image manifest and reserves an upload for its image.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest does not parse or fails validation.
    pub fn create(&self, manifest: &[u8]) -> Result<Uuid> {
        let manifest = ImageManifest::from_slice(manifest)?;
        self.manager.validate(&manifest)?;
        let upload_id = Uuid::new_v4();
        let _ = self
            .uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(upload_id, manifest);
        tracing::debug!(%upload_id, "upload reserved");
        Ok(upload_id)
    }

    /// Streams the image for `upload_id` and creates the container.
    ///
    /// Chunks are consumed by the container's startup thread as extraction
    /// proceeds; a chunk error fails the container's filesystem step.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::NotFound` for unknown or already used upload
    /// ids, and any error from [`Manager::create`].
    pub fn upload_image<I>(&self, upload_id: Uuid, chunks: I) -> Result<ContainerId>
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
        I::IntoIter: Send + 'static,
    {
        let manifest = self
            .uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&upload_id)
            .ok_or_else(|| CorralError::NotFound {
                kind: "upload",
                id: upload_id.to_string(),
            })?;
        let container = self
            .manager
            .create(manifest, Box::new(ChunkReader::new(chunks.into_iter())))?;
        Ok(container.id())
    }

    /// Stops and removes a container.
    ///
    /// # Errors
    ///
    /// See [`Manager::destroy`].
    pub fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.manager.destroy(id)
    }

    /// Lists live containers, ordered by creation time.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerSummary> {
        let mut summaries: Vec<_> = self
            .manager
            .containers()
            .iter()
            .map(|container| ContainerSummary::of(container))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Returns the manifests and state of one container.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::NotFound` for unknown ids.
    pub fn get(&self, id: &ContainerId) -> Result<ContainerDetails> {
        let container = self.manager.container(id)?;
        Ok(ContainerDetails {
            manifest: container.manifest().clone(),
            runtime_manifest: container.runtime_manifest(),
            state: container.state(),
            startup_error: container.startup_error(),
        })
    }

    /// Starts `command` on a terminal inside a running container.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::InvalidState` unless the container is running,
    /// and any error from locating its init or starting the session.
    pub fn enter(&self, id: &ContainerId, command: &[String]) -> Result<EnterSession> {
        let container = self.manager.container(id)?;
        let state = container.state();
        if state != ContainerState::Running {
            return Err(CorralError::InvalidState {
                message: format!("container {id} is {state}"),
            });
        }
        let target = container.init_pid()?;
        let namespaces = container.manifest().require_app()?.isolators.namespaces;
        enter::enter(target, &namespaces, &container.environment(), command)
    }
}

/// Presents an iterator of byte chunks as a reader.
struct ChunkReader<I> {
    chunks: I,
    current: Vec<u8>,
    offset: usize,
}

impl<I> ChunkReader<I> {
    const fn new(chunks: I) -> Self {
        Self {
            chunks,
            current: Vec::new(),
            offset: 0,
        }
    }
}

impl<I> Read for ChunkReader<I>
where
    I: Iterator<Item = io::Result<Vec<u8>>>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.current.len() {
            match self.chunks.next() {
                Some(chunk) => {
                    self.current = chunk?;
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }
        let available = &self.current[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_reader_concatenates_and_skips_empty_chunks() {
        let chunks = vec![Ok(b"ab".to_vec()), Ok(Vec::new()), Ok(b"cde".to_vec())];
        let mut reader = ChunkReader::new(chunks.into_iter());
        let mut out = String::new();
        let _ = reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "abcde");
    }

    #[test]
    fn chunk_reader_serves_small_buffers() {
        let mut reader = ChunkReader::new(vec![Ok(b"hello".to_vec())].into_iter());
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"he");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn chunk_errors_surface_to_the_reader() {
        let chunks = vec![
            Ok(b"ok".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "stream closed")),
        ];
        let mut reader = ChunkReader::new(chunks.into_iter());
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
