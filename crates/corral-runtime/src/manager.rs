//! Registry of live containers.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use corral_common::config::RuntimeConfig;
use corral_common::error::{CorralError, Result};
use corral_common::manifest::ImageManifest;
use corral_common::types::ContainerId;
use corral_core::cgroup::Hierarchy;

use crate::container::{Container, Context, ImageReader, Registry};
use crate::spawner::Spawner;

/// Creates, tracks and destroys containers.
///
/// The registry lock is only taken to look up, insert or remove entries;
/// each container's lifecycle runs under its own lock.
pub struct Manager {
    context: Arc<Context>,
    registry: Arc<Registry>,
}

impl Manager {
    /// Creates a manager for `config`, launching containers with `spawner`.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Config` if the configuration is invalid.
    pub fn new(config: RuntimeConfig, spawner: Arc<dyn Spawner>) -> Result<Self> {
        config.validate()?;
        let hierarchy = Arc::new(Hierarchy::from_config(&config));
        tracing::info!(
            containers_dir = %config.containers_dir.display(),
            cgroup_root = %config.cgroup_root.display(),
            "container manager ready"
        );
        Ok(Self {
            context: Arc::new(Context {
                config,
                hierarchy,
                spawner,
            }),
            registry: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Returns the configuration the manager runs with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.context.config
    }

    /// Checks that `manifest` can be run under this manager's policy.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::InvalidManifest` describing the first problem.
    pub fn validate(&self, manifest: &ImageManifest) -> Result<()> {
        manifest.validate(&self.context.config.required_namespaces)
    }

    /// Validates `manifest`, registers a new container and starts it in the
    /// background from the image stream `image`.
    ///
    /// # Errors
    ///
    /// Returns a validation error before anything is allocated, or an error
    /// if the startup thread cannot be created.
    pub fn create(&self, manifest: ImageManifest, image: ImageReader) -> Result<Arc<Container>> {
        self.create_with_id(ContainerId::generate(), manifest, image)
    }

    /// Like [`Manager::create`], with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Also returns `CorralError::InvalidState` if `id` is already live.
    pub fn create_with_id(
        &self,
        id: ContainerId,
        manifest: ImageManifest,
        image: ImageReader,
    ) -> Result<Arc<Container>> {
        self.validate(&manifest)?;
        let container = Arc::new(Container::new(
            id,
            manifest,
            Arc::clone(&self.context),
            Arc::downgrade(&self.registry),
        ));
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            if registry.contains_key(&id) {
                return Err(CorralError::InvalidState {
                    message: format!("container {id} already exists"),
                });
            }
            let _ = registry.insert(id, Arc::clone(&container));
        }
        tracing::info!(%id, name = %container.manifest().name, "container created");

        let starting = Arc::clone(&container);
        let spawned = thread::Builder::new()
            .name(format!("corral-start-{}", id.short_name()))
            .spawn(move || starting.start(image));
        if let Err(e) = spawned {
            let _ = container.stop();
            return Err(CorralError::os("spawn startup thread", e));
        }
        Ok(container)
    }

    /// Returns every live container.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Looks up a live container.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::NotFound` for unknown ids.
    pub fn container(&self, id: &ContainerId) -> Result<Arc<Container>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| CorralError::NotFound {
                kind: "container",
                id: id.to_string(),
            })
    }

    /// Stops a live container and releases its resources.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::NotFound` for unknown ids and any teardown
    /// error.
    pub fn destroy(&self, id: &ContainerId) -> Result<()> {
        let container = self.container(id)?;
        tracing::info!(%id, "destroying container");
        container.stop()
    }
}
