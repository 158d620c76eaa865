//! A container instance and its lifecycle.
//!
//! Startup runs ordered steps (directories, filesystem, environment, cgroup,
//! spawn) and stops at the first failure. A failed startup is recorded and
//! torn down right away, so the container ends up `Stopped` with
//! [`Container::startup_error`] set.
//!
//! Teardown runs ordered steps (cgroup, directory, deregister) and stops at
//! the first failure; a later [`Container::stop`] retries it.
//!
//! The state mutex is only ever held to read or write the fields in it and
//! to signal the spawner, never across extraction, spawning, or cgroup kill
//! loops.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;

use corral_common::config::RuntimeConfig;
use corral_common::constants::{DEFAULT_PATH, MANIFEST_FILE, ROOTFS_DIR, RUNTIME_MANIFEST_FILE};
use corral_common::envmap::EnvMap;
use corral_common::error::{CorralError, Result};
use corral_common::manifest::{ImageManifest, RuntimeManifest};
use corral_common::types::{ContainerId, ContainerState};
use corral_core::cgroup::{Cgroup, Hierarchy};
use corral_core::filesystem::mount;
use corral_image::extract::{self, ExtractOptions};
use corral_image::hash::HashingReader;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, waitid};
use nix::unistd::Pid;
use serde::Serialize;

use crate::enter::{ProcStatus, find_init};
use crate::spawner::{SpawnRequest, Spawner};

/// Image stream consumed by the filesystem step.
pub type ImageReader = Box<dyn Read + Send>;

/// Live containers keyed by id.
pub(crate) type Registry = RwLock<HashMap<ContainerId, Arc<Container>>>;

/// Collaborators shared by every container of one manager.
pub(crate) struct Context {
    pub(crate) config: RuntimeConfig,
    pub(crate) hierarchy: Arc<Hierarchy>,
    pub(crate) spawner: Arc<dyn Spawner>,
}

struct Startup {
    image: Option<ImageReader>,
}

type StartupStep = fn(&Arc<Container>, &mut Startup) -> Result<()>;
type TeardownStep = fn(&Container) -> Result<()>;

const STARTUP_STEPS: [(&str, StartupStep); 5] = [
    ("directories", Container::setup_directories),
    ("filesystem", Container::setup_filesystem),
    ("environment", Container::setup_environment),
    ("cgroup", Container::setup_cgroup),
    ("spawn", Container::setup_spawn),
];

const TEARDOWN_STEPS: [(&str, TeardownStep); 3] = [
    ("cgroup", Container::teardown_cgroup),
    ("directory", Container::teardown_directory),
    ("deregister", Container::deregister),
];

struct Inner {
    state: ContainerState,
    shutting_down: bool,
    tearing_down: bool,
    directory_created: bool,
    released: bool,
    runtime_manifest: RuntimeManifest,
    environment: Vec<String>,
    cgroup: Option<Arc<Cgroup>>,
    spawner_pid: Option<u32>,
    startup_error: Option<String>,
}

/// One container instance.
pub struct Container {
    id: ContainerId,
    directory: PathBuf,
    manifest: ImageManifest,
    context: Arc<Context>,
    registry: Weak<Registry>,
    span: tracing::Span,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        manifest: ImageManifest,
        context: Arc<Context>,
        registry: Weak<Registry>,
    ) -> Self {
        let directory = context.config.containers_dir.join(id.short_name());
        let runtime_manifest = RuntimeManifest::new(id, &manifest);
        Self {
            id,
            directory,
            manifest,
            context,
            registry,
            span: tracing::info_span!("container", container = %id),
            inner: Mutex::new(Inner {
                state: ContainerState::New,
                shutting_down: false,
                tearing_down: false,
                directory_created: false,
                released: false,
                runtime_manifest,
                environment: Vec::new(),
                cgroup: None,
                spawner_pid: None,
                startup_error: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Returns the container's id.
    #[must_use]
    pub const fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the 8-character name used for the directory and cgroup.
    #[must_use]
    pub fn short_name(&self) -> String {
        self.id.short_name()
    }

    /// Returns the host directory of the container.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the root filesystem directory.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.directory.join(ROOTFS_DIR)
    }

    /// Returns the image manifest the container was created from.
    #[must_use]
    pub const fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Returns a snapshot of the runtime manifest.
    #[must_use]
    pub fn runtime_manifest(&self) -> RuntimeManifest {
        self.lock().runtime_manifest.clone()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.lock().state
    }

    /// Returns true once a stop has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Returns the error that aborted startup, if any.
    #[must_use]
    pub fn startup_error(&self) -> Option<String> {
        self.lock().startup_error.clone()
    }

    /// Returns the application environment as `KEY=VALUE` strings. Empty
    /// until the environment step has run.
    #[must_use]
    pub fn environment(&self) -> Vec<String> {
        self.lock().environment.clone()
    }

    /// Returns the container's cgroup while it exists.
    #[must_use]
    pub fn cgroup(&self) -> Option<Arc<Cgroup>> {
        self.lock().cgroup.clone()
    }

    /// Blocks until `done` holds for the state or `timeout` passes, and
    /// returns the state if it does.
    pub fn wait_until<F>(&self, timeout: Duration, mut done: F) -> Option<ContainerState>
    where
        F: FnMut(ContainerState) -> bool,
    {
        let guard = self.lock();
        let (inner, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |inner| !done(inner.state))
            .unwrap_or_else(PoisonError::into_inner);
        done(inner.state).then_some(inner.state)
    }

    /// Requests the container to stop and releases its resources.
    ///
    /// A container still starting finishes its current step, then tears
    /// itself down; this call returns without waiting for that. Stopping a
    /// released container does nothing. A container whose teardown failed,
    /// whether it was stopping or had exited, retries it.
    ///
    /// # Errors
    ///
    /// Returns the first teardown step error. Later steps are skipped.
    pub fn stop(&self) -> Result<()> {
        let _span = self.span.enter();
        let terminal = {
            let mut inner = self.lock();
            let terminal = match inner.state {
                ContainerState::Starting => {
                    inner.shutting_down = true;
                    tracing::info!("stop requested during startup");
                    return Ok(());
                }
                ContainerState::New | ContainerState::Running => {
                    inner.shutting_down = true;
                    self.transition(&mut inner, ContainerState::Stopping);
                    Some(ContainerState::Stopped)
                }
                ContainerState::Stopping if !inner.tearing_down => {
                    tracing::info!("retrying teardown");
                    Some(ContainerState::Stopped)
                }
                ContainerState::Exited if !inner.tearing_down && !inner.released => {
                    tracing::info!("retrying teardown after exit");
                    None
                }
                _ => return Ok(()),
            };
            inner.tearing_down = true;
            terminal
        };
        self.run_teardown(terminal)
    }

    /// Returns the pid, in the host pid namespace, of the init process
    /// running inside the container.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::InvalidState` when the container has no running
    /// process tree, and `CorralError::NotFound` when no member of its
    /// cgroup looks like the init.
    pub fn init_pid(&self) -> Result<i32> {
        let (cgroup, spawner_pid) = {
            let inner = self.lock();
            (inner.cgroup.clone(), inner.spawner_pid)
        };
        let (Some(cgroup), Some(spawner_pid)) = (cgroup, spawner_pid) else {
            return Err(CorralError::InvalidState {
                message: format!("container {} has no running process tree", self.id),
            });
        };
        let spawner_pid = pid_from(spawner_pid)?;

        let mut statuses = Vec::new();
        for pid in cgroup.tasks()? {
            // Tasks may exit between listing and reading.
            if let Ok(text) = fs::read_to_string(format!("/proc/{pid}/status")) {
                statuses.push((pid, ProcStatus::parse(&text)));
            }
        }
        find_init(&statuses, spawner_pid).ok_or_else(|| CorralError::NotFound {
            kind: "container init",
            id: self.id.to_string(),
        })
    }

    /// Runs the startup steps. Called once, from the manager's startup
    /// thread.
    pub(crate) fn start(self: &Arc<Self>, image: ImageReader) {
        let _span = self.span.enter();
        {
            let mut inner = self.lock();
            if inner.state != ContainerState::New || inner.shutting_down {
                return;
            }
            self.transition(&mut inner, ContainerState::Starting);
        }

        let mut startup = Startup { image: Some(image) };
        for (name, step) in STARTUP_STEPS {
            if self.is_shutting_down() {
                tracing::info!(step = name, "startup abandoned");
                break;
            }
            tracing::debug!(step = name, "startup step");
            if let Err(e) = step(self, &mut startup) {
                tracing::error!(step = name, error = %e, "startup failed");
                self.lock().startup_error = Some(format!("{name}: {e}"));
                break;
            }
        }

        {
            let mut inner = self.lock();
            if inner.state != ContainerState::Starting {
                return;
            }
            inner.shutting_down = true;
            inner.tearing_down = true;
            self.transition(&mut inner, ContainerState::Stopping);
        }
        if let Err(e) = self.run_teardown(Some(ContainerState::Stopped)) {
            tracing::error!(error = %e, "cleanup after startup failed");
        }
    }

    fn setup_directories(self: &Arc<Self>, _: &mut Startup) -> Result<()> {
        let parent = &self.context.config.containers_dir;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .map_err(|e| CorralError::io(parent, e))?;
        fs::DirBuilder::new()
            .mode(0o755)
            .create(&self.directory)
            .map_err(|e| CorralError::io(&self.directory, e))?;
        self.lock().directory_created = true;

        let rootfs = self.rootfs();
        fs::DirBuilder::new()
            .mode(0o755)
            .create(&rootfs)
            .map_err(|e| CorralError::io(&rootfs, e))?;
        write_json(&self.directory.join(MANIFEST_FILE), &self.manifest)
    }

    fn setup_filesystem(self: &Arc<Self>, startup: &mut Startup) -> Result<()> {
        let image = startup.image.take().ok_or_else(|| CorralError::InvalidState {
            message: "no image stream to extract".into(),
        })?;
        let app = self.manifest.require_app()?;
        let id_shift = app
            .isolators
            .namespaces
            .user
            .then_some(self.context.config.user_namespace_map);
        let mut options = ExtractOptions::rootfs(id_shift);
        // Ownership can only be applied with privilege.
        options.preserve_ownership = nix::unistd::geteuid().is_root();

        let rootfs = self.rootfs();
        let mut reader = HashingReader::new(image);
        let summary = extract::extract(&mut reader, &rootfs, &options)?;
        let digest = reader.finish().map_err(|e| CorralError::io(&rootfs, e))?;

        let runtime_manifest = {
            let mut inner = self.lock();
            inner.runtime_manifest.image_digest = Some(digest.clone());
            inner.runtime_manifest.clone()
        };
        write_json(&self.directory.join(RUNTIME_MANIFEST_FILE), &runtime_manifest)?;
        tracing::info!(%digest, entries = summary.entries, "filesystem ready");
        Ok(())
    }

    fn setup_environment(self: &Arc<Self>, _: &mut Startup) -> Result<()> {
        let app = self.manifest.require_app()?;
        let mut defaults = EnvMap::new();
        defaults.set("PATH", DEFAULT_PATH);
        defaults.set("HOME", "/");
        defaults.set("TMPDIR", "/tmp");

        let mut environment = Arc::new(defaults).child();
        for var in &app.environment {
            environment.set(&var.name, &var.value);
        }
        self.lock().environment = environment.strings();
        Ok(())
    }

    fn setup_cgroup(self: &Arc<Self>, _: &mut Startup) -> Result<()> {
        let name = format!("{}/{}", self.context.config.cgroup_parent, self.short_name());
        let cgroup = Arc::new(Cgroup::new(&self.context.hierarchy, &name)?);
        self.lock().cgroup = Some(Arc::clone(&cgroup));

        let isolators = &self.manifest.require_app()?.isolators;
        if let Some(ms) = isolators.cpu_ms_per_sec {
            cgroup.limit_cpu(ms)?;
        }
        if let Some(bytes) = isolators.memory_bytes {
            cgroup.limit_memory(bytes)?;
        }
        Ok(())
    }

    fn setup_spawn(self: &Arc<Self>, _: &mut Startup) -> Result<()> {
        let app = self.manifest.require_app()?;
        let (environment, task_files) = {
            let inner = self.lock();
            let task_files = inner
                .cgroup
                .as_ref()
                .map(|cgroup| cgroup.task_files())
                .unwrap_or_default();
            (inner.environment.clone(), task_files)
        };
        let request = SpawnRequest {
            id: self.id,
            directory: self.directory.clone(),
            rootfs: self.rootfs(),
            app: app.clone(),
            environment,
            task_files,
            namespaces: app.isolators.namespaces,
            id_map: self.context.config.user_namespace_map,
        };

        let child = self.context.spawner.spawn(&request)?;
        let pid = child.id();
        {
            let mut inner = self.lock();
            inner.spawner_pid = Some(pid);
            if !inner.shutting_down {
                self.transition(&mut inner, ContainerState::Running);
            }
        }

        let container = Arc::clone(self);
        let _ = thread::Builder::new()
            .name(format!("corral-reaper-{}", self.short_name()))
            .spawn(move || container.watch(child))
            .map_err(|e| CorralError::os("spawn reaper thread", e))?;
        tracing::info!(pid, "process tree running");
        Ok(())
    }

    /// Waits for the process tree and releases the container when it exits
    /// on its own.
    ///
    /// The child is reaped only after `spawner_pid` is cleared, so a kill
    /// sent under the lock never reaches a recycled pid.
    fn watch(self: Arc<Self>, mut child: Child) {
        let _span = self.span.enter();
        match pid_from(child.id()) {
            Ok(pid) => await_exit(Pid::from_raw(pid)),
            Err(e) => tracing::warn!(error = %e, "cannot watch process tree"),
        }
        self.lock().spawner_pid = None;
        match child.wait() {
            Ok(status) => tracing::info!(%status, "process tree exited"),
            Err(e) => tracing::warn!(error = %e, "lost track of process tree"),
        }
        {
            let mut inner = self.lock();
            if inner.shutting_down || inner.state != ContainerState::Running {
                return;
            }
            inner.tearing_down = true;
            self.transition(&mut inner, ContainerState::Exited);
        }
        if let Err(e) = self.run_teardown(None) {
            tracing::error!(error = %e, "cleanup after exit failed");
        }
    }

    fn run_teardown(&self, terminal: Option<ContainerState>) -> Result<()> {
        let result = TEARDOWN_STEPS.into_iter().try_for_each(|(name, step)| {
            tracing::debug!(step = name, "teardown step");
            step(self).inspect_err(|e| tracing::error!(step = name, error = %e, "teardown failed"))
        });

        let mut inner = self.lock();
        inner.tearing_down = false;
        if result.is_ok() {
            inner.released = true;
            if let Some(terminal) = terminal {
                self.transition(&mut inner, terminal);
            }
            tracing::info!("container released");
        }
        result
    }

    fn teardown_cgroup(&self) -> Result<()> {
        let cgroup = {
            let inner = self.lock();
            if let Some(pid) = inner.spawner_pid {
                match kill(Pid::from_raw(pid_from(pid)?), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(CorralError::os(format!("kill {pid}"), e)),
                }
            }
            inner.cgroup.clone()
        };
        let Some(cgroup) = cgroup else {
            return Ok(());
        };
        if !cgroup.destroyed() {
            cgroup.destroy()?;
        }
        self.lock().cgroup = None;
        Ok(())
    }

    fn teardown_directory(&self) -> Result<()> {
        if !self.lock().directory_created {
            return Ok(());
        }
        mount::unmount_nested(&self.directory)?;
        match fs::remove_dir_all(&self.directory) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(CorralError::io(&self.directory, e))
            }
            _ => {
                self.lock().directory_created = false;
                Ok(())
            }
        }
    }

    fn deregister(&self) -> Result<()> {
        if let Some(registry) = self.registry.upgrade() {
            let removed = registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
            if removed.is_some() {
                tracing::debug!("deregistered");
            }
        }
        Ok(())
    }

    fn transition(&self, inner: &mut Inner, next: ContainerState) {
        debug_assert!(
            inner.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            inner.state
        );
        tracing::info!(from = %inner.state, to = %next, "state changed");
        inner.state = next;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("directory", &self.directory)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Blocks until `pid` has terminated, leaving it unreaped.
fn await_exit(pid: Pid) {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), error = %e, "waitid failed");
                return;
            }
        }
    }
}

fn pid_from(pid: u32) -> Result<i32> {
    i32::try_from(pid).map_err(|_| CorralError::InvalidState {
        message: format!("pid {pid} out of range"),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes).map_err(|e| CorralError::io(path, e))
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn exited_spawner_stays_unreaped_until_waited() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = pid_from(child.id()).unwrap();

        await_exit(Pid::from_raw(pid));

        // Still a zombie: the pid cannot be recycled yet.
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        let state = stat.rsplit(')').next().unwrap().split_whitespace().next();
        assert_eq!(state, Some("Z"));
        assert!(child.wait().unwrap().success());
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }
}
