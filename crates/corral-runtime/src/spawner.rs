//! The seam between the container lifecycle and the process tree it runs.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use corral_common::config::RuntimeConfig;
use corral_common::constants::{
    APP_PROCESS_NAME, CONTAINER_APP_LOG, CONTAINER_INIT_PATH, CONTAINER_INIT_SOCKET,
    CONTAINER_STATE_DIR, INIT_SOCKET_ENV, STAGE2_LOG_FILE,
};
use corral_common::error::{CorralError, Result};
use corral_common::manifest::App;
use corral_common::types::{ContainerId, IdMap, Namespaces};
use corral_core::spawn::SpawnCommand;
use corral_init::client::Client;
use corral_init::protocol::StartRequest;

const SOCKET_POLL_INITIAL: Duration = Duration::from_millis(5);
const SOCKET_POLL_MAX: Duration = Duration::from_millis(200);

/// Everything needed to launch one container's process tree.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Container being launched.
    pub id: ContainerId,
    /// Host directory of the container.
    pub directory: PathBuf,
    /// Root filesystem to chroot into.
    pub rootfs: PathBuf,
    /// Application to run.
    pub app: App,
    /// Complete application environment as `KEY=VALUE`.
    pub environment: Vec<String>,
    /// Cgroup `tasks` files the tree joins.
    pub task_files: Vec<PathBuf>,
    /// Namespaces to unshare.
    pub namespaces: Namespaces,
    /// Id mapping used with a user namespace.
    pub id_map: IdMap,
}

/// Launches container process trees.
///
/// The returned child is the root of the tree; the caller waits on it and
/// treats its exit as the container exiting.
pub trait Spawner: Send + Sync {
    /// Starts the process tree for `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be started. Nothing is left
    /// running in that case.
    fn spawn(&self, request: &SpawnRequest) -> Result<Child>;
}

/// Production spawner: re-executes the current binary in spawn mode with
/// the stage3 init as the contained command, then starts the application
/// through the init's control socket.
#[derive(Debug, Clone)]
pub struct NamespaceSpawner {
    init_binary: PathBuf,
    socket_timeout: Duration,
    request_timeout: Duration,
}

impl NamespaceSpawner {
    /// Creates a spawner from the runtime configuration.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            init_binary: config.init_binary.clone(),
            socket_timeout: config.init_socket_timeout(),
            request_timeout: config.init_request_timeout(),
        }
    }

    fn launch(&self, request: &SpawnRequest, child: &mut Child) -> Result<()> {
        let socket = host_path(&request.rootfs, CONTAINER_INIT_SOCKET);
        wait_for_socket(&socket, child, self.socket_timeout)?;
        let client = Client::new(&socket, self.request_timeout);

        if request.namespaces.uts {
            client.set_hostname(&request.id.short_name())?;
        }
        client.start(StartRequest {
            name: Some(APP_PROCESS_NAME.to_string()),
            command: request.app.exec.clone(),
            working_directory: request.app.working_directory.clone(),
            environment: request.environment.clone(),
            stdout: CONTAINER_APP_LOG.to_string(),
            stderr: CONTAINER_APP_LOG.to_string(),
            uid: request.app.user,
            gid: request.app.group,
        })?;
        tracing::info!(id = %request.id, "application started");
        Ok(())
    }
}

impl Spawner for NamespaceSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Child> {
        install_init(&self.init_binary, &request.rootfs)?;
        let socket = host_path(&request.rootfs, CONTAINER_INIT_SOCKET);
        match fs::remove_file(&socket) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(CorralError::io(&socket, e));
            }
            _ => {}
        }

        let log_path = request.directory.join(STAGE2_LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| CorralError::io(&log_path, e))?;
        let output = |file: &File| {
            file.try_clone()
                .map_err(|e| CorralError::os("dup stage2 log", e))
        };
        let (stdout, stderr) = (output(&log)?, output(&log)?);

        let mut environment = request.environment.clone();
        environment.push(format!("{INIT_SOCKET_ENV}={CONTAINER_INIT_SOCKET}"));

        let mut child = SpawnCommand::new(&request.rootfs, vec![CONTAINER_INIT_PATH.to_string()])
            .namespaces(request.namespaces)
            .id_map(request.id_map)
            .task_files(request.task_files.iter().cloned())
            .environment(environment)
            .stdio(None, Some(stdout), Some(stderr))
            .log(log)
            .spawn()?;

        if let Err(e) = self.launch(request, &mut child) {
            tracing::error!(id = %request.id, error = %e, "container init did not come up");
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        Ok(child)
    }
}

/// Maps an absolute path inside the container to the host.
fn host_path(rootfs: &Path, inside: &str) -> PathBuf {
    rootfs.join(inside.trim_start_matches('/'))
}

/// Copies the init binary into the container's state directory.
fn install_init(binary: &Path, rootfs: &Path) -> Result<()> {
    let state_dir = host_path(rootfs, CONTAINER_STATE_DIR);
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&state_dir)
        .map_err(|e| CorralError::io(&state_dir, e))?;
    let target = host_path(rootfs, CONTAINER_INIT_PATH);
    let _ = fs::copy(binary, &target).map_err(|e| CorralError::io(binary, e))?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
        .map_err(|e| CorralError::io(&target, e))?;
    tracing::debug!(path = %target.display(), "installed init binary");
    Ok(())
}

/// Polls for the init socket with exponential backoff, failing early when
/// the process tree exits first.
fn wait_for_socket(socket: &Path, child: &mut Child, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut backoff = SOCKET_POLL_INITIAL;
    loop {
        if socket.exists() {
            return Ok(());
        }
        if let Some(status) = child
            .try_wait()
            .map_err(|e| CorralError::os("wait for spawner", e))?
        {
            return Err(CorralError::Spawn {
                message: format!("spawner exited with {status} before init was ready"),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(CorralError::Init {
                message: format!("socket {} did not appear within {timeout:?}", socket.display()),
            });
        }
        thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(SOCKET_POLL_MAX);
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn host_path_is_under_rootfs() {
        assert_eq!(
            host_path(Path::new("/c/rootfs"), CONTAINER_INIT_SOCKET),
            PathBuf::from("/c/rootfs/.corral/init.sock")
        );
    }

    #[test]
    fn init_is_installed_executable() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("corral-init");
        fs::write(&binary, b"\x7fELF").unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();

        install_init(&binary, &rootfs).unwrap();

        let installed = rootfs.join(".corral/init");
        assert_eq!(fs::read(&installed).unwrap(), b"\x7fELF");
        let mode = fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn missing_init_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = install_init(&dir.path().join("absent"), dir.path()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn existing_socket_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("init.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();

        wait_for_socket(&socket, &mut child, Duration::from_secs(1)).unwrap();

        child.kill().unwrap();
        let _ = child.wait();
    }

    #[test]
    fn exited_spawner_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = Command::new("true").spawn().unwrap();

        let started = Instant::now();
        let err = wait_for_socket(&dir.path().join("init.sock"), &mut child, Duration::from_secs(5))
            .unwrap_err();

        assert!(matches!(err, CorralError::Spawn { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn silent_spawner_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();

        let err = wait_for_socket(
            &dir.path().join("init.sock"),
            &mut child,
            Duration::from_millis(100),
        )
        .unwrap_err();

        assert!(matches!(err, CorralError::Init { .. }));
        child.kill().unwrap();
        let _ = child.wait();
    }
}
