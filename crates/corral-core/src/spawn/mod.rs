//! Re-exec based namespace and chroot spawner.
//!
//! The host process cannot safely `unshare(2)` or `fork(2)` itself once
//! threads are running, so a container is launched by re-executing the
//! current binary with [`SPAWNER_SENTINEL`] set. Every binary that uses
//! [`SpawnCommand`] must check [`is_spawn_mode`] first thing in `main` and
//! hand control to [`stage2::main`].
//!
//! The spawner receives everything it needs as flags, including the
//! environment of the contained process, so nothing leaks from the host
//! environment into the container.

pub mod stage2;

use std::ffi::OsString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use corral_common::constants::SPAWNER_SENTINEL;
use corral_common::error::{CorralError, Result};
use corral_common::types::{IdMap, Namespaces};

/// Descriptor slots the container's stdin, stdout and stderr are passed in.
pub const STDIO_SLOTS: [i32; 3] = [3, 4, 5];

/// Lowest descriptor used while shuffling files into [`STDIO_SLOTS`].
const SHUFFLE_FLOOR: i32 = 10;

/// Returns true when the process was started by [`SpawnCommand::spawn`].
#[must_use]
pub fn is_spawn_mode() -> bool {
    std::env::var_os(SPAWNER_SENTINEL).is_some()
}

/// Builder for the spawner invocation.
#[derive(Debug)]
pub struct SpawnCommand {
    directory: PathBuf,
    namespaces: Namespaces,
    id_map: IdMap,
    task_files: Vec<PathBuf>,
    environment: Vec<String>,
    command: Vec<String>,
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    log: Option<File>,
    executable: Option<PathBuf>,
}

impl SpawnCommand {
    /// Starts a spawner invocation that chroots into `directory` and runs
    /// `command` there.
    pub fn new(directory: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            directory: directory.into(),
            namespaces: Namespaces::default(),
            id_map: IdMap::default(),
            task_files: Vec::new(),
            environment: Vec::new(),
            command,
            stdin: None,
            stdout: None,
            stderr: None,
            log: None,
            executable: None,
        }
    }

    /// Requests namespaces. Each one is opt-in.
    #[must_use]
    pub const fn namespaces(mut self, namespaces: Namespaces) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Sets the uid/gid mapping used when a user namespace is requested.
    #[must_use]
    pub const fn id_map(mut self, map: IdMap) -> Self {
        self.id_map = map;
        self
    }

    /// Adds cgroup `tasks` files the spawner joins before anything else.
    #[must_use]
    pub fn task_files(mut self, files: impl IntoIterator<Item = PathBuf>) -> Self {
        self.task_files.extend(files);
        self
    }

    /// Sets the complete environment of the contained process, as
    /// `KEY=VALUE` strings.
    #[must_use]
    pub fn environment(mut self, vars: impl IntoIterator<Item = String>) -> Self {
        self.environment.extend(vars);
        self
    }

    /// Sets the container's standard streams. Unset streams read from or
    /// write to `/dev/null`.
    #[must_use]
    pub fn stdio(mut self, stdin: Option<File>, stdout: Option<File>, stderr: Option<File>) -> Self {
        self.stdin = stdin;
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Sends the spawner's own diagnostics to `log`.
    #[must_use]
    pub fn log(mut self, log: File) -> Self {
        self.log = Some(log);
        self
    }

    /// Overrides the binary re-executed in spawn mode. Defaults to the
    /// current executable.
    #[must_use]
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Returns the spawner's argument list.
    #[must_use]
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut flag = |name: &str, value: Option<OsString>| {
            args.push(name.into());
            args.extend(value);
        };
        flag("--directory", Some(self.directory.clone().into()));
        flag("--chroot", None);
        let ns = &self.namespaces;
        for (enabled, name) in [
            (ns.ipc, "--ipc"),
            (ns.uts, "--uts"),
            (ns.mount, "--mount"),
            (ns.pid, "--pid"),
            (ns.net, "--net"),
            (ns.user, "--user"),
        ] {
            if enabled {
                flag(name, None);
            }
        }
        if ns.user {
            flag("--uidmap", Some(self.id_map.to_string().into()));
            flag("--gidmap", Some(self.id_map.to_string().into()));
        }
        for (name, slot) in ["--stdinfd", "--stdoutfd", "--stderrfd"]
            .into_iter()
            .zip(STDIO_SLOTS)
        {
            flag(name, Some(slot.to_string().into()));
        }
        for file in &self.task_files {
            flag("--taskfile", Some(file.clone().into()));
        }
        for var in &self.environment {
            flag("--env", Some(var.into()));
        }
        flag("--", None);
        args.extend(self.command.iter().map(OsString::from));
        args
    }

    /// Starts the spawner without waiting for it. The caller reaps the
    /// returned child.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is empty, a stream cannot be opened,
    /// or the process cannot be started.
    pub fn spawn(self) -> Result<Child> {
        if self.command.is_empty() {
            return Err(CorralError::Spawn {
                message: "command is empty".into(),
            });
        }
        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| CorralError::io("/proc/self/exe", e))?,
        };
        let stdin = open_or_null(self.stdin.as_ref().map(File::try_clone), false)?;
        let stdout = open_or_null(self.stdout.as_ref().map(File::try_clone), true)?;
        let stderr = open_or_null(self.stderr.as_ref().map(File::try_clone), true)?;
        let log = match &self.log {
            Some(file) => Stdio::from(file.try_clone().map_err(|e| CorralError::os("dup log", e))?),
            None => Stdio::null(),
        };

        let mut command = Command::new(&executable);
        let _ = command
            .env_clear()
            .env(SPAWNER_SENTINEL, "1")
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log);

        let sources = [stdin.as_raw_fd(), stdout.as_raw_fd(), stderr.as_raw_fd()];
        // SAFETY: the hook only calls fcntl(2) and dup2(2), both
        // async-signal-safe, on descriptors owned by `command` until exec.
        unsafe {
            let _ = command.pre_exec(move || wire_stdio_slots(sources));
        }

        let child = command.spawn().map_err(|e| CorralError::Spawn {
            message: format!("failed to start {}: {e}", executable.display()),
        })?;
        tracing::info!(
            pid = child.id(),
            directory = %self.directory.display(),
            "spawner started"
        );
        Ok(child)
    }
}

fn open_or_null(file: Option<std::io::Result<File>>, write: bool) -> Result<File> {
    match file {
        Some(file) => file.map_err(|e| CorralError::os("dup stdio", e)),
        None => File::options()
            .read(!write)
            .write(write)
            .open("/dev/null")
            .map_err(|e| CorralError::io(Path::new("/dev/null"), e)),
    }
}

/// Moves `sources` into [`STDIO_SLOTS`] in the forked child.
///
/// Sources are first duplicated above [`SHUFFLE_FLOOR`] so that a source
/// already sitting in one of the slots is not clobbered.
fn wire_stdio_slots(sources: [i32; 3]) -> std::io::Result<()> {
    let mut high = [0; 3];
    for (slot, source) in high.iter_mut().zip(sources) {
        // SAFETY: F_DUPFD_CLOEXEC on a valid descriptor returns a new one.
        let fd = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, SHUFFLE_FLOOR) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        *slot = fd;
    }
    for (source, target) in high.into_iter().zip(STDIO_SLOTS) {
        // SAFETY: dup2 onto a fixed slot; the result is inherited across
        // exec because dup2 clears FD_CLOEXEC on the target.
        if unsafe { libc::dup2(source, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn minimal_invocation_only_chroots() {
        let args = strings(&SpawnCommand::new("/c/rootfs", vec!["/init".into()]).args());
        assert_eq!(
            args,
            vec![
                "--directory", "/c/rootfs", "--chroot", "--stdinfd", "3", "--stdoutfd", "4",
                "--stderrfd", "5", "--", "/init",
            ]
        );
    }

    #[test]
    fn namespaces_are_opt_in_and_maps_need_user() {
        let without_user = strings(
            &SpawnCommand::new("/c", vec!["/init".into()])
                .namespaces(Namespaces {
                    pid: true,
                    mount: true,
                    ..Namespaces::default()
                })
                .args(),
        );
        assert!(without_user.contains(&"--pid".to_string()));
        assert!(without_user.contains(&"--mount".to_string()));
        assert!(!without_user.contains(&"--net".to_string()));
        assert!(!without_user.contains(&"--uidmap".to_string()));

        let with_user = strings(
            &SpawnCommand::new("/c", vec!["/init".into()])
                .namespaces(Namespaces::all())
                .args(),
        );
        let pos = with_user.iter().position(|a| a == "--uidmap").unwrap();
        assert_eq!(with_user[pos + 1], "0:100000:65536");
        assert!(with_user.contains(&"--gidmap".to_string()));
    }

    #[test]
    fn environment_and_taskfiles_are_flags_before_command() {
        let args = strings(
            &SpawnCommand::new("/c", vec!["/init".into(), "--flag".into()])
                .task_files([PathBuf::from("/cg/cpu/x/tasks"), PathBuf::from("/cg/memory/x/tasks")])
                .environment(["PATH=/bin".to_string(), "HOME=/".to_string()])
                .args(),
        );
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], ["/init", "--flag"]);
        assert_eq!(args.iter().filter(|a| *a == "--taskfile").count(), 2);
        let env_pos = args.iter().position(|a| a == "--env").unwrap();
        assert_eq!(args[env_pos + 1], "PATH=/bin");
        assert!(env_pos < sep);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(SpawnCommand::new("/c", Vec::new()).spawn().is_err());
    }
}
