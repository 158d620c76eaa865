//! Interactive sessions inside a running container.
//!
//! A session is an `nsenter` child joined to the namespaces of the
//! container's init process, with a fresh pseudo-terminal as its controlling
//! terminal. The caller owns the master side.

use std::ffi::OsString;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use corral_common::error::{CorralError, Result};
use corral_common::types::Namespaces;
use nix::pty::openpty;

/// The fields of `/proc/<pid>/status` used to locate a container's init.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStatus {
    /// Parent pid in the host pid namespace.
    pub ppid: Option<i32>,
    /// Pid in each nested pid namespace, outermost first.
    pub nspid: Vec<i32>,
}

impl ProcStatus {
    /// Parses the text of a `status` file. Unknown and malformed fields are
    /// ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut status = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "PPid" => status.ppid = value.trim().parse().ok(),
                "NSpid" => {
                    status.nspid = value
                        .split_whitespace()
                        .filter_map(|pid| pid.parse().ok())
                        .collect();
                }
                _ => {}
            }
        }
        status
    }

    /// Returns true for pid 1 of a pid namespace nested below ours.
    #[must_use]
    pub fn is_namespace_init(&self) -> bool {
        self.nspid.len() > 1 && self.nspid.last() == Some(&1)
    }
}

/// Picks the init among a container's tasks: the pid 1 of a nested pid
/// namespace if there is one, else the direct child of the spawner.
pub(crate) fn find_init(tasks: &[(i32, ProcStatus)], spawner_pid: i32) -> Option<i32> {
    tasks
        .iter()
        .find(|(_, status)| status.is_namespace_init())
        .or_else(|| {
            tasks
                .iter()
                .find(|(_, status)| status.ppid == Some(spawner_pid))
        })
        .map(|(pid, _)| *pid)
}

/// A command running inside a container on a pseudo-terminal.
#[derive(Debug)]
pub struct EnterSession {
    /// Master side of the terminal: the session's input and output.
    pub terminal: File,
    /// The `nsenter` process.
    pub child: Child,
}

/// Returns the `nsenter` arguments that join `target`'s namespaces and
/// root, then run `command`.
#[must_use]
pub fn nsenter_args(target: i32, namespaces: &Namespaces, command: &[String]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--target".into(), target.to_string().into()];
    for (enabled, flag) in [
        (namespaces.user, "--user"),
        (namespaces.mount, "--mount"),
        (namespaces.uts, "--uts"),
        (namespaces.ipc, "--ipc"),
        (namespaces.net, "--net"),
        (namespaces.pid, "--pid"),
    ] {
        if enabled {
            args.push(flag.into());
        }
    }
    for flag in ["--root", "--wd", "--"] {
        args.push(flag.into());
    }
    args.extend(command.iter().map(OsString::from));
    args
}

/// Starts `command` inside the namespaces of `target` on a new terminal,
/// with exactly `environment` as its environment.
///
/// # Errors
///
/// Returns an error if the command is empty, `nsenter` is not installed,
/// the terminal cannot be allocated, or the process cannot be started.
pub fn enter(
    target: i32,
    namespaces: &Namespaces,
    environment: &[String],
    command: &[String],
) -> Result<EnterSession> {
    if command.is_empty() {
        return Err(CorralError::Spawn {
            message: "enter command is empty".into(),
        });
    }
    let nsenter: PathBuf = which::which("nsenter").map_err(|e| CorralError::Spawn {
        message: format!("nsenter not found: {e}"),
    })?;
    let pty = openpty(None, None).map_err(|e| CorralError::os("openpty", e))?;
    let stdio = |fd: &OwnedFd| -> Result<Stdio> {
        fd.try_clone()
            .map(Stdio::from)
            .map_err(|e| CorralError::os("dup terminal", e))
    };

    let mut cmd = Command::new(&nsenter);
    let _ = cmd
        .args(nsenter_args(target, namespaces, command))
        .env_clear()
        .envs(environment.iter().filter_map(|var| var.split_once('=')))
        .stdin(stdio(&pty.slave)?)
        .stdout(stdio(&pty.slave)?)
        .stderr(stdio(&pty.slave)?);
    // SAFETY: setsid(2) and ioctl(2) are async-signal-safe.
    unsafe {
        let _ = cmd.pre_exec(|| {
            nix::unistd::setsid()?;
            if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| CorralError::Spawn {
        message: format!("failed to start {}: {e}", nsenter.display()),
    })?;
    tracing::info!(target_pid = target, pid = child.id(), "entered container");
    drop(pty.slave);
    Ok(EnterSession {
        terminal: File::from(pty.master),
        child,
    })
}
