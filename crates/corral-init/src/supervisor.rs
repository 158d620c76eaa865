//! Named process table of the init supervisor.
//!
//! Entries stay in the table after their process exits so that `STATUS`
//! can report how it ended. A name is reserved while its process runs and
//! may be reused once it has exited.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::sync::oneshot;

use crate::protocol::{StartRequest, env_pairs};

/// How a supervised process is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Not yet reaped.
    Running,
    /// Exited with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ProcessStatus {
    /// Returns true while the process has not been reaped.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited({code})"),
            Self::Signaled(signal) => write!(f, "signaled({signal})"),
        }
    }
}

#[derive(Debug)]
struct Entry {
    pid: Pid,
    status: ProcessStatus,
}

#[derive(Debug, Default)]
struct Table {
    processes: BTreeMap<String, Entry>,
    waiters: Vec<oneshot::Sender<()>>,
    next_id: u64,
}

impl Table {
    fn running(&self) -> usize {
        self.processes
            .values()
            .filter(|entry| entry.status.is_running())
            .count()
    }

    fn record(&mut self, pid: Pid, status: ProcessStatus) -> bool {
        match self
            .processes
            .iter_mut()
            .find(|(_, entry)| entry.pid == pid && entry.status.is_running())
        {
            Some((name, entry)) => {
                entry.status = status;
                tracing::info!(name = %name, pid = pid.as_raw(), %status, "process ended");
                true
            }
            None => false,
        }
    }

    fn wake_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Reasons `START` can fail.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// A running process already uses the name.
    #[error("process {0:?} is already running")]
    NameInUse(String),
    /// An output file could not be opened.
    #[error("cannot open {path}: {source}")]
    Output {
        /// Path that failed to open.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The process could not be started.
    #[error("cannot start {command}: {source}")]
    Spawn {
        /// Program that failed to start.
        command: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// The process table and its waiting queue, behind one lock.
#[derive(Debug)]
pub struct Supervisor {
    table: Mutex<Table>,
    reap_orphans: bool,
}

impl Supervisor {
    /// Creates an empty supervisor.
    ///
    /// With `reap_orphans` every terminated child is collected, not only the
    /// tracked ones. Only PID 1 should do this, since it inherits orphans.
    #[must_use]
    pub fn new(reap_orphans: bool) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            reap_orphans,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a supervised process and returns its name and pid.
    ///
    /// The table stays locked until the process is registered, so a reap
    /// pass cannot miss it.
    ///
    /// # Errors
    ///
    /// Returns a [`StartError`] if the name is taken, an output file cannot
    /// be opened, or the process cannot be spawned.
    pub fn start(&self, request: &StartRequest) -> Result<(String, u32), StartError> {
        let mut table = self.lock();
        let name = match &request.name {
            Some(name) => {
                if table
                    .processes
                    .get(name)
                    .is_some_and(|entry| entry.status.is_running())
                {
                    return Err(StartError::NameInUse(name.clone()));
                }
                name.clone()
            }
            None => loop {
                table.next_id += 1;
                let candidate = format!("process-{}", table.next_id);
                if !table.processes.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let Some((program, args)) = request.command.split_first() else {
            return Err(StartError::Spawn {
                command: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let stdout = open_output(&request.stdout)?;
        let stderr = open_output(&request.stderr)?;
        let mut command = Command::new(program);
        let _ = command
            .args(args)
            .current_dir(&request.working_directory)
            .env_clear()
            .envs(env_pairs(&request.environment))
            .uid(request.uid)
            .gid(request.gid)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        let child = command.spawn().map_err(|source| StartError::Spawn {
            command: program.clone(),
            source,
        })?;

        let pid = child.id();
        let raw = i32::try_from(pid).unwrap_or(i32::MAX);
        let _ = table.processes.insert(
            name.clone(),
            Entry {
                pid: Pid::from_raw(raw),
                status: ProcessStatus::Running,
            },
        );
        drop(table);
        tracing::info!(name = %name, pid, command = ?request.command, "process started");
        Ok((name, pid))
    }

    /// Returns every tracked process in name order.
    #[must_use]
    pub fn status(&self) -> Vec<(String, ProcessStatus)> {
        self.lock()
            .processes
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status))
            .collect()
    }

    /// Registers a waiter for the next process exit.
    ///
    /// Returns `None` when nothing is running, in which case there is
    /// nothing to wait for.
    #[must_use]
    pub fn wait(&self) -> Option<oneshot::Receiver<()>> {
        let mut table = self.lock();
        if table.running() == 0 {
            tracing::debug!("responding to WAIT immediately");
            return None;
        }
        table.waiters.retain(|waiter| !waiter.is_closed());
        let (tx, rx) = oneshot::channel();
        table.waiters.push(tx);
        tracing::debug!(waiting = table.waiters.len(), "Added to the waiting queue");
        Some(rx)
    }

    /// Returns how many callers are still waiting, dropping abandoned waits.
    #[must_use]
    pub fn waiting(&self) -> usize {
        let mut table = self.lock();
        table.waiters.retain(|waiter| !waiter.is_closed());
        table.waiters.len()
    }

    /// Collects every terminated child without blocking and wakes waiters
    /// if a tracked process ended. Returns how many tracked processes were
    /// reaped.
    pub fn reap(&self) -> usize {
        let mut table = self.lock();
        let running: Vec<Pid> = table
            .processes
            .values()
            .filter(|entry| entry.status.is_running())
            .map(|entry| entry.pid)
            .collect();

        let mut reaped = 0;
        for pid in running {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => {
                    if let Some((pid, status)) = terminal(status) {
                        if table.record(pid, status) {
                            reaped += 1;
                        }
                    }
                }
                Err(Errno::ECHILD) => {
                    tracing::warn!(pid = pid.as_raw(), "tracked process vanished");
                    if table.record(pid, ProcessStatus::Exited(-1)) {
                        reaped += 1;
                    }
                }
                Err(e) => tracing::warn!(pid = pid.as_raw(), error = %e, "waitpid failed"),
            }
        }

        if self.reap_orphans {
            loop {
                match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) | Err(_) => break,
                    Ok(status) => {
                        if let Some((pid, status)) = terminal(status) {
                            if table.record(pid, status) {
                                reaped += 1;
                            } else {
                                tracing::debug!(pid = pid.as_raw(), %status, "reaped orphan");
                            }
                        }
                    }
                }
            }
        }

        if reaped > 0 {
            table.wake_waiters();
        }
        reaped
    }
}

fn terminal(status: WaitStatus) -> Option<(Pid, ProcessStatus)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, ProcessStatus::Exited(code))),
        WaitStatus::Signaled(pid, signal, _) => Some((pid, ProcessStatus::Signaled(signal as i32))),
        _ => None,
    }
}

/// Opens a file for appending, creating it if needed.
pub(crate) fn open_output(path: &str) -> Result<File, StartError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StartError::Output {
            path: path.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn request(name: Option<&str>, command: &[&str], out: &str) -> StartRequest {
        StartRequest {
            name: name.map(ToString::to_string),
            command: command.iter().map(ToString::to_string).collect(),
            working_directory: "/".into(),
            environment: vec!["PATH=/usr/bin:/bin".into()],
            stdout: out.into(),
            stderr: out.into(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn reap_until_idle(supervisor: &Supervisor) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.status().iter().any(|(_, s)| s.is_running()) {
            assert!(Instant::now() < deadline, "processes did not exit");
            let _ = supervisor.reap();
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn status_strings_match_wire_format() {
        assert_eq!(ProcessStatus::Running.to_string(), "running");
        assert_eq!(ProcessStatus::Exited(1).to_string(), "exited(1)");
        assert_eq!(ProcessStatus::Signaled(9).to_string(), "signaled(9)");
    }

    #[test]
    fn exit_codes_are_recorded_and_names_generated() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").display().to_string();
        let supervisor = Supervisor::new(false);

        let (t, _) = supervisor.start(&request(None, &["/bin/true"], &out)).unwrap();
        let (f, _) = supervisor.start(&request(None, &["/bin/false"], &out)).unwrap();
        assert_eq!(t, "process-1");
        assert_eq!(f, "process-2");

        reap_until_idle(&supervisor);
        let status = supervisor.status();
        assert_eq!(status[0], ("process-1".to_string(), ProcessStatus::Exited(0)));
        assert_eq!(status[1], ("process-2".to_string(), ProcessStatus::Exited(1)));
        assert!(supervisor.wait().is_none());
    }

    #[test]
    fn running_names_are_reserved_until_exit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").display().to_string();
        let supervisor = Supervisor::new(false);

        let _ = supervisor
            .start(&request(Some("app"), &["/bin/sleep", "0.2"], &out))
            .unwrap();
        assert!(matches!(
            supervisor.start(&request(Some("app"), &["/bin/true"], &out)),
            Err(StartError::NameInUse(_))
        ));

        let waiter = supervisor.wait();
        assert!(waiter.is_some());
        reap_until_idle(&supervisor);
        let _ = supervisor
            .start(&request(Some("app"), &["/bin/true"], &out))
            .unwrap();
        reap_until_idle(&supervisor);
    }

    #[test]
    fn abandoned_waits_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").display().to_string();
        let supervisor = Supervisor::new(false);
        let _ = supervisor
            .start(&request(None, &["/bin/sleep", "0.3"], &out))
            .unwrap();

        for _ in 0..10 {
            drop(supervisor.wait().unwrap());
        }
        assert_eq!(supervisor.waiting(), 0);

        let kept = supervisor.wait().unwrap();
        drop(supervisor.wait().unwrap());
        assert_eq!(supervisor.waiting(), 1);
        reap_until_idle(&supervisor);
        assert!(kept.blocking_recv().is_ok());
    }

    #[test]
    fn output_is_appended_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::write(&out, "first\n").unwrap();
        let supervisor = Supervisor::new(false);

        let _ = supervisor
            .start(&request(None, &["/bin/echo", "second"], &out.display().to_string()))
            .unwrap();
        reap_until_idle(&supervisor);

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn missing_program_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").display().to_string();
        let supervisor = Supervisor::new(false);
        assert!(matches!(
            supervisor.start(&request(None, &["/nonexistent/binary"], &out)),
            Err(StartError::Spawn { .. })
        ));
        assert!(supervisor.status().is_empty());
    }
}
