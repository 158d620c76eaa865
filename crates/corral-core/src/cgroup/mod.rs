//! Cgroup v1 resource management.
//!
//! A cgroup is identified by a hierarchical name and maps to one directory
//! under every configured controller mount (`cpu`, `cpuacct`, `devices`,
//! `memory`, `blkio` by default). The mount root is a constructor parameter
//! of [`Hierarchy`], never a global, so tests can point it at a temporary
//! directory.

pub mod cpu;
pub mod disk;
pub mod memory;

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use corral_common::config::RuntimeConfig;
use corral_common::error::{CorralError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

const TASKS_FILE: &str = "tasks";

/// Pause between consecutive signals in [`Cgroup::signal_all`].
const SIGNAL_INTERVAL: Duration = Duration::from_millis(50);

const DESTROY_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const DESTROY_MAX_BACKOFF: Duration = Duration::from_secs(1);
const DESTROY_MAX_ATTEMPTS: u32 = 40;
const RMDIR_ATTEMPTS: u32 = 5;

/// The set of controller mounts cgroups are created in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    root: PathBuf,
    controllers: Vec<String>,
}

impl Hierarchy {
    /// Creates a hierarchy rooted at `root` with one mount per controller.
    pub fn new<I, S>(root: impl Into<PathBuf>, controllers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: root.into(),
            controllers: controllers.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds the hierarchy described by a runtime configuration.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.cgroup_root, config.controllers.iter().cloned())
    }

    /// Returns the mount root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the configured controllers.
    #[must_use]
    pub fn controllers(&self) -> &[String] {
        &self.controllers
    }

    /// Returns the mount directory of a controller.
    #[must_use]
    pub fn controller_path(&self, controller: &str) -> PathBuf {
        self.root.join(controller)
    }
}

/// Handle to a named cgroup across every controller of a [`Hierarchy`].
#[derive(Debug, Clone)]
pub struct Cgroup {
    hierarchy: Arc<Hierarchy>,
    name: String,
}

impl Cgroup {
    /// Creates the cgroup `name` in every controller.
    ///
    /// An existing directory is accepted only if it is already an empty
    /// cgroup. Directories created before a failing controller are left in
    /// place; a later call finds them empty and succeeds.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Cgroup` if a controller path is not a directory,
    /// is not a cgroup, or already has tasks, and an I/O error if the
    /// directory cannot be created.
    pub fn new(hierarchy: &Arc<Hierarchy>, name: &str) -> Result<Self> {
        let cgroup = Self::open(hierarchy, name)?;
        for controller in hierarchy.controllers() {
            let dir = cgroup.path(controller);
            match fs::symlink_metadata(&dir) {
                Ok(meta) if !meta.is_dir() => {
                    return Err(cgroup.error(format!("{} is not a directory", dir.display())));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    fs::DirBuilder::new()
                        .recursive(true)
                        .mode(0o755)
                        .create(&dir)
                        .map_err(|e| CorralError::io(&dir, e))?;
                    tracing::debug!(path = %dir.display(), "created cgroup directory");
                }
                Err(e) => return Err(CorralError::io(&dir, e)),
            }

            let tasks_path = dir.join(TASKS_FILE);
            let content = match fs::read_to_string(&tasks_path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(cgroup.error(format!("{} is not a cgroup", dir.display())));
                }
                Err(e) => return Err(CorralError::io(&tasks_path, e)),
            };
            if !cgroup.parse_tasks(&content)?.is_empty() {
                return Err(cgroup.error(format!("{} already has tasks", dir.display())));
            }
        }
        tracing::info!(cgroup = %cgroup.name, "cgroup created");
        Ok(cgroup)
    }

    /// Returns a handle to `name` without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Cgroup` if the name is empty or escapes the
    /// hierarchy.
    pub fn open(hierarchy: &Arc<Hierarchy>, name: &str) -> Result<Self> {
        let trimmed = name.trim_matches('/');
        if trimmed.is_empty()
            || trimmed
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(CorralError::Cgroup {
                name: name.to_string(),
                message: "invalid cgroup name".into(),
            });
        }
        Ok(Self {
            hierarchy: Arc::clone(hierarchy),
            name: trimmed.to_string(),
        })
    }

    /// Returns the hierarchical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the hierarchy this cgroup lives in.
    #[must_use]
    pub fn hierarchy(&self) -> &Arc<Hierarchy> {
        &self.hierarchy
    }

    /// Returns this cgroup's directory under one controller.
    #[must_use]
    pub fn path(&self, controller: &str) -> PathBuf {
        self.hierarchy.controller_path(controller).join(&self.name)
    }

    /// Returns the `tasks` file of every controller, in controller order.
    #[must_use]
    pub fn task_files(&self) -> Vec<PathBuf> {
        self.hierarchy
            .controllers()
            .iter()
            .map(|controller| self.path(controller).join(TASKS_FILE))
            .collect()
    }

    /// Adds `pid` to every controller.
    ///
    /// A failure partway leaves the pid in the controllers already written.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any `tasks` file cannot be written.
    pub fn add_task(&self, pid: u32) -> Result<()> {
        for path in self.task_files() {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| CorralError::io(&path, e))?;
            file.write_all(format!("{pid}\n").as_bytes())
                .map_err(|e| CorralError::io(&path, e))?;
        }
        tracing::debug!(cgroup = %self.name, pid, "added task to cgroup");
        Ok(())
    }

    /// Returns the union of pids in every controller, ascending and without
    /// duplicates. Controllers whose directory is already gone contribute
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a `tasks` file cannot be read or parsed.
    pub fn tasks(&self) -> Result<Vec<i32>> {
        let mut pids = BTreeSet::new();
        for path in self.task_files() {
            match fs::read_to_string(&path) {
                Ok(content) => pids.extend(self.parse_tasks(&content)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CorralError::io(&path, e)),
            }
        }
        Ok(pids.into_iter().collect())
    }

    /// Sends `signal` to every task, highest pid first, and returns how many
    /// tasks were signaled. Tasks that are already gone still count.
    ///
    /// `None` only counts the tasks without sending anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be read or `kill(2)` fails
    /// with anything other than `ESRCH`.
    pub fn signal_all(&self, signal: Option<Signal>) -> Result<usize> {
        let pids = self.tasks()?;
        let Some(signal) = signal else {
            return Ok(pids.len());
        };
        let count = signal_pids(pids, SIGNAL_INTERVAL, |pid| {
            kill(Pid::from_raw(pid), signal)
        })?;
        tracing::debug!(cgroup = %self.name, %signal, count, "signaled cgroup tasks");
        Ok(count)
    }

    /// Returns the direct child cgroups found under any controller.
    ///
    /// # Errors
    ///
    /// Returns an error if a controller directory cannot be listed.
    pub fn children(&self) -> Result<Vec<Self>> {
        let mut names = BTreeSet::new();
        for controller in self.hierarchy.controllers() {
            let dir = self.path(controller);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CorralError::io(&dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| CorralError::io(&dir, e))?;
                let is_dir = entry
                    .file_type()
                    .map_err(|e| CorralError::io(entry.path(), e))?
                    .is_dir();
                if is_dir {
                    let _ = names.insert(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        names
            .into_iter()
            .map(|child| Self::open(&self.hierarchy, &format!("{}/{child}", self.name)))
            .collect()
    }

    /// Kills every task and removes the cgroup, children first.
    ///
    /// Calling this on an already destroyed cgroup succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if tasks keep appearing after repeated kills or a
    /// directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed() {
            return Ok(());
        }
        for child in self.children()? {
            child.destroy()?;
        }

        let mut backoff = DESTROY_INITIAL_BACKOFF;
        let mut attempts = 0;
        loop {
            let remaining = self.signal_all(Some(Signal::SIGKILL))?;
            if remaining <= 1 {
                break;
            }
            attempts += 1;
            if attempts >= DESTROY_MAX_ATTEMPTS {
                return Err(self.error(format!("{remaining} tasks survived {attempts} kills")));
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(DESTROY_MAX_BACKOFF);
        }
        self.shutdown()?;
        tracing::info!(cgroup = %self.name, "cgroup destroyed");
        Ok(())
    }

    /// Removes the cgroup directory from every controller, tolerating
    /// directories that are already gone.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be removed.
    pub fn shutdown(&self) -> Result<()> {
        for controller in self.hierarchy.controllers() {
            remove_cgroup_dir(&self.path(controller))?;
        }
        Ok(())
    }

    /// Returns true once the cgroup no longer exists in any controller.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.hierarchy
            .controllers()
            .iter()
            .all(|controller| !self.path(controller).exists())
    }

    fn parse_tasks(&self, content: &str) -> Result<Vec<i32>> {
        content
            .split_whitespace()
            .map(|pid| {
                pid.parse::<i32>()
                    .map_err(|_| self.error(format!("invalid pid {pid:?} in tasks file")))
            })
            .collect()
    }

    fn error(&self, message: String) -> CorralError {
        CorralError::Cgroup {
            name: self.name.clone(),
            message,
        }
    }
}

/// Signals `pids` in descending order with `interval` between sends.
fn signal_pids<F>(mut pids: Vec<i32>, interval: Duration, mut send: F) -> Result<usize>
where
    F: FnMut(i32) -> nix::Result<()>,
{
    pids.sort_unstable_by(|a, b| b.cmp(a));
    let mut count = 0;
    for (i, pid) in pids.into_iter().enumerate() {
        if i > 0 && !interval.is_zero() {
            thread::sleep(interval);
        }
        match send(pid) {
            Ok(()) | Err(Errno::ESRCH) => count += 1,
            Err(e) => return Err(CorralError::os(format!("kill {pid}"), e)),
        }
    }
    Ok(count)
}

fn remove_cgroup_dir(dir: &Path) -> Result<()> {
    let mut backoff = DESTROY_INITIAL_BACKOFF;
    for attempt in 1..=RMDIR_ATTEMPTS {
        let err = match fs::remove_dir(dir) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        match err.raw_os_error() {
            Some(libc::ENOENT) => return Ok(()),
            Some(libc::EBUSY) if attempt < RMDIR_ATTEMPTS => {
                thread::sleep(backoff);
                backoff *= 2;
            }
            // A plain directory standing in for a cgroupfs mount keeps its
            // control files as real entries.
            Some(libc::ENOTEMPTY) => {
                return match fs::remove_dir_all(dir) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                        Err(CorralError::io(dir, e))
                    }
                    _ => Ok(()),
                };
            }
            _ => return Err(CorralError::io(dir, err)),
        }
    }
    Ok(())
}

/// Reads a single unsigned integer from a cgroup control file.
pub(crate) fn read_u64(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path).map_err(|e| CorralError::io(path, e))?;
    content.trim().parse::<u64>().map_err(|e| {
        CorralError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

/// Writes a value to an existing cgroup control file.
pub(crate) fn write_value(path: &Path, value: impl std::fmt::Display) -> Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .and_then(|mut file| file.write_all(value.to_string().as_bytes()))
        .map_err(|e| CorralError::io(path, e))
}
