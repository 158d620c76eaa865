//! Spawn-mode entry point.
//!
//! Runs in the re-executed binary. The process tree it builds is:
//!
//! ```text
//! stage2 (host namespaces, joins the cgroup, waits)
//!   └─ child (unshares namespaces)
//!        └─ grandchild, only with --pid (PID 1 of the new namespace)
//! ```
//!
//! The innermost process chroots and `execve`s the target command. Every
//! intermediate process waits for its child and exits with its status.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use clap::Parser;
use corral_common::error::{CorralError, Result};
use corral_common::types::{IdMap, Namespaces};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execve, fork, pipe};
use tracing_subscriber::EnvFilter;

use crate::filesystem::{chroot, mount};
use crate::namespace::{self, user};

/// Exit code used when the spawner itself fails.
const SPAWN_FAILURE: i32 = 125;

/// Flags accepted in spawn mode.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Parser)]
#[command(name = "corral-stage2")]
pub struct Stage2Args {
    /// Directory to run the command in.
    #[arg(long)]
    pub directory: PathBuf,
    /// Change root into `directory` before exec.
    #[arg(long)]
    pub chroot: bool,
    /// Unshare the IPC namespace.
    #[arg(long)]
    pub ipc: bool,
    /// Unshare the UTS namespace.
    #[arg(long)]
    pub uts: bool,
    /// Unshare the mount namespace.
    #[arg(long)]
    pub mount: bool,
    /// Unshare the PID namespace.
    #[arg(long)]
    pub pid: bool,
    /// Unshare the network namespace.
    #[arg(long)]
    pub net: bool,
    /// Unshare the user namespace.
    #[arg(long)]
    pub user: bool,
    /// Uid mapping as `inside:outside:count`.
    #[arg(long)]
    pub uidmap: Option<IdMap>,
    /// Gid mapping as `inside:outside:count`.
    #[arg(long)]
    pub gidmap: Option<IdMap>,
    /// Descriptor holding the command's stdin.
    #[arg(long, default_value_t = 0)]
    pub stdinfd: i32,
    /// Descriptor holding the command's stdout.
    #[arg(long, default_value_t = 1)]
    pub stdoutfd: i32,
    /// Descriptor holding the command's stderr.
    #[arg(long, default_value_t = 2)]
    pub stderrfd: i32,
    /// Cgroup `tasks` file to join; repeatable.
    #[arg(long = "taskfile")]
    pub task_files: Vec<PathBuf>,
    /// `KEY=VALUE` environment entry of the command; repeatable.
    #[arg(long = "env", allow_hyphen_values = true)]
    pub environment: Vec<String>,
    /// Command and arguments.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Stage2Args {
    /// Returns the namespaces requested on the command line.
    #[must_use]
    pub const fn namespaces(&self) -> Namespaces {
        Namespaces {
            ipc: self.ipc,
            uts: self.uts,
            mount: self.mount,
            pid: self.pid,
            net: self.net,
            user: self.user,
        }
    }
}

/// Runs spawn mode and exits the process with the contained command's
/// status.
pub fn main() -> ! {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Stage2Args::parse();
    let code = match run(&args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "spawner failed");
            SPAWN_FAILURE
        }
    };
    std::process::exit(code)
}

/// Builds the process tree described by `args` and returns the exit code of
/// the contained command.
///
/// # Errors
///
/// Returns an error if joining the cgroup, forking, or the uid/gid map
/// handshake fails in the calling process.
pub fn run(args: &Stage2Args) -> Result<i32> {
    let own_pid = std::process::id();
    for path in &args.task_files {
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| CorralError::io(path, e))?;
        file.write_all(format!("{own_pid}\n").as_bytes())
            .map_err(|e| CorralError::io(path, e))?;
    }
    tracing::info!(pid = own_pid, directory = %args.directory.display(), "spawner joined cgroup");

    let (ready_read, ready_write) = pipe().map_err(|e| CorralError::os("pipe", e))?;
    let (go_read, go_write) = pipe().map_err(|e| CorralError::os("pipe", e))?;
    let (mut ready_read, mut ready_write) = (File::from(ready_read), File::from(ready_write));
    let (mut go_read, mut go_write) = (File::from(go_read), File::from(go_write));

    // SAFETY: spawn mode is single-threaded up to this point.
    match unsafe { fork() }.map_err(|e| CorralError::os("fork", e))? {
        ForkResult::Parent { child } => {
            drop(ready_write);
            drop(go_read);
            if args.user {
                sync_byte_read(&mut ready_read)?;
                let default = IdMap::default();
                user::write_id_maps(
                    child.as_raw(),
                    args.uidmap.as_ref().unwrap_or(&default),
                    args.gidmap.as_ref().unwrap_or(&default),
                )?;
                go_write
                    .write_all(&[1])
                    .map_err(|e| CorralError::os("signal namespace child", e))?;
            }
            drop(go_write);
            wait_for(child)
        }
        ForkResult::Child => {
            drop(ready_read);
            drop(go_write);
            let code = match isolate(args, &mut ready_write, &mut go_read) {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "namespace setup failed");
                    SPAWN_FAILURE
                }
            };
            std::process::exit(code)
        }
    }
}

/// Runs in the first child: unshares, then execs directly or through one
/// more fork when a PID namespace was requested.
fn isolate(args: &Stage2Args, ready: &mut File, go: &mut File) -> Result<i32> {
    namespace::unshare_namespaces(&args.namespaces())?;
    if args.user {
        ready
            .write_all(&[1])
            .map_err(|e| CorralError::os("signal spawner", e))?;
        sync_byte_read(go)?;
    }

    if !args.pid {
        return Err(exec_command(args));
    }
    // SAFETY: still single-threaded.
    match unsafe { fork() }.map_err(|e| CorralError::os("fork", e))? {
        ForkResult::Parent { child } => wait_for(child),
        ForkResult::Child => Err(exec_command(args)),
    }
}

/// Finishes setup in the innermost process and replaces it with the
/// command. Only returns on failure.
fn exec_command(args: &Stage2Args) -> CorralError {
    match prepare_and_exec(args) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

fn prepare_and_exec(args: &Stage2Args) -> Result<std::convert::Infallible> {
    if args.mount {
        mount::make_private()?;
        if args.pid {
            mount::mount_proc(&args.directory.join("proc"))?;
        }
    }

    for (source, target) in [(args.stdinfd, 0), (args.stdoutfd, 1), (args.stderrfd, 2)] {
        if source == target {
            continue;
        }
        // SAFETY: dup2 onto the standard slots; `source` was wired by the
        // parent before exec.
        if unsafe { libc::dup2(source, target) } < 0 {
            return Err(CorralError::os(
                format!("dup2 {source} -> {target}"),
                std::io::Error::last_os_error(),
            ));
        }
        // SAFETY: the slot was duplicated above and is not used again.
        let _ = unsafe { libc::close(source) };
    }

    if args.chroot {
        chroot::enter_root(&args.directory)?;
    } else {
        nix::unistd::chdir(&args.directory)
            .map_err(|e| CorralError::os(format!("chdir {}", args.directory.display()), e))?;
    }

    let argv = c_strings(&args.command)?;
    let envp = c_strings(&args.environment)?;
    let Some(program) = argv.first() else {
        return Err(CorralError::Spawn {
            message: "command is empty".into(),
        });
    };
    execve(program, &argv, &envp).map_err(|e| {
        CorralError::os(format!("execve {}", program.to_string_lossy()), e)
    })
}

fn c_strings(values: &[String]) -> Result<Vec<CString>> {
    values
        .iter()
        .map(|value| {
            CString::new(value.as_bytes()).map_err(|_| CorralError::Spawn {
                message: format!("argument contains a NUL byte: {value:?}"),
            })
        })
        .collect()
}

fn sync_byte_read(pipe: &mut File) -> Result<()> {
    let mut byte = [0u8; 1];
    pipe.read_exact(&mut byte)
        .map_err(|e| CorralError::os("namespace handshake", e))
}

/// Waits for `child` and converts its termination into an exit code.
fn wait_for(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(e) => return Err(CorralError::os(format!("waitpid {child}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spawner_invocation() {
        let args = Stage2Args::try_parse_from([
            "corral", "--directory", "/c/rootfs", "--chroot", "--pid", "--user", "--uidmap",
            "0:100000:65536", "--stdinfd", "3", "--stdoutfd", "4", "--stderrfd", "5",
            "--taskfile", "/cg/cpu/x/tasks", "--env", "PATH=/bin", "--env", "OPTS=-v", "--",
            "/.corral/init", "--flag",
        ])
        .unwrap();
        assert!(args.chroot);
        assert!(args.namespaces().pid);
        assert!(!args.namespaces().net);
        assert_eq!(args.uidmap, Some(IdMap::default()));
        assert_eq!(args.gidmap, None);
        assert_eq!(args.stdoutfd, 4);
        assert_eq!(args.environment, vec!["PATH=/bin", "OPTS=-v"]);
        assert_eq!(args.command, vec!["/.corral/init", "--flag"]);
    }

    #[test]
    fn command_is_required() {
        assert!(Stage2Args::try_parse_from(["corral", "--directory", "/c"]).is_err());
    }

    #[test]
    fn builder_output_parses_back() {
        let cmd = super::super::SpawnCommand::new("/c/rootfs", vec!["/.corral/init".into()])
            .namespaces(Namespaces::all())
            .environment(["A=1".to_string()]);
        let mut argv = vec![std::ffi::OsString::from("corral")];
        argv.extend(cmd.args());
        let args = Stage2Args::try_parse_from(argv).unwrap();
        assert_eq!(args.namespaces(), Namespaces::all());
        assert_eq!(args.stdinfd, 3);
        assert_eq!(args.stderrfd, 5);
        assert_eq!(args.command, vec!["/.corral/init"]);
    }
}
