//! Unix socket server of the init supervisor.
//!
//! One request is served per connection. Each connection runs in its own
//! task; the only shared state is the [`Supervisor`]. Request handlers run
//! in a further task so that a panic is contained and answered with
//! [`REPLY_INTERNAL_ERROR`] instead of taking the supervisor down.

use std::backtrace::Backtrace;
use std::future::Future;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinError;

use crate::protocol::{
    REPLY_FAILED, REPLY_INTERNAL_ERROR, REPLY_OK, REPLY_PROTOCOL_ERROR, Request, STATUS_END,
    env_pairs, read_groups,
};
use crate::supervisor::{Supervisor, open_output};

/// How long a client may take to send its request.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Server tuning.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Collect every terminated child, not only tracked ones.
    pub reap_orphans: bool,
    /// Deadline for reading one request.
    pub read_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            reap_orphans: std::process::id() == 1,
            read_timeout: REQUEST_READ_TIMEOUT,
        }
    }
}

/// A bound supervisor socket.
#[derive(Debug)]
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    supervisor: Arc<Supervisor>,
    options: ServerOptions,
}

/// What to do after the reply is written.
enum Reply {
    Text(String),
    ExecAfterReply(Command),
}

impl Server {
    /// Binds the socket at `path`, replacing a stale socket file.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the stale file cannot be removed or binding fails.
    pub fn bind(path: impl Into<PathBuf>, options: ServerOptions) -> io::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "Socket file");
        Ok(Self {
            listener,
            path,
            supervisor: Arc::new(Supervisor::new(options.reap_orphans)),
            options,
        })
    }

    /// Returns the socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the process table served by this socket.
    #[must_use]
    pub const fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Serves until `SIGTERM`.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn run(self) -> io::Result<()> {
        self.serve(std::future::pending()).await
    }

    /// Serves until `SIGTERM` or until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut sigchld = signal(SignalKind::child())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tracing::info!("Setup signal handler.");
        tokio::pin!(shutdown);

        // Children may have exited before the handler was installed.
        let _ = self.supervisor.reap();
        tracing::info!("Starting initd.");
        loop {
            tokio::select! {
                _ = sigchld.recv() => {
                    let reaped = self.supervisor.reap();
                    tracing::debug!(reaped, "SIGCHLD handled");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    return Ok(());
                }
                () = &mut shutdown => {
                    tracing::debug!("shutdown requested");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let supervisor = Arc::clone(&self.supervisor);
                        let timeout = self.options.read_timeout;
                        let _ = tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, supervisor, timeout).await {
                                tracing::debug!(error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
                },
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    supervisor: Arc<Supervisor>,
    timeout: Duration,
) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let groups = match tokio::time::timeout(timeout, read_groups(&mut reader)).await {
        Ok(Ok(groups)) => groups,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "protocol error");
            write.write_all(REPLY_PROTOCOL_ERROR.as_bytes()).await?;
            return write.shutdown().await;
        }
        Err(_) => {
            tracing::warn!("timed out reading request");
            return Ok(());
        }
    };
    let request = match Request::from_groups(groups) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "protocol error");
            write.write_all(REPLY_PROTOCOL_ERROR.as_bytes()).await?;
            return write.shutdown().await;
        }
    };

    let verb = request.verb();
    tracing::debug!(command = verb, "request received");
    let abandonable = matches!(request, Request::Wait);
    let handler = tokio::spawn(dispatch(request, supervisor));
    let reply = if abandonable {
        let abort = handler.abort_handle();
        tokio::select! {
            joined = handler => contain(verb, joined),
            () = hangup(&mut reader) => {
                abort.abort();
                tracing::debug!(command = verb, "client hung up, request abandoned");
                return Ok(());
            }
        }
    } else {
        contain(verb, handler.await)
    };

    match reply {
        Reply::Text(text) => {
            write.write_all(text.as_bytes()).await?;
            write.shutdown().await
        }
        Reply::ExecAfterReply(mut command) => {
            write.write_all(REPLY_OK.as_bytes()).await?;
            write.flush().await?;
            let err = command.exec();
            tracing::error!(error = %err, "exec failed after reply");
            std::process::exit(127)
        }
    }
}

/// Turns a crashed handler into an `INTERNAL ERROR` reply.
fn contain(verb: &str, joined: Result<Reply, JoinError>) -> Reply {
    joined.unwrap_or_else(|e| {
        tracing::error!(command = verb, error = %e, "request handler crashed");
        Reply::Text(REPLY_INTERNAL_ERROR.into())
    })
}

/// Completes once the peer closes its end of the connection.
async fn hangup<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn dispatch(request: Request, supervisor: Arc<Supervisor>) -> Reply {
    match request {
        Request::Chroot {
            directory,
            privileged,
        } => Reply::Text(text_reply(chroot(&directory, privileged))),
        Request::SetHostname { hostname } => Reply::Text(text_reply(
            corral_core::namespace::uts::set_hostname(&hostname).map_err(|e| e.to_string()),
        )),
        Request::Exec {
            command,
            environment,
            stdout,
            stderr,
        } => match exec_command(&command, &environment, &stdout, &stderr) {
            Ok(command) => Reply::ExecAfterReply(command),
            Err(message) => Reply::Text(failed(&message)),
        },
        Request::Start(start) => Reply::Text(text_reply(
            supervisor.start(&start).map(|_| ()).map_err(|e| e.to_string()),
        )),
        Request::Status => Reply::Text(status_reply(&supervisor)),
        Request::Wait => {
            if let Some(waiter) = supervisor.wait() {
                let _ = waiter.await;
            }
            Reply::Text(REPLY_OK.into())
        }
    }
}

fn chroot(directory: &str, privileged: bool) -> Result<(), String> {
    corral_core::filesystem::chroot::enter_root(Path::new(directory)).map_err(|e| e.to_string())?;
    if !privileged {
        corral_core::capability::set_no_new_privs().map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn exec_command(
    command: &[String],
    environment: &[String],
    stdout: &str,
    stderr: &str,
) -> Result<Command, String> {
    let Some((program, args)) = command.split_first() else {
        return Err("empty command".into());
    };
    let stdout = open_output(stdout).map_err(|e| e.to_string())?;
    let stderr = open_output(stderr).map_err(|e| e.to_string())?;
    let mut cmd = Command::new(program);
    let _ = cmd
        .args(args)
        .env_clear()
        .envs(env_pairs(environment))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    Ok(cmd)
}

fn status_reply(supervisor: &Supervisor) -> String {
    let mut reply = String::from("REQUEST OK\n");
    for (name, status) in supervisor.status() {
        reply.push_str(&format!("{name}\n{status}\n"));
    }
    reply.push_str(STATUS_END);
    reply.push('\n');
    reply
}

fn text_reply(result: Result<(), String>) -> String {
    match result {
        Ok(()) => REPLY_OK.into(),
        Err(message) => {
            tracing::warn!(error = %message, "request failed");
            failed(&message)
        }
    }
}

fn failed(message: &str) -> String {
    format!("{REPLY_FAILED}{}\n", message.replace('\n', " "))
}

/// Logs panics with a captured backtrace before the default unwinding.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!(panic = %info, %backtrace, "panic in init supervisor");
    }));
}
