//! End-to-end tests of the supervisor socket, served from a background
//! thread and driven through raw frames and the blocking client.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use corral_init::client::Client;
use corral_init::error::ClientError;
use corral_init::protocol::{StartRequest, encode};
use corral_init::server::{Server, ServerOptions};
use corral_init::supervisor::Supervisor;
use serial_test::serial;
use tokio::sync::oneshot;

struct Harness {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    out: String,
    supervisor: Arc<Supervisor>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("init.sock");
        let out = dir.path().join("out.log").display().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let path = socket.clone();
        let thread = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let options = ServerOptions {
                    reap_orphans: false,
                    ..ServerOptions::default()
                };
                let server = Server::bind(&path, options).unwrap();
                ready_tx.send(Arc::clone(server.supervisor())).unwrap();
                server
                    .serve(async {
                        let _ = stopped.await;
                    })
                    .await
                    .unwrap();
            });
        });
        let supervisor = ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        Self {
            _dir: dir,
            socket,
            out,
            supervisor,
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    fn client(&self) -> Client {
        Client::new(&self.socket, Duration::from_secs(5))
    }

    fn start_request(&self, name: Option<&str>, command: &[&str]) -> StartRequest {
        StartRequest {
            name: name.map(ToString::to_string),
            command: command.iter().map(ToString::to_string).collect(),
            working_directory: "/".into(),
            environment: vec!["PATH=/usr/bin:/bin".into()],
            stdout: self.out.clone(),
            stderr: self.out.clone(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn raw_exchange(socket: &Path, bytes: &[u8]) -> String {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(bytes).unwrap();
    let mut reply = String::new();
    let _ = stream.read_to_string(&mut reply).unwrap();
    reply
}

fn groups(raw: &[&[&str]]) -> Vec<Vec<String>> {
    raw.iter()
        .map(|group| group.iter().map(ToString::to_string).collect())
        .collect()
}

#[test]
#[serial]
fn status_reports_exit_codes() {
    let harness = Harness::start();
    let client = harness.client();
    client
        .start(harness.start_request(Some("true"), &["/bin/true"]))
        .unwrap();
    client
        .start(harness.start_request(Some("false"), &["/bin/false"]))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = client.status().unwrap();
        if status.get("true").map(String::as_str) == Some("exited(0)")
            && status.get("false").map(String::as_str) == Some("exited(1)")
        {
            break;
        }
        assert!(Instant::now() < deadline, "unexpected status {status:?}");
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
#[serial]
fn status_reply_has_odd_line_count() {
    let harness = Harness::start();
    let reply = raw_exchange(&harness.socket, &encode(&groups(&[&["STATUS"]])));
    assert_eq!(reply, "REQUEST OK\nEND\n");
    assert_eq!(reply.split('\n').count() % 2, 1);
}

#[test]
#[serial]
fn wait_returns_immediately_when_idle() {
    let harness = Harness::start();
    let reply = raw_exchange(&harness.socket, &encode(&groups(&[&["WAIT"]])));
    assert_eq!(reply, "REQUEST OK\n\n");
}

#[test]
#[serial]
fn wait_blocks_until_a_process_exits() {
    let harness = Harness::start();
    let client = harness.client();
    client
        .start(harness.start_request(Some("sleeper"), &["/bin/sleep", "0.5"]))
        .unwrap();

    let started = Instant::now();
    client.wait().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(
        client.status().unwrap().get("sleeper").map(String::as_str),
        Some("exited(0)")
    );
}

#[test]
#[serial]
fn abandoned_waits_are_released() {
    let harness = Harness::start();
    let client = harness.client();
    client
        .start(harness.start_request(Some("long"), &["/bin/sleep", "5"]))
        .unwrap();

    let impatient = Client::new(&harness.socket, Duration::from_millis(30));
    for _ in 0..20 {
        assert!(matches!(impatient.wait(), Err(ClientError::Timeout)));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.supervisor.waiting() > 0 {
        assert!(Instant::now() < deadline, "abandoned waits still queued");
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        client.status().unwrap().get("long").map(String::as_str),
        Some("running")
    );
}

#[test]
#[serial]
fn malformed_requests_get_protocol_error() {
    let harness = Harness::start();
    for request in [
        &b"0\n1\n1\n4\nWAIT"[..],
        &b"1\nabc\n"[..],
        &b"1\n1\n1\nx\nWAIT"[..],
        &b"1\n1\n1\n6\nREBOOT"[..],
        &b"1\n2\n1\n6\nSTATUS0\n"[..],
    ] {
        assert_eq!(raw_exchange(&harness.socket, request), "PROTOCOL ERROR\n");
    }
}

#[test]
#[serial]
fn failed_start_is_reported_not_fatal() {
    let harness = Harness::start();
    let client = harness.client();
    let err = client
        .start(harness.start_request(None, &["/nonexistent/program"]))
        .unwrap_err();
    assert!(err.to_string().contains("request failed"));
    assert!(client.status().unwrap().is_empty());
}

#[test]
#[serial]
fn running_name_cannot_be_reused() {
    let harness = Harness::start();
    let client = harness.client();
    client
        .start(harness.start_request(Some("app"), &["/bin/sleep", "5"]))
        .unwrap();
    assert!(client
        .start(harness.start_request(Some("app"), &["/bin/true"]))
        .is_err());
    assert_eq!(
        client.status().unwrap().get("app").map(String::as_str),
        Some("running")
    );
}
