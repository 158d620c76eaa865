//! End-to-end tests of the `corral` binary that need no privileges.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;
use std::process::{Command, Output};

const VALID: &str = r#"{
    "name": "example.com/web",
    "app": {
        "exec": ["/bin/web", "--port", "8080"],
        "isolators": {"namespaces": {"pid": true, "mount": true}}
    }
}"#;

fn corral(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_corral"))
        .args(args)
        .env_remove("CORRAL_CONFIG")
        .env_remove("CORRAL_SPAWNER_INTERCEPT")
        .output()
        .unwrap()
}

fn write(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_str().unwrap().to_string()
}

// ── validate ───────────────────────────────────────────────────

#[test]
fn validate_accepts_a_well_formed_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write(dir.path(), "manifest.json", VALID);

    let output = corral(&["validate", &manifest]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("example.com/web: ok"));
    assert!(stdout.contains("namespaces: mount,pid"));
}

#[test]
fn validate_rejects_a_relative_command() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write(
        dir.path(),
        "manifest.json",
        r#"{"name": "x", "app": {"exec": ["web"]}}"#,
    );

    let output = corral(&["validate", &manifest]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("absolute path"));
}

#[test]
fn validate_applies_required_namespaces_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write(dir.path(), "manifest.json", VALID);
    let config = write(
        dir.path(),
        "config.json",
        r#"{"required_namespaces": {"net": true}}"#,
    );

    let output = corral(&["--config", &config, "validate", &manifest]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("net"));
}

// ── spawn mode ─────────────────────────────────────────────────

#[test]
fn spawner_sentinel_selects_spawn_mode() {
    let output = Command::new(env!("CARGO_BIN_EXE_corral"))
        .env("CORRAL_SPAWNER_INTERCEPT", "1")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("corral-stage2"));
}
