//! `corral run` — Create a container and supervise it in the foreground.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use corral_common::config::RuntimeConfig;
use corral_common::manifest::ImageManifest;
use corral_common::types::ContainerState;
use corral_runtime::container::Container;
use corral_runtime::manager::Manager;
use corral_runtime::metrics::collect_metrics;
use corral_runtime::spawner::NamespaceSpawner;

use crate::output::{format_bytes, format_cpu, state_marker};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the JSON image manifest.
    #[arg(long)]
    pub manifest: PathBuf,

    /// Path to the root filesystem archive (tar, optionally gzip).
    #[arg(long)]
    pub image: PathBuf,
}

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the inputs cannot be read, the manifest is rejected,
/// startup fails, or the container cannot be stopped.
pub fn execute(args: RunArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let started = Instant::now();
    let manifest = ImageManifest::load(&args.manifest)?;
    let image = File::open(&args.image)
        .map_err(|e| anyhow::anyhow!("cannot open image {}: {e}", args.image.display()))?;

    let spawner = Arc::new(NamespaceSpawner::new(&config));
    let manager = Manager::new(config, spawner)?;
    let container = manager.create(manifest, Box::new(image))?;

    eprintln!();
    eprintln!(
        "  {BOLD}{}{RESET} {DIM}[{}]{RESET}",
        container.manifest().name,
        container.id()
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    let mut announced = false;
    loop {
        let state = container.state();
        if state == ContainerState::Running && !announced {
            announced = true;
            eprintln!(
                "  {} running in {:.1}s {DIM}({}){RESET}",
                state_marker(state),
                started.elapsed().as_secs_f64(),
                container.directory().display()
            );
            eprintln!("  Press {BOLD}Ctrl+C{RESET} to stop the container...");
        }
        if state.is_terminal() {
            break;
        }
        if interrupted.load(Ordering::SeqCst) {
            eprintln!();
            report_usage(&container);
            eprintln!("  Stopping container...");
            container.stop()?;
            let _ = container.wait_until(Duration::from_secs(30), ContainerState::is_terminal);
            break;
        }
        let _ = container.wait_until(POLL_INTERVAL, ContainerState::is_terminal);
    }

    if let Some(error) = container.startup_error() {
        eprintln!("  {RED}✗{RESET} startup failed");
        anyhow::bail!("container {} failed to start: {error}", container.id());
    }
    let state = container.state();
    eprintln!("  {} {GREEN}Container {state}.{RESET}", state_marker(state));
    Ok(())
}

fn report_usage(container: &Container) {
    match collect_metrics(container) {
        Ok(metrics) => eprintln!(
            "  {DIM}cpu {}, memory {}, disk {}{RESET}",
            format_cpu(metrics.cpu_usage_ns),
            format_bytes(metrics.memory_usage_bytes),
            format_bytes(u64::try_from(metrics.disk_used_bytes).unwrap_or(0)),
        ),
        Err(e) => tracing::warn!(error = %e, "metrics unavailable"),
    }
}
