//! # corral
//!
//! Minimal container runtime: cgroups, namespaces and chroot around an
//! in-container init supervisor.
//!
//! The same binary is re-executed as the namespace spawner. That mode is
//! selected by an environment sentinel and must be checked before anything
//! else runs.

mod commands;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    if corral_core::spawn::is_spawn_mode() {
        corral_core::spawn::stage2::main();
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::execute(cli)
}
