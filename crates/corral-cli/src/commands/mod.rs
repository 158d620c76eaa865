//! CLI command definitions and dispatch.

pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use corral_common::config::RuntimeConfig;

/// corral: a minimal container runtime.
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON runtime configuration file.
    #[arg(long, global = true, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding one subdirectory per container.
    #[arg(long, global = true)]
    pub containers_dir: Option<PathBuf>,

    /// Cgroup v1 mount root.
    #[arg(long, global = true)]
    pub cgroup_root: Option<PathBuf>,

    /// Init supervisor binary copied into every container.
    #[arg(long, global = true)]
    pub init_binary: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from a manifest and image, and run it until it
    /// exits or Ctrl+C.
    Run(run::RunArgs),
    /// Check a manifest against the runtime policy.
    Validate(validate::ValidateArgs),
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the result is invalid.
    pub fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(dir) = &self.containers_dir {
            config.containers_dir.clone_from(dir);
        }
        if let Some(root) = &self.cgroup_root {
            config.cgroup_root.clone_from(root);
        }
        if let Some(binary) = &self.init_binary {
            config.init_binary.clone_from(binary);
        }
        config.validate()?;
        tracing::debug!(?config, "runtime configuration");
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.runtime_config()?;
    match cli.command {
        Command::Run(args) => run::execute(args, config),
        Command::Validate(args) => validate::execute(&args, &config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"containers_dir": "/from/file", "cgroup_root": "/cg"}"#).unwrap();

        let cli = Cli::parse_from([
            "corral",
            "--config",
            path.to_str().unwrap(),
            "--containers-dir",
            "/from/flag",
            "validate",
            "manifest.json",
        ]);
        let config = cli.runtime_config().unwrap();

        assert_eq!(config.containers_dir, PathBuf::from("/from/flag"));
        assert_eq!(config.cgroup_root, PathBuf::from("/cg"));
    }

    #[test]
    fn run_requires_manifest_and_image() {
        assert!(Cli::try_parse_from(["corral", "run", "--manifest", "m.json"]).is_err());
        let cli = Cli::try_parse_from(["corral", "run", "--manifest", "m.json", "--image", "i.tar"])
            .unwrap();
        assert!(matches!(cli.command, Command::Run(_)));
    }
}
