//! `corral validate` — Check a manifest against the runtime policy.

use std::path::PathBuf;

use clap::Args;
use corral_common::config::RuntimeConfig;
use corral_common::manifest::ImageManifest;

/// Arguments for the `validate` command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the JSON image manifest.
    pub manifest: PathBuf,
}

/// Executes the `validate` command.
///
/// # Errors
///
/// Returns an error if the manifest cannot be read or is rejected.
pub fn execute(args: &ValidateArgs, config: &RuntimeConfig) -> anyhow::Result<()> {
    let manifest = ImageManifest::load(&args.manifest)?;
    manifest.validate(&config.required_namespaces)?;
    let app = manifest.require_app()?;
    println!("{}: ok", manifest.name);
    println!("  exec: {}", app.exec.join(" "));
    println!("  namespaces: {}", namespace_list(app));
    Ok(())
}

fn namespace_list(app: &corral_common::manifest::App) -> String {
    let ns = &app.isolators.namespaces;
    let enabled: Vec<&str> = [
        (ns.ipc, "ipc"),
        (ns.uts, "uts"),
        (ns.mount, "mount"),
        (ns.pid, "pid"),
        (ns.net, "net"),
        (ns.user, "user"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    if enabled.is_empty() {
        "none".to_string()
    } else {
        enabled.join(",")
    }
}
