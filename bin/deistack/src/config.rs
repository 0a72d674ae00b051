//! Layered loading of the deployment file.

use std::path::Path;

use anyhow::{Context, Result};
use deistack_deploy::{DEFAULT_CONFIG_FILENAME, DeploymentSpec};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};

/// Prefix of the environment variables overriding the deployment file.
pub const ENV_PREFIX: &str = "DEISTACK_";

/// Variables read by the CLI itself rather than the deployment.
const CLI_VARIABLES: &[&str] = &[
    "verbosity",
    "config",
    "outdata",
    "artifacts",
    "primary_rpc",
];

/// Load the deployment file, then apply `DEISTACK_` environment overrides.
pub fn load(path: &Path) -> Result<DeploymentSpec> {
    let file = if path.is_dir() {
        path.join(DEFAULT_CONFIG_FILENAME)
    } else {
        path.to_path_buf()
    };
    if !file.exists() {
        anyhow::bail!("Deployment file not found: {}", file.display());
    }

    let spec: DeploymentSpec = Figment::new()
        .merge(Toml::file(&file))
        .merge(Env::prefixed(ENV_PREFIX).ignore(CLI_VARIABLES).split("__"))
        .extract()
        .with_context(|| format!("Failed to load deployment from {}", file.display()))?;

    tracing::info!(
        path = %file.display(),
        network = %spec.network.name,
        chain_id = spec.network.chain_id,
        units = spec.units.len(),
        steps = spec.configure.len(),
        "Deployment loaded"
    );
    Ok(spec)
}
