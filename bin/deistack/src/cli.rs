use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use deistack_deploy::DEFAULT_CONFIG_FILENAME;
use tracing::level_filters::LevelFilter;
use url::Url;

#[derive(Parser)]
#[command(name = "deistack")]
#[command(
    author,
    version,
    about = "Deploy, configure and hand over the DEI contract stack"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "DEISTACK_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a deployment, resuming a previous run of the same configuration.
    Deploy(DeployArgs),
    /// Validate a deployment and print its order without sending anything.
    Plan(ConfigArgs),
    /// Advance the shadow signer's nonce until it matches the primary's.
    Align(AlignArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Path to the deployment file, or to a directory containing `deistack.toml`.
    ///
    /// Values can be overridden with `DEISTACK_` environment variables,
    /// nested keys separated by `__` (e.g. `DEISTACK_NETWORK__RPC_URL`).
    #[arg(long, alias = "conf", env = "DEISTACK_CONFIG", default_value = DEFAULT_CONFIG_FILENAME)]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    #[clap(flatten)]
    pub config: ConfigArgs,

    /// The path to the output data directory.
    ///
    /// If not provided, the data will be stored at: ./data-<network-name>.
    /// Dry runs default to a temporary directory.
    #[arg(long, env = "DEISTACK_OUTDATA")]
    pub outdata: Option<PathBuf>,

    /// Directory of compiled contract artifacts (Hardhat `artifacts/`).
    #[arg(long, env = "DEISTACK_ARTIFACTS")]
    pub artifacts: Option<PathBuf>,

    /// Run against an in-process simulated chain instead of the network.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Discard the journal of a different deployment found in the output directory.
    #[arg(long, default_value_t = false)]
    pub fresh: bool,

    /// Start configuration at this step (1-based) instead of where the last run stopped.
    #[arg(long)]
    pub from_step: Option<usize>,

    /// Skip source verification.
    #[arg(long, default_value_t = false)]
    pub no_verify: bool,
}

#[derive(Debug, Clone, Args)]
pub struct AlignArgs {
    #[clap(flatten)]
    pub config: ConfigArgs,

    /// JSON-RPC endpoint of the primary network.
    #[arg(long, env = "DEISTACK_PRIMARY_RPC")]
    pub primary_rpc: Url,
}
