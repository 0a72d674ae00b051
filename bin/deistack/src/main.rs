//! deistack is a CLI tool to deploy and wire the DEI contract stack onto an EVM network.

mod cli;
mod config;
mod summary;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{AlignArgs, Cli, Command, ConfigArgs, DeployArgs};
use deistack_deploy::{
    ArtifactStore, ChainClient, DeploymentSpec, JsonRpcClient, NetworkContext, Planner,
    RunOptions, SimulatedChain, nonce::NonceSynchronizer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Command::Deploy(args) => deploy(args).await,
        Command::Plan(args) => plan(args),
        Command::Align(args) => align(args).await,
    }
}

async fn deploy(args: DeployArgs) -> Result<()> {
    let spec = config::load(&args.config.config)?;

    let artifacts = match &args.artifacts {
        Some(dir) => ArtifactStore::open(dir)?,
        None if args.dry_run => ArtifactStore::synthetic(),
        None => anyhow::bail!("--artifacts is required unless --dry-run is set"),
    };

    // Kept alive until the run ends.
    let mut scratch = None;
    let outdata = match (&args.outdata, args.dry_run) {
        (Some(path), _) => path.clone(),
        (None, true) => {
            let dir = tempdir::TempDir::new("deistack-dry-run")
                .context("Failed to create temporary directory")?;
            let path = dir.path().to_path_buf();
            scratch = Some(dir);
            path
        }
        (None, false) => PathBuf::from(format!("data-{}", spec.network.name)),
    };

    let options = RunOptions {
        outdata,
        from_step: args.from_step,
        fresh: args.fresh,
        verify: !args.no_verify,
    };

    tracing::info!(
        network = %spec.network.name,
        outdata = %options.outdata.display(),
        dry_run = args.dry_run,
        "Starting deployment"
    );

    if args.dry_run {
        execute(&spec, SimulatedChain::from_spec(&spec), artifacts, options).await?;
    } else {
        let client = JsonRpcClient::new(spec.network.rpc_url.clone())?;
        execute(&spec, client, artifacts, options).await?;
    }

    drop(scratch);
    Ok(())
}

async fn execute<C: ChainClient>(
    spec: &DeploymentSpec,
    client: C,
    artifacts: ArtifactStore,
    options: RunOptions,
) -> Result<()> {
    let report = deistack_deploy::run(spec, client, artifacts, options).await?;
    summary::print_report(&report);
    Ok(())
}

fn plan(args: ConfigArgs) -> Result<()> {
    let spec = config::load(&args.config)?;
    let plan = Planner::plan(&spec)?;
    summary::print_plan(&spec, &plan);
    Ok(())
}

async fn align(args: AlignArgs) -> Result<()> {
    let spec = config::load(&args.config.config)?;

    let primary = JsonRpcClient::new(args.primary_rpc)?;
    let shadow = JsonRpcClient::new(spec.network.rpc_url.clone())?;
    let mut ctx = NetworkContext::connect(shadow, &spec.network).await?;

    let burned = NonceSynchronizer::new(&mut ctx).align(&primary).await?;
    tracing::info!(
        signer = %ctx.signer(),
        burned,
        nonce = ctx.nonce(),
        "Shadow nonce aligned with the primary"
    );
    Ok(())
}
