//! A deployment run, from plan to handover.
//!
//! [`Deployment`] drives the components strictly one transaction at a time:
//! units in plan order, then configuration steps, then the handover. Nonce
//! skips attached to a unit or phase run right after it. Progress is written
//! to the run journal after every confirmed step so a failed run can be
//! resumed.

mod phases;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::PathBuf;

use alloy_core::primitives::Address;
use anyhow::Context;
use serde::Serialize;

pub use phases::{Configured, Deployed, NextPhase, Planned, RunPhase};

use crate::abi::AbiValue;
use crate::artifacts::ArtifactStore;
use crate::chain::ChainClient;
use crate::configure::{ConfigurationStep, ParameterConfigurator};
use crate::error::{DeployError, Result};
use crate::journal::{RunJournal, RunLock};
use crate::liquidity::{LiquidityBootstrapper, PairBootstrapRequest};
use crate::network::NetworkContext;
use crate::nonce::NonceSynchronizer;
use crate::plan::{AddressBook, DeploymentPlan, Planner, UnitState, UnitTemplate};
use crate::roles::{HandoverReport, RoleGrantManager};
use crate::spec::{DeploymentSpec, Phase, SyncPoint};
use crate::verify::{VerificationRequest, VerificationSummary, Verifier};

/// Name of the address record inside the output directory.
pub const ADDRESSES_FILENAME: &str = "addresses.json";

/// How a run is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Directory for the journal, lock and side outputs.
    pub outdata: PathBuf,
    /// Start configuration at this 1-based step instead of where the journal stopped.
    pub from_step: Option<usize>,
    /// Discard a journal left by a different deployment.
    pub fresh: bool,
    /// Run source verification after the deploy phase.
    pub verify: bool,
}

impl RunOptions {
    pub fn new(outdata: impl Into<PathBuf>) -> Self {
        Self {
            outdata: outdata.into(),
            from_step: None,
            fresh: false,
            verify: true,
        }
    }
}

/// A unit as it ended up on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitRecord {
    pub name: String,
    /// Artifact name, or `pair` for AMM pairs.
    pub kind: String,
    pub address: Address,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReport {
    pub network: String,
    pub chain_id: u64,
    pub signer: Address,
    pub units: Vec<UnitRecord>,
    /// Transactions sent by this invocation.
    pub transactions: usize,
    pub final_nonce: u64,
    pub verification: Option<VerificationSummary>,
    pub handover: Option<HandoverReport>,
    pub outdata: PathBuf,
}

/// A deployment run in phase `P`.
pub struct Deployment<'s, C, P: RunPhase> {
    spec: &'s DeploymentSpec,
    ctx: NetworkContext<C>,
    artifacts: ArtifactStore,
    plan: DeploymentPlan,
    book: AddressBook,
    journal: RunJournal,
    /// Transcript entries already copied into the journal.
    recorded: usize,
    options: RunOptions,
    verification: Option<VerificationSummary>,
    _lock: RunLock,
    _phase: PhantomData<P>,
}

/// Plan, deploy, verify, configure and hand over in one go.
pub async fn run<C: ChainClient>(
    spec: &DeploymentSpec,
    client: C,
    artifacts: ArtifactStore,
    options: RunOptions,
) -> Result<DeploymentReport> {
    let planned = Deployment::start(spec, client, artifacts, options).await?;
    let mut deployed = planned.deploy().await?;
    deployed.verify().await?;
    let configured = deployed.configure().await?;
    configured.hand_over().await
}

impl<'s, C: ChainClient, P: RunPhase> Deployment<'s, C, P> {
    pub fn spec(&self) -> &DeploymentSpec {
        self.spec
    }

    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    pub fn book(&self) -> &AddressBook {
        &self.book
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    pub fn context(&self) -> &NetworkContext<C> {
        &self.ctx
    }

    fn advance(self) -> Deployment<'s, C, P::Next>
    where
        P: NextPhase,
    {
        tracing::debug!(from = P::NAME, to = <P::Next as RunPhase>::NAME, "Phase complete");
        Deployment {
            spec: self.spec,
            ctx: self.ctx,
            artifacts: self.artifacts,
            plan: self.plan,
            book: self.book,
            journal: self.journal,
            recorded: self.recorded,
            options: self.options,
            verification: self.verification,
            _lock: self._lock,
            _phase: PhantomData,
        }
    }

    /// Copy new transcript entries into the journal and save it.
    fn checkpoint(&mut self) -> Result<()> {
        let transcript = self.ctx.transcript();
        self.journal
            .transcript
            .extend_from_slice(&transcript[self.recorded..]);
        self.recorded = transcript.len();
        self.journal.save(&self.options.outdata)?;
        Ok(())
    }

    /// Save progress whatever the outcome, keeping the original error if both fail.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.checkpoint()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(save) = self.checkpoint() {
                    tracing::error!(error = %save, "Failed to save journal after a failure");
                }
                Err(e)
            }
        }
    }

    /// Run the nonce skips attached to `point`, once per deployment.
    async fn sync(&mut self, point: SyncPoint) -> Result<()> {
        if self.journal.sync_done(&point) {
            return Ok(());
        }

        let spec = self.spec;
        let skips: Vec<_> = spec.skips_after(&point).collect();
        if !skips.is_empty() {
            NonceSynchronizer::new(&mut self.ctx)
                .apply(&point, skips)
                .await?;
        }

        self.journal.mark_sync(point);
        self.checkpoint()
    }
}

impl<'s, C: ChainClient> Deployment<'s, C, Planned> {
    /// Plan the deployment, take the output directory lock and connect.
    ///
    /// Planning errors are raised before anything touches the network.
    /// Units recorded in the journal of an interrupted run are restored as
    /// deployed.
    pub async fn start(
        spec: &'s DeploymentSpec,
        client: C,
        artifacts: ArtifactStore,
        options: RunOptions,
    ) -> Result<Self> {
        let mut plan = Planner::plan(spec)?;
        tracing::info!(order = ?plan.order(), "Deployment planned");

        let lock = RunLock::acquire(&options.outdata)?;
        let journal = RunJournal::resume_or_start(&options.outdata, spec, options.fresh)?;
        let ctx = NetworkContext::connect(client, &spec.network).await?;

        let mut book = AddressBook::from_spec(spec);
        for unit in plan.units_mut() {
            if let Some(address) = journal.units.get(&unit.name) {
                unit.mark_deployed(*address);
                book.insert(&unit.name, *address);
                tracing::info!(unit = %unit.name, address = %address, "Restored from journal");
            }
        }

        Ok(Self {
            spec,
            ctx,
            artifacts,
            plan,
            book,
            journal,
            recorded: 0,
            options,
            verification: None,
            _lock: lock,
            _phase: PhantomData,
        })
    }

    /// Deploy every unit in plan order.
    pub async fn deploy(mut self) -> Result<Deployment<'s, C, Deployed>> {
        let result = self.deploy_units().await;
        self.finish(result)?;

        self.sync(SyncPoint::Phase(Phase::Deploy)).await?;
        self.write_addresses()?;
        Ok(self.advance())
    }

    async fn deploy_units(&mut self) -> Result<()> {
        for index in 0..self.plan.units().len() {
            let name = self.plan.units()[index].name.clone();
            if !self.plan.units()[index].is_deployed() {
                self.plan.units_mut()[index].state = UnitState::Deploying;
                match self.deploy_unit(index).await {
                    Ok(address) => {
                        self.plan.units_mut()[index].mark_deployed(address);
                        self.book.insert(&name, address);
                        self.journal.units.insert(name.clone(), address);
                        tracing::info!(unit = %name, address = %address, "Unit deployed");
                        self.checkpoint()?;
                    }
                    Err(e) => {
                        self.plan.units_mut()[index].state = UnitState::Failed {
                            reason: e.to_string(),
                        };
                        tracing::error!(unit = %name, error = %e, "Unit deployment failed");
                        return Err(e);
                    }
                }
            }
            self.sync(SyncPoint::Unit(name)).await?;
        }
        Ok(())
    }

    async fn deploy_unit(&mut self, index: usize) -> Result<Address> {
        let unit = &self.plan.units()[index];
        let name = unit.name.clone();

        match unit.template.clone() {
            UnitTemplate::Contract { contract, args } => {
                let values = args
                    .iter()
                    .map(|a| a.resolve(&self.book, &name))
                    .collect::<Result<Vec<AbiValue>>>()?;
                let code = self.artifacts.creation_code(&contract, &values)?;
                tracing::info!(unit = %name, contract = %contract, args = values.len(), "Deploying contract");
                self.ctx.deploy(&name, code).await
            }
            UnitTemplate::Pair(pair) => {
                let (router, factory) = self.amm()?;
                let latest = self.ctx.block_timestamp().await?;
                let request = PairBootstrapRequest::resolve(&name, &pair, &self.book, latest)?;
                tracing::info!(unit = %name, deadline = request.deadline, "Bootstrapping pair");
                LiquidityBootstrapper::new(&mut self.ctx, router, factory)
                    .bootstrap(&name, &request)
                    .await
            }
        }
    }

    fn amm(&self) -> Result<(Address, Option<Address>)> {
        let unresolved = |reference: &str| DeployError::UnresolvedReference {
            unit: "amm".to_string(),
            reference: reference.to_string(),
        };
        let amm = self.spec.amm.as_ref().ok_or_else(|| unresolved("router"))?;
        let router = self
            .book
            .resolve(&amm.router)
            .ok_or_else(|| unresolved(&amm.router))?;
        let factory = match &amm.factory {
            Some(name) => Some(self.book.resolve(name).ok_or_else(|| unresolved(name))?),
            None => None,
        };
        Ok((router, factory))
    }

    fn write_addresses(&self) -> Result<()> {
        #[derive(Serialize)]
        struct Addresses<'a> {
            network: &'a str,
            chain_id: u64,
            units: &'a BTreeMap<String, Address>,
            external: &'a BTreeMap<String, Address>,
        }

        let path = self.options.outdata.join(ADDRESSES_FILENAME);
        let content = serde_json::to_string_pretty(&Addresses {
            network: &self.spec.network.name,
            chain_id: self.spec.network.chain_id,
            units: &self.journal.units,
            external: &self.spec.addresses,
        })
        .context("Failed to serialize addresses")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "Addresses written");
        Ok(())
    }
}

impl<'s, C: ChainClient> Deployment<'s, C, Deployed> {
    /// Trigger source verification for the deployed contracts.
    ///
    /// Individual verification failures are logged and reported in the
    /// summary; only failing to write the manifest is an error.
    pub async fn verify(&mut self) -> Result<Option<&VerificationSummary>> {
        if !self.options.verify {
            tracing::info!("Source verification disabled");
            return Ok(None);
        }

        let requests = VerificationRequest::for_plan(&self.plan, &self.book)?;
        let verifier = Verifier::new(&self.spec.network.name, self.spec.verify.command.as_deref());
        let summary = verifier.run(&requests, &self.options.outdata).await?;
        self.verification = Some(summary);
        Ok(self.verification.as_ref())
    }

    /// Apply the configuration steps, resuming where the journal stopped.
    pub async fn configure(mut self) -> Result<Deployment<'s, C, Configured>> {
        let result = self.configure_steps().await;
        self.finish(result)?;

        self.sync(SyncPoint::Phase(Phase::Configure)).await?;
        Ok(self.advance())
    }

    async fn configure_steps(&mut self) -> Result<()> {
        let mut steps = ConfigurationStep::from_specs(&self.spec.configure)?;
        let pending = self.journal.first_pending_step();
        let start = self.options.from_step.unwrap_or(pending).max(1);

        if start > pending {
            tracing::warn!(
                from_step = start,
                first_pending = pending,
                "Skipping configuration steps that were never recorded as applied"
            );
        }
        if start <= steps.len() {
            tracing::info!(from_step = start, total = steps.len(), "Configuring");
        }

        for step in steps.iter_mut().filter(|s| s.index >= start) {
            if self.journal.step_done(step.index) {
                tracing::debug!(index = step.index, label = %step.label(), "Step already recorded, skipping");
                continue;
            }
            ParameterConfigurator::new(&mut self.ctx, &self.book)
                .apply(step)
                .await?;
            self.journal.mark_step(step.index);
            self.checkpoint()?;
        }
        Ok(())
    }
}

impl<'s, C: ChainClient> Deployment<'s, C, Configured> {
    /// Hand administrative control over to the final admin. This ends the run.
    pub async fn hand_over(mut self) -> Result<DeploymentReport> {
        let result = self.hand_over_units().await;
        let handover = self.finish(result)?;

        self.sync(SyncPoint::Phase(Phase::Handover)).await?;
        Ok(self.report(handover))
    }

    async fn hand_over_units(&mut self) -> Result<Option<HandoverReport>> {
        let Some(spec) = self.spec.handover.as_ref() else {
            tracing::info!("No handover configured, the deployer keeps its roles");
            return Ok(None);
        };
        if self.journal.handover_done {
            tracing::info!("Handover already done");
            return Ok(None);
        }

        let units: Vec<(String, Address)> = self
            .plan
            .units()
            .iter()
            .filter(|u| u.access_control)
            .filter_map(|u| Some((u.name.clone(), u.address?)))
            .collect();
        let sweep = spec
            .sweep
            .iter()
            .map(|name| {
                self.book
                    .resolve(name)
                    .map(|address| (name.clone(), address))
                    .ok_or_else(|| DeployError::UnresolvedReference {
                        unit: "handover".to_string(),
                        reference: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let report = RoleGrantManager::new(&mut self.ctx)
            .hand_over(spec, &units, &sweep)
            .await?;
        self.journal.handover_done = true;
        Ok(Some(report))
    }

    fn report(&self, handover: Option<HandoverReport>) -> DeploymentReport {
        let units = self
            .plan
            .units()
            .iter()
            .filter_map(|u| {
                Some(UnitRecord {
                    name: u.name.clone(),
                    kind: u.contract().unwrap_or("pair").to_string(),
                    address: u.address?,
                })
            })
            .collect();

        DeploymentReport {
            network: self.spec.network.name.clone(),
            chain_id: self.ctx.chain_id(),
            signer: self.ctx.signer(),
            units,
            transactions: self.ctx.transcript().len(),
            final_nonce: self.ctx.nonce(),
            verification: self.verification.clone(),
            handover,
            outdata: self.options.outdata.clone(),
        }
    }
}

