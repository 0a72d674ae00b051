//! Source verification trigger.
//!
//! Once every unit is deployed, a manifest of what to verify is written to
//! `verification.json`. If a verification command is configured it is run
//! once per contract. A failed verification does not fail the run.

use std::path::Path;

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::abi::{self, AbiValue};
use crate::plan::{AddressBook, DeploymentPlan, UnitTemplate};

/// Name of the verification manifest inside the output directory.
pub const MANIFEST_FILENAME: &str = "verification.json";

/// Command entry replaced by one entry per constructor argument.
pub const SPREAD_ARGS: &str = "{args...}";

/// One contract to verify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub unit: String,
    pub contract: String,
    pub address: Address,
    /// ABI-encoded constructor arguments, hex without `0x`.
    pub constructor_args: String,
    /// Constructor arguments in the form verification tools take on the command line.
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl VerificationRequest {
    /// Requests for every deployed contract unit that asks for verification.
    pub fn for_plan(plan: &DeploymentPlan, book: &AddressBook) -> crate::Result<Vec<Self>> {
        let mut requests = Vec::new();
        for unit in plan.units().iter().filter(|u| u.verify) {
            let (UnitTemplate::Contract { contract, args }, Some(address)) =
                (&unit.template, unit.address)
            else {
                continue;
            };

            let values = args
                .iter()
                .map(|a| a.resolve(book, &unit.name))
                .collect::<crate::Result<Vec<_>>>()?;

            requests.push(Self {
                unit: unit.name.clone(),
                contract: contract.clone(),
                address,
                constructor_args: hex::encode(abi::encode(&values)),
                arguments: values.iter().map(command_argument).collect(),
            });
        }
        Ok(requests)
    }
}

fn command_argument(value: &AbiValue) -> String {
    match value {
        AbiValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Outcome of the verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub requested: usize,
    pub verified: usize,
    pub failed: Vec<String>,
}

/// Runs the configured verification command.
pub struct Verifier<'a> {
    network: &'a str,
    command: Option<&'a [String]>,
}

impl<'a> Verifier<'a> {
    pub fn new(network: &'a str, command: Option<&'a [String]>) -> Self {
        Self { network, command }
    }

    /// Write the manifest and run the command for every request.
    pub async fn run(
        &self,
        requests: &[VerificationRequest],
        outdata: &Path,
    ) -> Result<VerificationSummary> {
        let path = outdata.join(MANIFEST_FILENAME);
        let content = serde_json::to_string_pretty(requests)
            .context("Failed to serialize verification manifest")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), contracts = requests.len(), "Verification manifest written");

        let mut summary = VerificationSummary {
            requested: requests.len(),
            ..Default::default()
        };

        let Some(command) = self.command.filter(|c| !c.is_empty()) else {
            return Ok(summary);
        };

        for request in requests {
            match self.verify_one(command, request).await {
                Ok(()) => {
                    tracing::info!(unit = %request.unit, address = %request.address, "Source verified");
                    summary.verified += 1;
                }
                Err(e) => {
                    tracing::warn!(unit = %request.unit, address = %request.address, error = %format!("{:#}", e), "Verification failed");
                    summary.failed.push(request.unit.clone());
                }
            }
        }

        Ok(summary)
    }

    async fn verify_one(&self, command: &[String], request: &VerificationRequest) -> Result<()> {
        let argv = self.render(command, request);
        let Some((program, rest)) = argv.split_first() else {
            anyhow::bail!("Verification command is empty");
        };
        let output = tokio::process::Command::new(program)
            .args(rest)
            .output()
            .await
            .with_context(|| format!("Failed to run `{}`", program))?;

        if !output.status.success() {
            anyhow::bail!(
                "`{}` exited with {}: {}",
                argv.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Substitute `{network}`, `{contract}`, `{address}` and `{args}`, and
    /// expand a `{args...}` entry into the separate constructor arguments.
    fn render(&self, command: &[String], request: &VerificationRequest) -> Vec<String> {
        let mut argv = Vec::with_capacity(command.len() + request.arguments.len());
        for part in command {
            if part == SPREAD_ARGS {
                argv.extend(request.arguments.iter().cloned());
                continue;
            }
            argv.push(
                part.replace("{network}", self.network)
                    .replace("{contract}", &request.contract)
                    .replace("{address}", &request.address.to_string())
                    .replace("{args}", &request.constructor_args),
            );
        }
        argv
    }
}
