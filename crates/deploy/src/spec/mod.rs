//! Immutable description of a deployment.
//!
//! A [`DeploymentSpec`] is read once (usually from TOML) and then passed by
//! reference to every component of a run. Nothing in the crate reads
//! deployment settings from anywhere else.

mod args;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

pub use args::{Amount, ArgSpec};

/// The default name for a deployment file.
pub const DEFAULT_CONFIG_FILENAME: &str = "deistack.toml";

/// Complete description of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Target network and signer.
    pub network: NetworkConfig,
    /// Pre-existing contracts (collateral tokens, AMM router, wrapped native token...).
    #[serde(default)]
    pub addresses: BTreeMap<String, Address>,
    /// AMM used to bootstrap liquidity. Required when any pair unit is declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amm: Option<AmmConfig>,
    /// Contracts and pairs to bring up, in declaration order.
    #[serde(default)]
    pub units: Vec<UnitSpec>,
    /// Post-deployment configuration calls, applied in order.
    #[serde(default)]
    pub configure: Vec<StepSpec>,
    /// Nonce skips keeping a shadow environment aligned with the primary.
    #[serde(default)]
    pub sync: Vec<NonceSkipSpec>,
    /// Final transfer of administrative control.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<HandoverSpec>,
    /// Source verification trigger.
    #[serde(default)]
    pub verify: VerifyConfig,
}

/// Target network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Human-readable network name, used in logs and by the verifier.
    pub name: String,
    /// Expected chain ID. The run refuses to start against another chain.
    pub chain_id: u64,
    /// JSON-RPC endpoint.
    pub rpc_url: Url,
    /// The single signer every transaction is sent from.
    pub deployer: Address,
    /// Whether this network performs out-of-band actions itself or mirrors one that does.
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub confirmation: ConfirmationPolicy,
}

/// Role of a network in a multi-environment deployment.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Environment {
    /// Out-of-band actions happen here; nonce skips are not applied.
    #[default]
    Primary,
    /// Mirrors a primary; nonce skips are applied to keep transaction counts aligned.
    Shadow,
}

/// How long and how often to wait for transactions to become final.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationPolicy {
    /// Number of blocks (including the inclusion block) before a transaction counts as final.
    pub confirmations: u64,
    /// First polling interval, in milliseconds. Doubles up to `poll_max_ms`.
    pub poll_min_ms: u64,
    /// Upper bound of the polling interval, in milliseconds.
    pub poll_max_ms: u64,
    /// Give up waiting for a single transaction after this many seconds.
    pub timeout_secs: u64,
    /// Extra pause after liquidity sub-steps, for nodes whose state lags behind receipts.
    pub settle_delay_ms: u64,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            confirmations: 1,
            poll_min_ms: 500,
            poll_max_ms: 10_000,
            timeout_secs: 300,
            settle_delay_ms: 0,
        }
    }
}

impl ConfirmationPolicy {
    pub fn poll_min(&self) -> Duration {
        Duration::from_millis(self.poll_min_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_min_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// AMM router/factory pair used by the liquidity bootstrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmmConfig {
    /// Name of the router in `[addresses]`.
    pub router: String,
    /// Name of the factory in `[addresses]`. Looked up through `router.factory()` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<String>,
}

/// A deployment unit as declared in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Logical name, unique across units and `[addresses]`.
    pub name: String,
    #[serde(flatten)]
    pub kind: UnitKind,
    /// Extra ordering constraints on top of the references found in arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Whether the unit exposes role-based access control and takes part in the handover.
    #[serde(default)]
    pub access_control: bool,
    /// Whether the unit is submitted for source verification.
    #[serde(default = "default_true")]
    pub verify: bool,
}

fn default_true() -> bool {
    true
}

/// What a unit instantiates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// A contract created from an artifact.
    Contract {
        /// Artifact (contract) name.
        contract: String,
        /// Constructor arguments.
        #[serde(default)]
        args: Vec<ArgSpec>,
    },
    /// A liquidity pair created through the AMM router.
    Pair(PairSpec),
}

/// Liquidity seeding for a pair unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSpec {
    pub token_a: PairLeg,
    pub token_b: PairLeg,
    #[serde(default)]
    pub deadline: DeadlineSpec,
    /// Receiver of the LP tokens. Defaults to the deployer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ArgSpec>,
}

/// One side of a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairLeg {
    /// Token name (unit or `[addresses]` entry).
    pub token: String,
    /// Seed amount.
    pub amount: Amount,
    /// Slippage bound. Defaults to the seed amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Amount>,
    /// Wrap `amount` of native currency into the token (`deposit()`) before seeding.
    #[serde(default)]
    pub wrap_native: bool,
}

/// Deadline passed to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineSpec {
    /// Seconds after the latest block's timestamp.
    InSeconds(u64),
    /// Absolute unix timestamp.
    At(u64),
}

impl Default for DeadlineSpec {
    fn default() -> Self {
        Self::InSeconds(600)
    }
}

impl DeadlineSpec {
    /// Resolve against the latest block timestamp.
    pub fn resolve(&self, latest_timestamp: u64) -> u64 {
        match self {
            Self::InSeconds(secs) => latest_timestamp.saturating_add(*secs),
            Self::At(ts) => *ts,
        }
    }
}

/// Whether a configuration step may be applied more than once.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Idempotency {
    /// Setting an absolute value; re-applying is harmless.
    #[default]
    Repeatable,
    /// Must take effect exactly once; an already-applied step counts as success.
    Once,
}

/// A configuration call as declared in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unit or `[addresses]` entry the call is sent to.
    pub target: String,
    /// Function signature, e.g. `setPriceBands(uint256,uint256)`.
    pub call: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// Native value sent with the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Amount>,
    #[serde(default)]
    pub idempotency: Idempotency,
    /// View call on the target returning `true` once the step has taken effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<ViewCheck>,
}

/// A read-only call answering "has this already been applied?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewCheck {
    pub call: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
}

/// Nonce skip attached to a point of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceSkipSpec {
    pub after: SyncPoint,
    pub count: u64,
    pub reason: String,
}

/// Where in a run a nonce skip happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPoint {
    /// Right after the named unit is deployed.
    Unit(String),
    /// Right after a phase completes.
    Phase(Phase),
}

impl std::fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit(name) => write!(f, "unit:{}", name),
            Self::Phase(phase) => write!(f, "phase:{}", phase),
        }
    }
}

/// The phases of a run, in execution order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Deploy,
    Configure,
    Handover,
}

/// Final transfer of administrative control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverSpec {
    /// Identity receiving `DEFAULT_ADMIN_ROLE` on every access-controlled unit.
    pub admin: Address,
    /// Renounce the deployer's own admin role once the grants are done.
    #[serde(default)]
    pub revoke_deployer: bool,
    /// Tokens whose whole deployer balance is transferred to `admin`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sweep: Vec<String>,
}

/// Source verification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Command run once per verifiable unit. `{network}`, `{contract}`,
    /// `{address}` and `{args}` (ABI-encoded hex) are substituted; an entry
    /// that is exactly `{args...}` becomes one entry per constructor argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl DeploymentSpec {
    /// Load a deployment from a TOML file, or from `deistack.toml` inside a directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Deployment file or directory not found: {}",
                path.display()
            );
        }

        let config_path = if path.is_dir() {
            path.join(DEFAULT_CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read deployment from {}", config_path.display()))?;
        let spec: Self =
            toml::from_str(&content).context("Failed to parse deployment file as TOML")?;
        tracing::info!(path = %config_path.display(), "Deployment loaded");
        Ok(spec)
    }

    /// Save the deployment to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deployment to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write deployment to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Deployment saved");
        Ok(())
    }

    /// Look up a unit by name.
    pub fn unit(&self, name: &str) -> Option<&UnitSpec> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Nonce skips attached to a given point.
    pub fn skips_after<'a>(
        &'a self,
        point: &'a SyncPoint,
    ) -> impl Iterator<Item = &'a NonceSkipSpec> + 'a {
        self.sync.iter().filter(move |s| &s.after == point)
    }

    /// SHA-256 of everything that determines what ends up on chain.
    ///
    /// The RPC endpoint, confirmation timing and verification settings are
    /// excluded: changing them does not change the deployment.
    pub fn config_hash(&self) -> String {
        #[derive(Serialize)]
        struct Fingerprint<'a> {
            chain_id: u64,
            deployer: Address,
            environment: Environment,
            addresses: &'a BTreeMap<String, Address>,
            amm: &'a Option<AmmConfig>,
            units: &'a [UnitSpec],
            configure: &'a [StepSpec],
            sync: &'a [NonceSkipSpec],
            handover: &'a Option<HandoverSpec>,
        }

        let fingerprint = Fingerprint {
            chain_id: self.network.chain_id,
            deployer: self.network.deployer,
            environment: self.network.environment,
            addresses: &self.addresses,
            amm: &self.amm,
            units: &self.units,
            configure: &self.configure,
            sync: &self.sync,
            handover: &self.handover,
        };

        let mut hasher = Sha256::new();
        // Serializing plain data to JSON cannot fail; an empty input still hashes deterministically.
        hasher.update(serde_json::to_vec(&fingerprint).unwrap_or_default());
        hex::encode(hasher.finalize())
    }
}
