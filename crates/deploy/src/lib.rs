//! deistack-deploy - Deployment orchestration for the DEI protocol stack.
//!
//! This crate plans, deploys, configures and hands over a set of dependent
//! contracts and AMM liquidity pairs on an EVM network, one confirmed
//! transaction at a time.

pub mod abi;
pub mod artifacts;
pub mod chain;
pub mod confirm;
pub mod configure;
pub mod deployment;
pub mod journal;
pub mod liquidity;
pub mod network;
pub mod nonce;
pub mod plan;
pub mod roles;
pub mod spec;
pub mod verify;

mod error;
pub use error::{DeployError, Result};

pub use artifacts::ArtifactStore;
pub use chain::{ChainClient, JsonRpcClient, SimulatedChain};
pub use deployment::{
    Configured, Deployed, Deployment, DeploymentReport, Planned, RunOptions, UnitRecord, run,
};
pub use journal::RunJournal;
pub use network::NetworkContext;
pub use plan::{AddressBook, DeploymentPlan, Planner};
pub use spec::{DEFAULT_CONFIG_FILENAME, DeploymentSpec};
