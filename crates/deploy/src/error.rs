//! Error types for deployment runs.
//!
//! Planning errors (`DependencyCycle`, `UnresolvedReference`, `DuplicateUnit`,
//! `InvalidCall`) are raised before any transaction is submitted. Everything
//! else is an execution-time error and aborts the run where it happens.

use std::time::Duration;

use alloy_core::primitives::{Address, B256};
use thiserror::Error;

/// Result type alias for deployment operations.
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

/// Main error type for a deployment run.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Dependency cycle detected among units: {}", units.join(", "))]
    DependencyCycle { units: Vec<String> },

    #[error("`{unit}` references `{reference}`, which is not a unit or a known address")]
    UnresolvedReference { unit: String, reference: String },

    #[error("Unit `{0}` is declared more than once")]
    DuplicateUnit(String),

    #[error("Invalid call `{signature}`: {reason}")]
    InvalidCall { signature: String, reason: String },

    #[error("Transaction `{label}` failed: {reason}")]
    DeploymentTransaction { label: String, reason: String },

    #[error("Transaction {tx_hash} was not confirmed within {waited:?}")]
    ConfirmationTimeout { tx_hash: B256, waited: Duration },

    #[error("Nonce mismatch for {signer}: expected {expected}, found {actual}")]
    NonceMismatch {
        signer: Address,
        expected: u64,
        actual: u64,
    },

    #[error("Granting {role} on `{target}` to {grantee} failed: {reason}")]
    RoleGrant {
        target: String,
        role: String,
        grantee: Address,
        reason: String,
    },

    #[error("Configuration step {index} (`{label}`) failed")]
    ConfigurationStep {
        /// 1-based position of the step in the declared list.
        index: usize,
        label: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Shorthand for a rejected or reverted transaction.
    pub fn transaction(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeploymentTransaction {
            label: label.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error happened before anything was sent to the network.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::DependencyCycle { .. }
                | Self::UnresolvedReference { .. }
                | Self::DuplicateUnit(_)
                | Self::InvalidCall { .. }
        )
    }
}
