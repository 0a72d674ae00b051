//! Access to the target network.
//!
//! Everything a deployment run needs from a node goes through [`ChainClient`]:
//! reading the signer's nonce, submitting transactions, polling for receipts
//! and issuing read-only calls. [`JsonRpcClient`] talks to a real endpoint,
//! [`SimulatedChain`] executes a small model of the contracts in memory for
//! dry runs and tests.

mod rpc;
mod simulated;

use std::future::Future;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use rpc::JsonRpcClient;
pub use simulated::{SimulatedChain, DEFAULT_GENESIS_SUPPLY};

/// A transaction ready to be submitted.
///
/// The nonce is always explicit: the sender never lets the node pick one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub nonce: u64,
}

impl TransactionRequest {
    pub fn is_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Outcome of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_number: u64,
    /// `false` when the transaction reverted.
    pub status: bool,
    /// Address of the created contract, for creation transactions.
    pub contract_address: Option<Address>,
}

/// Minimal view of an EVM node.
pub trait ChainClient: Send + Sync {
    /// Chain ID reported by the node.
    fn chain_id(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Number of transactions sent from `address` that are included in the latest block.
    fn nonce(&self, address: Address) -> impl Future<Output = Result<u64>> + Send;

    /// Submit a transaction; returns its hash once the node accepted it.
    fn send_transaction(
        &self,
        tx: &TransactionRequest,
    ) -> impl Future<Output = Result<B256>> + Send;

    /// Receipt of a transaction, or `None` while it is still pending.
    fn receipt(&self, tx_hash: B256) -> impl Future<Output = Result<Option<Receipt>>> + Send;

    /// Latest block number.
    fn block_number(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Timestamp of the latest block.
    fn block_timestamp(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Execute a read-only call against the latest state.
    fn call(&self, to: Address, data: &Bytes) -> impl Future<Output = Result<Bytes>> + Send;
}
