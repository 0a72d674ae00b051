//! The signer's view of the target network.
//!
//! [`NetworkContext`] is the only place transactions are sent from. It keeps
//! a mirror of the signer's nonce, checks it against the chain before every
//! submission, and waits for each transaction to be confirmed before
//! returning, so at most one transaction from the signer is ever in flight.

use alloy_core::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainClient, Receipt, TransactionRequest};
use crate::confirm::ConfirmationWaiter;
use crate::error::{DeployError, Result};
use crate::spec::{ConfirmationPolicy, Environment, NetworkConfig};

/// One confirmed transaction of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub label: String,
    pub nonce: u64,
    pub tx_hash: B256,
    pub block_number: u64,
    pub status: bool,
}

/// Chain identity, signer identity, mirrored nonce and confirmation policy.
#[derive(Debug)]
pub struct NetworkContext<C> {
    client: C,
    chain_id: u64,
    signer: Address,
    environment: Environment,
    nonce: u64,
    policy: ConfirmationPolicy,
    transcript: Vec<TranscriptEntry>,
}

impl<C: ChainClient> NetworkContext<C> {
    /// Connect to the network, checking the chain ID and reading the signer's nonce.
    pub async fn connect(client: C, network: &NetworkConfig) -> Result<Self> {
        let chain_id = client.chain_id().await?;
        if chain_id != network.chain_id {
            return Err(anyhow::anyhow!(
                "Connected to chain {} but the deployment targets `{}` (chain {})",
                chain_id,
                network.name,
                network.chain_id
            )
            .into());
        }

        let nonce = client.nonce(network.deployer).await?;
        tracing::info!(
            network = %network.name,
            chain_id,
            signer = %network.deployer,
            nonce,
            environment = %network.environment,
            "Connected"
        );

        Ok(Self {
            client,
            chain_id,
            signer: network.deployer,
            environment: network.environment,
            nonce,
            policy: network.confirmation.clone(),
            transcript: Vec::new(),
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn signer(&self) -> Address {
        self.signer
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// The next nonce the signer will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    /// Fail unless the chain agrees with the mirrored nonce.
    pub async fn check_nonce(&self) -> Result<()> {
        let actual = self.client.nonce(self.signer).await?;
        if actual != self.nonce {
            return Err(DeployError::NonceMismatch {
                signer: self.signer,
                expected: self.nonce,
                actual,
            });
        }
        Ok(())
    }

    /// Re-read the nonce from the chain, after nonces were consumed elsewhere.
    pub async fn resync(&mut self) -> Result<u64> {
        self.nonce = self.client.nonce(self.signer).await?;
        Ok(self.nonce)
    }

    /// Sign, send and confirm a transaction.
    ///
    /// A transaction the node rejects, or one that reverts, is reported as
    /// [`DeployError::DeploymentTransaction`] under `label`.
    pub async fn submit(
        &mut self,
        label: &str,
        to: Option<Address>,
        data: Bytes,
        value: U256,
    ) -> Result<Receipt> {
        self.check_nonce().await?;

        let tx = TransactionRequest {
            from: self.signer,
            to,
            data,
            value,
            nonce: self.nonce,
        };
        let tx_hash = self
            .client
            .send_transaction(&tx)
            .await
            .map_err(|e| DeployError::transaction(label, format!("{:#}", e)))?;
        tracing::info!(label, nonce = tx.nonce, %tx_hash, "Transaction submitted");

        // The node accepted the transaction, so the nonce is consumed even if it reverts.
        self.nonce += 1;

        let receipt = ConfirmationWaiter::new(&self.client, &self.policy)
            .wait(tx_hash)
            .await?;

        self.transcript.push(TranscriptEntry {
            label: label.to_string(),
            nonce: tx.nonce,
            tx_hash,
            block_number: receipt.block_number,
            status: receipt.status,
        });

        if !receipt.status {
            return Err(DeployError::transaction(
                label,
                format!("reverted in block {}", receipt.block_number),
            ));
        }

        Ok(receipt)
    }

    /// Create a contract and return its address.
    pub async fn deploy(&mut self, label: &str, creation_code: Bytes) -> Result<Address> {
        let receipt = self.submit(label, None, creation_code, U256::ZERO).await?;
        receipt.contract_address.ok_or_else(|| {
            DeployError::transaction(label, "receipt carries no contract address")
        })
    }

    /// Read-only call against the latest state.
    pub async fn call(&self, to: Address, data: &Bytes) -> Result<Bytes> {
        Ok(self.client.call(to, data).await?)
    }

    /// Latest block timestamp.
    pub async fn block_timestamp(&self) -> Result<u64> {
        Ok(self.client.block_timestamp().await?)
    }

    /// Optional pause for nodes whose state lags behind receipts.
    pub async fn settle(&self) {
        let delay = self.policy.settle_delay();
        if !delay.is_zero() {
            tracing::debug!(?delay, "Settling");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::SimulatedChain;

    pub(crate) fn test_network(chain_id: u64, deployer: Address) -> NetworkConfig {
        NetworkConfig {
            name: "simulated".to_string(),
            chain_id,
            rpc_url: "http://localhost:8545".parse().unwrap(),
            deployer,
            environment: Environment::Primary,
            confirmation: ConfirmationPolicy {
                confirmations: 1,
                poll_min_ms: 1,
                poll_max_ms: 5,
                timeout_secs: 1,
                settle_delay_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_chain() {
        let chain = SimulatedChain::new(1);
        let network = test_network(4, Address::repeat_byte(1));
        assert!(NetworkContext::connect(chain, &network).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_advances_nonce_and_records_transcript() {
        let signer = Address::repeat_byte(1);
        let chain = SimulatedChain::new(1);
        let mut ctx = NetworkContext::connect(chain.clone(), &test_network(1, signer))
            .await
            .unwrap();

        let address = ctx.deploy("dei", Bytes::from_static(&[1, 2, 3])).await.unwrap();
        assert_eq!(chain.creation_code(address).unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(ctx.nonce(), 1);
        assert_eq!(ctx.transcript().len(), 1);
        assert_eq!(ctx.transcript()[0].label, "dei");
        assert_eq!(ctx.transcript()[0].nonce, 0);
    }

    #[tokio::test]
    async fn test_submit_detects_foreign_transactions() {
        let signer = Address::repeat_byte(1);
        let chain = SimulatedChain::new(1);
        let mut ctx = NetworkContext::connect(chain.clone(), &test_network(1, signer))
            .await
            .unwrap();

        chain.set_nonce(signer, 3);
        let err = ctx
            .submit("noop", Some(signer), Bytes::new(), U256::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::NonceMismatch { expected: 0, actual: 3, .. }
        ));

        assert_eq!(ctx.resync().await.unwrap(), 3);
        ctx.submit("noop", Some(signer), Bytes::new(), U256::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reverted_transaction_is_an_error() {
        let signer = Address::repeat_byte(1);
        let chain = SimulatedChain::new(1);
        let mut ctx = NetworkContext::connect(chain.clone(), &test_network(1, signer))
            .await
            .unwrap();
        let token = ctx.deploy("token", Bytes::new()).await.unwrap();
        chain.revert_on(token, "setOracle(address)");

        let data = crate::abi::encode_call(
            "setOracle(address)",
            &[crate::abi::AbiValue::Address(signer)],
        );
        let err = ctx
            .submit("token.setOracle", Some(token), data, U256::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::DeploymentTransaction { ref label, .. } if label == "token.setOracle"));
        assert_eq!(ctx.nonce(), 2);
        assert!(!ctx.transcript()[1].status);
    }
}
