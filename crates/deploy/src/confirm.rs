//! Waiting for transactions to become final.

use alloy_core::primitives::B256;
use backon::{ExponentialBuilder, Retryable};

use crate::chain::{ChainClient, Receipt};
use crate::error::{DeployError, Result};
use crate::spec::ConfirmationPolicy;

/// Polls a node until a transaction has the required number of confirmations.
///
/// Polling backs off exponentially between `poll_min` and `poll_max`. RPC
/// failures while polling are retried like a missing receipt. The whole wait
/// is bounded by the policy's timeout, after which
/// [`DeployError::ConfirmationTimeout`] is returned.
pub struct ConfirmationWaiter<'a, C> {
    client: &'a C,
    policy: &'a ConfirmationPolicy,
}

impl<'a, C: ChainClient> ConfirmationWaiter<'a, C> {
    pub fn new(client: &'a C, policy: &'a ConfirmationPolicy) -> Self {
        Self { client, policy }
    }

    /// Wait until `tx_hash` is included and confirmed.
    ///
    /// Returns the receipt whatever its status; deciding what a revert means
    /// is up to the caller.
    pub async fn wait(&self, tx_hash: B256) -> Result<Receipt> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.policy.poll_min())
            .with_max_delay(self.policy.poll_max())
            .without_max_times();

        let poll = || async { self.poll(tx_hash).await };
        let waiting = poll.retry(backoff).notify(|err, delay| {
            tracing::trace!(%tx_hash, error = %err, ?delay, "Transaction not final yet");
        });

        match tokio::time::timeout(self.policy.timeout(), waiting).await {
            Ok(Ok(receipt)) => {
                tracing::debug!(
                    %tx_hash,
                    block = receipt.block_number,
                    status = receipt.status,
                    "Transaction confirmed"
                );
                Ok(receipt)
            }
            Ok(Err(err)) => Err(DeployError::Other(err)),
            Err(_) => Err(DeployError::ConfirmationTimeout {
                tx_hash,
                waited: self.policy.timeout(),
            }),
        }
    }

    async fn poll(&self, tx_hash: B256) -> anyhow::Result<Receipt> {
        let receipt = self
            .client
            .receipt(tx_hash)
            .await?
            .ok_or_else(|| anyhow::anyhow!("receipt not available"))?;

        let required = self.policy.confirmations.max(1);
        if required > 1 {
            let head = self.client.block_number().await?;
            let confirmations = head.saturating_sub(receipt.block_number) + 1;
            if confirmations < required {
                anyhow::bail!("{} of {} confirmations", confirmations, required);
            }
        }

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{SimulatedChain, TransactionRequest};
    use alloy_core::primitives::{Address, Bytes, U256};

    fn fast_policy() -> ConfirmationPolicy {
        ConfirmationPolicy {
            confirmations: 1,
            poll_min_ms: 1,
            poll_max_ms: 5,
            timeout_secs: 1,
            settle_delay_ms: 0,
        }
    }

    async fn send_creation(chain: &SimulatedChain, from: Address) -> B256 {
        let tx = TransactionRequest {
            from,
            to: None,
            data: Bytes::new(),
            value: U256::ZERO,
            nonce: chain.account_nonce(from),
        };
        chain.send_transaction(&tx).await.unwrap()
    }

    #[tokio::test]
    async fn test_wait_returns_receipt() {
        let chain = SimulatedChain::new(1);
        let hash = send_creation(&chain, Address::repeat_byte(1)).await;

        let policy = fast_policy();
        let receipt = ConfirmationWaiter::new(&chain, &policy).wait(hash).await.unwrap();
        assert_eq!(receipt.tx_hash, hash);
        assert!(receipt.status);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_receipt() {
        let chain = SimulatedChain::new(1);
        chain.withhold_receipts(true);
        let hash = send_creation(&chain, Address::repeat_byte(1)).await;

        let policy = fast_policy();
        let err = ConfirmationWaiter::new(&chain, &policy)
            .wait(hash)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ConfirmationTimeout { tx_hash, .. } if tx_hash == hash));
    }

    #[tokio::test]
    async fn test_wait_for_extra_confirmations() {
        let chain = SimulatedChain::new(1);
        let from = Address::repeat_byte(1);
        let hash = send_creation(&chain, from).await;

        let policy = ConfirmationPolicy {
            confirmations: 3,
            ..fast_policy()
        };

        let producer = chain.clone();
        let blocks = tokio::spawn(async move {
            for _ in 0..2 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                send_creation(&producer, Address::repeat_byte(2)).await;
            }
        });

        let receipt = ConfirmationWaiter::new(&chain, &policy).wait(hash).await.unwrap();
        blocks.await.unwrap();
        assert_eq!(receipt.block_number, 1);
        assert!(chain.block_number().await.unwrap() >= 3);
    }
}
