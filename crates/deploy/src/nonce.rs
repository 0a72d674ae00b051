//! Keeping the signer's transaction count aligned across environments.
//!
//! When the primary environment performs an action out of band (say, a pair
//! created on another venue), its deployer nonce moves ahead of the shadow
//! environment's. Burning the same number of nonces on the shadow with
//! zero-value self-transfers keeps both transcripts comparable.

use alloy_core::primitives::{Bytes, U256};

use crate::chain::ChainClient;
use crate::error::{DeployError, Result};
use crate::network::NetworkContext;
use crate::spec::{Environment, NonceSkipSpec, SyncPoint};

/// Advances a signer's nonce without changing any meaningful state.
pub struct NonceSynchronizer<'a, C> {
    ctx: &'a mut NetworkContext<C>,
}

impl<'a, C: ChainClient> NonceSynchronizer<'a, C> {
    pub fn new(ctx: &'a mut NetworkContext<C>) -> Self {
        Self { ctx }
    }

    /// Advance the signer's nonce by exactly `count`.
    ///
    /// Each skip is a confirmed zero-value transfer from the signer to
    /// itself. Returns the new nonce.
    pub async fn advance(&mut self, count: u64, reason: &str) -> Result<u64> {
        let signer = self.ctx.signer();
        self.ctx.check_nonce().await?;
        let start = self.ctx.nonce();

        tracing::info!(%signer, start, count, reason, "Skipping nonces");
        for i in 0..count {
            let label = format!("nonce skip {}/{} ({})", i + 1, count, reason);
            self.ctx
                .submit(&label, Some(signer), Bytes::new(), U256::ZERO)
                .await?;
        }

        let expected = start + count;
        let actual = self.ctx.client().nonce(signer).await?;
        if actual != expected {
            return Err(DeployError::NonceMismatch {
                signer,
                expected,
                actual,
            });
        }

        Ok(actual)
    }

    /// Apply the skips attached to a point of the run.
    ///
    /// Skips only make sense on a shadow environment; on the primary they
    /// are logged and ignored. Returns the number of nonces burned.
    pub async fn apply<'s>(
        &mut self,
        point: &SyncPoint,
        skips: impl IntoIterator<Item = &'s NonceSkipSpec>,
    ) -> Result<u64> {
        let mut burned = 0;
        for skip in skips {
            if self.ctx.environment() != Environment::Shadow {
                tracing::info!(
                    %point,
                    count = skip.count,
                    reason = %skip.reason,
                    "Nonce skip not applied on the primary environment"
                );
                continue;
            }
            self.advance(skip.count, &skip.reason).await?;
            burned += skip.count;
        }
        Ok(burned)
    }

    /// Advance the signer's nonce until it matches the one on `primary`.
    ///
    /// Fails with [`DeployError::NonceMismatch`] when this environment is
    /// already ahead, since nonces cannot be given back.
    pub async fn align<P: ChainClient>(&mut self, primary: &P) -> Result<u64> {
        let signer = self.ctx.signer();
        let target = primary.nonce(signer).await?;
        let current = self.ctx.resync().await?;

        if current > target {
            return Err(DeployError::NonceMismatch {
                signer,
                expected: target,
                actual: current,
            });
        }
        if current == target {
            tracing::info!(%signer, nonce = current, "Nonces already aligned");
            return Ok(current);
        }

        self.advance(target - current, "align with primary").await
    }
}
