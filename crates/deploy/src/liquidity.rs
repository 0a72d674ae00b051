//! Seeding AMM pairs with initial liquidity.

use alloy_core::primitives::{Address, B256, U256};
use backon::{ExponentialBuilder, Retryable};

use crate::abi::{self, AbiValue, encode_call};
use crate::chain::ChainClient;
use crate::error::{DeployError, Result};
use crate::network::NetworkContext;
use crate::plan::AddressBook;
use crate::spec::PairSpec;

/// Everything needed to create and seed one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairBootstrapRequest {
    pub token_a: Address,
    pub token_b: Address,
    pub amount_a: U256,
    pub amount_b: U256,
    pub min_a: U256,
    pub min_b: U256,
    /// Unix timestamp after which the router must refuse the call.
    pub deadline: u64,
    /// Receiver of the LP tokens.
    pub recipient: Address,
    /// Wrap native currency into `token_a` / `token_b` before seeding.
    pub wrap_a: bool,
    pub wrap_b: bool,
}

impl PairBootstrapRequest {
    /// Resolve a pair declaration against deployed addresses.
    ///
    /// Relative deadlines are counted from `latest_timestamp`. Minimums
    /// default to the seed amounts.
    pub fn resolve(
        name: &str,
        spec: &PairSpec,
        book: &AddressBook,
        latest_timestamp: u64,
    ) -> Result<Self> {
        let token = |token: &str| {
            book.resolve(token)
                .ok_or_else(|| DeployError::UnresolvedReference {
                    unit: name.to_string(),
                    reference: token.to_string(),
                })
        };

        let recipient = match &spec.recipient {
            Some(arg) => match arg.resolve(book, name)? {
                AbiValue::Address(address) => address,
                other => {
                    return Err(DeployError::InvalidCall {
                        signature: format!("{}.recipient", name),
                        reason: format!("expected an address, got {}", other),
                    });
                }
            },
            None => book.deployer(),
        };

        Ok(Self {
            token_a: token(&spec.token_a.token)?,
            token_b: token(&spec.token_b.token)?,
            amount_a: spec.token_a.amount.0,
            amount_b: spec.token_b.amount.0,
            min_a: spec.token_a.min.unwrap_or(spec.token_a.amount).0,
            min_b: spec.token_b.min.unwrap_or(spec.token_b.amount).0,
            deadline: spec.deadline.resolve(latest_timestamp),
            recipient,
            wrap_a: spec.token_a.wrap_native,
            wrap_b: spec.token_b.wrap_native,
        })
    }
}

/// Creates pairs through a Uniswap V2 style router.
///
/// Every sub-step is a separate transaction from the signer and is confirmed
/// before the next one is sent: optional wrapping, one approval per token,
/// then `addLiquidity`. The approvals must also be visible through
/// `allowance` before the router is called.
pub struct LiquidityBootstrapper<'a, C> {
    ctx: &'a mut NetworkContext<C>,
    router: Address,
    factory: Option<Address>,
}

impl<'a, C: ChainClient> LiquidityBootstrapper<'a, C> {
    /// `factory` is looked up through `router.factory()` when not given.
    pub fn new(ctx: &'a mut NetworkContext<C>, router: Address, factory: Option<Address>) -> Self {
        Self {
            ctx,
            router,
            factory,
        }
    }

    /// Create and seed the pair, returning its address.
    pub async fn bootstrap(&mut self, name: &str, request: &PairBootstrapRequest) -> Result<Address> {
        let funder = self.ctx.signer();

        for (token, amount, wrap) in [
            (request.token_a, request.amount_a, request.wrap_a),
            (request.token_b, request.amount_b, request.wrap_b),
        ] {
            if wrap {
                let label = format!("{}: wrap native into {}", name, token);
                self.ctx
                    .submit(&label, Some(token), encode_call("deposit()", &[]), amount)
                    .await?;
            }
        }

        let mut approvals = Vec::with_capacity(2);
        for (token, amount) in [
            (request.token_a, request.amount_a),
            (request.token_b, request.amount_b),
        ] {
            let label = format!("{}: approve {}", name, token);
            let data = encode_call(
                "approve(address,uint256)",
                &[AbiValue::Address(self.router), AbiValue::Uint(amount)],
            );
            let receipt = self.ctx.submit(&label, Some(token), data, U256::ZERO).await?;
            approvals.push((token, amount, receipt.tx_hash));
        }

        for (token, amount, tx_hash) in approvals {
            self.await_allowance(token, funder, amount, tx_hash).await?;
        }
        self.ctx.settle().await;

        let label = format!("{}: addLiquidity", name);
        let data = encode_call(
            "addLiquidity(address,address,uint256,uint256,uint256,uint256,address,uint256)",
            &[
                AbiValue::Address(request.token_a),
                AbiValue::Address(request.token_b),
                AbiValue::Uint(request.amount_a),
                AbiValue::Uint(request.amount_b),
                AbiValue::Uint(request.min_a),
                AbiValue::Uint(request.min_b),
                AbiValue::Address(request.recipient),
                AbiValue::Uint(U256::from(request.deadline)),
            ],
        );
        self.ctx
            .submit(&label, Some(self.router), data, U256::ZERO)
            .await?;
        self.ctx.settle().await;

        let pair = self.pair_address(request.token_a, request.token_b).await?;
        if pair.is_zero() {
            return Err(DeployError::transaction(
                label,
                "factory reports no pair after seeding",
            ));
        }

        tracing::info!(pair = %name, address = %pair, "Pair created");
        Ok(pair)
    }

    /// Pair address as reported by the factory; zero when no pair exists.
    pub async fn pair_address(&self, token_a: Address, token_b: Address) -> Result<Address> {
        let factory = self.factory().await?;
        let data = encode_call(
            "getPair(address,address)",
            &[AbiValue::Address(token_a), AbiValue::Address(token_b)],
        );
        let output = self.ctx.call(factory, &data).await?;
        Ok(abi::decode_address(&output)?)
    }

    async fn factory(&self) -> Result<Address> {
        if let Some(factory) = self.factory {
            return Ok(factory);
        }
        let output = self
            .ctx
            .call(self.router, &encode_call("factory()", &[]))
            .await?;
        Ok(abi::decode_address(&output)?)
    }

    /// Poll `allowance(owner, router)` until it covers `required`.
    async fn await_allowance(
        &self,
        token: Address,
        owner: Address,
        required: U256,
        approval: B256,
    ) -> Result<()> {
        let policy = self.ctx.policy();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(policy.poll_min())
            .with_max_delay(policy.poll_max())
            .without_max_times();
        let data = encode_call(
            "allowance(address,address)",
            &[AbiValue::Address(owner), AbiValue::Address(self.router)],
        );

        let check = || async {
            let output = self.ctx.call(token, &data).await?;
            let allowance = abi::decode_uint(&output)?;
            if allowance < required {
                anyhow::bail!("allowance {} below {}", allowance, required);
            }
            Ok(())
        };
        let polling = check.retry(backoff).notify(|err, delay| {
            tracing::trace!(%token, error = %err, ?delay, "Approval not visible yet");
        });

        match tokio::time::timeout(policy.timeout(), polling).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeployError::ConfirmationTimeout {
                tx_hash: approval,
                waited: policy.timeout(),
            }),
        }
    }
}
