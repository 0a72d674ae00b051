//! Post-deployment configuration calls.

use alloy_core::primitives::{Address, Bytes, U256};

use crate::abi::{self, AbiValue, FunctionSignature};
use crate::chain::ChainClient;
use crate::error::{DeployError, Result};
use crate::network::NetworkContext;
use crate::plan::AddressBook;
use crate::spec::{ArgSpec, Idempotency, StepSpec};

pub(crate) const GRANT_ROLE: &str = "grantRole(bytes32,address)";
const HAS_ROLE: &str = "hasRole(bytes32,address)";

/// Lifecycle of a configuration step.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StepState {
    Pending,
    Submitted,
    Confirmed,
    /// A once-only step found to be in effect already; nothing was sent.
    AlreadyApplied,
    Failed { reason: String },
}

/// A configuration call ready to be applied.
#[derive(Debug, Clone)]
pub struct ConfigurationStep {
    /// 1-based position in the declared list.
    pub index: usize,
    pub target: String,
    pub signature: FunctionSignature,
    pub args: Vec<ArgSpec>,
    pub value: U256,
    pub idempotency: Idempotency,
    /// View returning `true` once the step is in effect.
    pub check: Option<(FunctionSignature, Vec<ArgSpec>)>,
    pub state: StepState,
}

impl ConfigurationStep {
    pub fn from_spec(index: usize, spec: &StepSpec) -> Result<Self> {
        let check = spec
            .check
            .as_ref()
            .map(|c| FunctionSignature::parse(&c.call).map(|sig| (sig, c.args.clone())))
            .transpose()?;

        Ok(Self {
            index,
            target: spec.target.clone(),
            signature: FunctionSignature::parse(&spec.call)?,
            args: spec.args.clone(),
            value: spec.value.map(|v| v.0).unwrap_or_default(),
            idempotency: spec.idempotency,
            check,
            state: StepState::Pending,
        })
    }

    /// Build every step of a deployment, numbered from 1.
    pub fn from_specs(specs: &[StepSpec]) -> Result<Vec<Self>> {
        specs
            .iter()
            .enumerate()
            .map(|(i, spec)| Self::from_spec(i + 1, spec))
            .collect()
    }

    /// `target.signature`, as used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}.{}", self.target, self.signature)
    }

    fn is_grant_role(&self) -> bool {
        self.signature.to_string() == GRANT_ROLE
    }

    /// Whether the step can tell that it has already been applied.
    pub fn is_detectable(&self) -> bool {
        self.check.is_some() || self.is_grant_role()
    }
}

/// Applies configuration steps in order, one confirmed transaction each.
///
/// Nothing is rolled back when a step fails: the error carries the step's
/// index and every earlier step stays applied.
pub struct ParameterConfigurator<'a, C> {
    ctx: &'a mut NetworkContext<C>,
    book: &'a AddressBook,
}

impl<'a, C: ChainClient> ParameterConfigurator<'a, C> {
    pub fn new(ctx: &'a mut NetworkContext<C>, book: &'a AddressBook) -> Self {
        Self { ctx, book }
    }

    /// Apply every step, stopping at the first failure.
    pub async fn apply_all(&mut self, steps: &mut [ConfigurationStep]) -> Result<()> {
        for step in steps.iter_mut() {
            self.apply(step).await?;
        }
        Ok(())
    }

    /// Apply a single step.
    ///
    /// Failures are wrapped in [`DeployError::ConfigurationStep`] and leave
    /// the step in [`StepState::Failed`].
    pub async fn apply(&mut self, step: &mut ConfigurationStep) -> Result<()> {
        let label = step.label();
        match self.execute(step, &label).await {
            Ok(()) => Ok(()),
            Err(source) => {
                step.state = StepState::Failed {
                    reason: source.to_string(),
                };
                tracing::error!(index = step.index, step = %label, error = %source, "Configuration step failed");
                Err(DeployError::ConfigurationStep {
                    index: step.index,
                    label,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn execute(&mut self, step: &mut ConfigurationStep, label: &str) -> Result<()> {
        let target = self.resolve_target(&step.target, label)?;
        let args = self.resolve_args(&step.args, label)?;
        let data = step.signature.encode_call(&args)?;

        if self.already_applied(step, target, &args, label).await? {
            tracing::info!(index = step.index, step = %label, "Already applied, skipping");
            step.state = StepState::AlreadyApplied;
            return Ok(());
        }

        step.state = StepState::Submitted;
        self.ctx
            .submit(label, Some(target), data, step.value)
            .await?;
        step.state = StepState::Confirmed;

        tracing::info!(index = step.index, step = %label, idempotency = %step.idempotency, "Configuration step applied");
        Ok(())
    }

    async fn already_applied(
        &self,
        step: &ConfigurationStep,
        target: Address,
        args: &[AbiValue],
        label: &str,
    ) -> Result<bool> {
        let query: Bytes = match &step.check {
            Some((signature, check_args)) => {
                let values = self.resolve_args(check_args, label)?;
                signature.encode_call(&values)?
            }
            // grantRole(role, account) is in effect once hasRole(role, account) holds.
            None if step.is_grant_role() => abi::encode_call(HAS_ROLE, args),
            None => return Ok(false),
        };

        let output = self.ctx.call(target, &query).await?;
        Ok(abi::decode_bool(&output)?)
    }

    fn resolve_target(&self, name: &str, label: &str) -> Result<Address> {
        self.book
            .resolve(name)
            .ok_or_else(|| DeployError::UnresolvedReference {
                unit: label.to_string(),
                reference: name.to_string(),
            })
    }

    fn resolve_args(&self, args: &[ArgSpec], label: &str) -> Result<Vec<AbiValue>> {
        args.iter().map(|a| a.resolve(self.book, label)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::role_id;
    use crate::chain::SimulatedChain;
    use crate::network::tests::test_network;
    use crate::spec::{Amount, ViewCheck};
    use alloy_core::primitives::B256;

    fn signer() -> Address {
        Address::repeat_byte(0xd0)
    }

    fn step(target: &str, call: &str, args: Vec<ArgSpec>) -> StepSpec {
        StepSpec {
            target: target.to_string(),
            call: call.to_string(),
            args,
            value: None,
            idempotency: Idempotency::Repeatable,
            check: None,
        }
    }

    async fn setup() -> (SimulatedChain, NetworkContext<SimulatedChain>, AddressBook, Address) {
        let chain = SimulatedChain::new(1);
        let mut ctx = NetworkContext::connect(chain.clone(), &test_network(1, signer()))
            .await
            .unwrap();
        let dei = ctx.deploy("dei", Bytes::new()).await.unwrap();
        let mut book = AddressBook::new(signer(), None);
        book.insert("dei", dei);
        (chain, ctx, book, dei)
    }

    #[tokio::test]
    async fn test_failure_reports_index_and_keeps_earlier_steps() {
        let (chain, mut ctx, book, dei) = setup().await;
        chain.revert_on(dei, "setOracle(address)");

        let specs = vec![
            step("dei", "setRefreshCooldown(uint256)", vec![ArgSpec::Uint(Amount::from(1800))]),
            step("dei", "setOracle(address)", vec![ArgSpec::Deployer]),
            step("dei", "setMintingFee(uint256)", vec![ArgSpec::Uint(Amount::from(5000))]),
        ];
        let mut steps = ConfigurationStep::from_specs(&specs).unwrap();

        let err = ParameterConfigurator::new(&mut ctx, &book)
            .apply_all(&mut steps)
            .await
            .unwrap_err();

        match err {
            DeployError::ConfigurationStep { index, ref source, .. } => {
                assert_eq!(index, 2);
                assert!(matches!(**source, DeployError::DeploymentTransaction { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(chain.was_called(dei, "setRefreshCooldown(uint256)"));
        assert!(!chain.was_called(dei, "setMintingFee(uint256)"));
        assert_eq!(steps[0].state, StepState::Confirmed);
        assert!(matches!(steps[1].state, StepState::Failed { .. }));
        assert_eq!(steps[2].state, StepState::Pending);
    }

    #[tokio::test]
    async fn test_grant_role_twice_is_already_applied() {
        let (chain, mut ctx, book, dei) = setup().await;
        let minter = Address::repeat_byte(0x33);

        let mut spec = step(
            "dei",
            GRANT_ROLE,
            vec![ArgSpec::Role("MINTER_ROLE".into()), ArgSpec::Address(minter)],
        );
        spec.idempotency = Idempotency::Once;

        let mut first = ConfigurationStep::from_spec(1, &spec).unwrap();
        ParameterConfigurator::new(&mut ctx, &book)
            .apply(&mut first)
            .await
            .unwrap();
        assert_eq!(first.state, StepState::Confirmed);
        assert!(chain.has_role(dei, role_id("MINTER_ROLE"), minter));

        let nonce = ctx.nonce();
        let mut second = ConfigurationStep::from_spec(1, &spec).unwrap();
        ParameterConfigurator::new(&mut ctx, &book)
            .apply(&mut second)
            .await
            .unwrap();
        assert_eq!(second.state, StepState::AlreadyApplied);
        assert_eq!(ctx.nonce(), nonce);
        assert!(!chain.has_role(dei, B256::ZERO, minter));
    }

    #[tokio::test]
    async fn test_once_step_with_view_check() {
        let (chain, mut ctx, book, dei) = setup().await;
        chain.link_flag(dei, "votingEnabled()", "toggleVotes()");

        let mut spec = step("dei", "toggleVotes()", vec![]);
        spec.idempotency = Idempotency::Once;
        spec.check = Some(ViewCheck {
            call: "votingEnabled()".into(),
            args: vec![],
        });

        let mut steps = ConfigurationStep::from_specs(&[spec.clone(), spec]).unwrap();
        ParameterConfigurator::new(&mut ctx, &book)
            .apply_all(&mut steps)
            .await
            .unwrap();

        assert_eq!(steps[0].state, StepState::Confirmed);
        assert_eq!(steps[1].state, StepState::AlreadyApplied);
    }

    #[tokio::test]
    async fn test_unknown_target_fails_before_sending() {
        let (_chain, mut ctx, book, _dei) = setup().await;
        let mut steps =
            ConfigurationStep::from_specs(&[step("deus", "setOracle(address)", vec![ArgSpec::Deployer])])
                .unwrap();
        let nonce = ctx.nonce();

        let err = ParameterConfigurator::new(&mut ctx, &book)
            .apply_all(&mut steps)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ConfigurationStep { index: 1, .. }));
        assert_eq!(ctx.nonce(), nonce);
    }

    #[test]
    fn test_labels_and_detectability() {
        let grant = ConfigurationStep::from_spec(
            3,
            &step("dei", "grantRole(bytes32, address)", vec![]),
        )
        .unwrap();
        assert_eq!(grant.label(), "dei.grantRole(bytes32,address)");
        assert!(grant.is_detectable());

        let toggle = ConfigurationStep::from_spec(1, &step("dei", "toggleVotes()", vec![])).unwrap();
        assert!(!toggle.is_detectable());
    }
}
