//! Handing administrative control over to the final owner.

use alloy_core::primitives::{Address, B256, U256};

use crate::abi::{self, AbiValue, DEFAULT_ADMIN_ROLE, encode_call, role_id};
use crate::chain::ChainClient;
use crate::error::{DeployError, Result};
use crate::network::NetworkContext;
use crate::spec::HandoverSpec;

/// A role to grant on a deployed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrant {
    /// Logical name of the unit, for errors and logs.
    pub target: String,
    pub address: Address,
    /// Role name, e.g. `DEFAULT_ADMIN_ROLE` or `MINTER_ROLE`.
    pub role: String,
    pub grantee: Address,
}

impl RoleGrant {
    fn error(&self, reason: impl ToString) -> DeployError {
        DeployError::RoleGrant {
            target: self.target.clone(),
            role: self.role.clone(),
            grantee: self.grantee,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum GrantOutcome {
    Granted,
    /// The grantee already held the role; nothing was sent.
    AlreadyHeld,
}

/// What a handover did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoverReport {
    pub granted: Vec<(String, GrantOutcome)>,
    pub swept: Vec<(String, U256)>,
    pub renounced: Vec<String>,
}

/// Grants roles, idempotently, and performs the final handover.
pub struct RoleGrantManager<'a, C> {
    ctx: &'a mut NetworkContext<C>,
}

impl<'a, C: ChainClient> RoleGrantManager<'a, C> {
    pub fn new(ctx: &'a mut NetworkContext<C>) -> Self {
        Self { ctx }
    }

    /// Whether `account` holds `role` on `contract`.
    pub async fn has_role(&self, contract: Address, role: B256, account: Address) -> Result<bool> {
        let data = encode_call(
            "hasRole(bytes32,address)",
            &[AbiValue::Bytes32(role), AbiValue::Address(account)],
        );
        let output = self.ctx.call(contract, &data).await?;
        Ok(abi::decode_bool(&output)?)
    }

    /// Grant a role. Granting a role the grantee already holds is a no-op.
    pub async fn grant(&mut self, grant: &RoleGrant) -> Result<GrantOutcome> {
        let role = role_id(&grant.role);
        let held = self
            .has_role(grant.address, role, grant.grantee)
            .await
            .map_err(|e| grant.error(e))?;
        if held {
            tracing::info!(unit = %grant.target, role = %grant.role, grantee = %grant.grantee, "Role already held");
            return Ok(GrantOutcome::AlreadyHeld);
        }

        let label = format!("{}.grantRole({}, {})", grant.target, grant.role, grant.grantee);
        let data = encode_call(
            "grantRole(bytes32,address)",
            &[AbiValue::Bytes32(role), AbiValue::Address(grant.grantee)],
        );
        self.ctx
            .submit(&label, Some(grant.address), data, U256::ZERO)
            .await
            .map_err(|e| match e {
                DeployError::ConfirmationTimeout { .. } | DeployError::NonceMismatch { .. } => e,
                other => grant.error(other),
            })?;

        if !self
            .has_role(grant.address, role, grant.grantee)
            .await
            .map_err(|e| grant.error(e))?
        {
            return Err(grant.error("role not held after a successful grant"));
        }

        tracing::info!(unit = %grant.target, role = %grant.role, grantee = %grant.grantee, "Role granted");
        Ok(GrantOutcome::Granted)
    }

    /// Transfer administrative control of `units` to the final admin.
    ///
    /// Every unit gets `DEFAULT_ADMIN_ROLE` for the admin first. Then the
    /// deployer's balances of the `sweep` tokens are transferred, and only
    /// at the very end, if requested, the deployer renounces its own admin
    /// role everywhere.
    pub async fn hand_over(
        &mut self,
        spec: &HandoverSpec,
        units: &[(String, Address)],
        sweep: &[(String, Address)],
    ) -> Result<HandoverReport> {
        let mut report = HandoverReport::default();
        let deployer = self.ctx.signer();

        for (name, address) in units {
            let grant = RoleGrant {
                target: name.clone(),
                address: *address,
                role: DEFAULT_ADMIN_ROLE.to_string(),
                grantee: spec.admin,
            };
            let outcome = self.grant(&grant).await?;
            report.granted.push((name.clone(), outcome));
        }

        for (name, token) in sweep {
            let amount = self.sweep(name, *token, deployer, spec.admin).await?;
            report.swept.push((name.clone(), amount));
        }

        if spec.revoke_deployer && spec.admin != deployer {
            for (name, address) in units {
                if self.renounce(name, *address, deployer).await? {
                    report.renounced.push(name.clone());
                }
            }
        }

        tracing::info!(
            admin = %spec.admin,
            units = report.granted.len(),
            swept = report.swept.len(),
            renounced = report.renounced.len(),
            "Handover complete"
        );
        Ok(report)
    }

    /// Transfer the deployer's whole balance of `token` to `to`.
    async fn sweep(&mut self, name: &str, token: Address, from: Address, to: Address) -> Result<U256> {
        let data = encode_call("balanceOf(address)", &[AbiValue::Address(from)]);
        let balance = abi::decode_uint(&self.ctx.call(token, &data).await?)?;
        if balance.is_zero() {
            tracing::info!(token = %name, "Nothing to sweep");
            return Ok(balance);
        }

        let label = format!("{}.transfer({}, {})", name, to, balance);
        let data = encode_call(
            "transfer(address,uint256)",
            &[AbiValue::Address(to), AbiValue::Uint(balance)],
        );
        self.ctx.submit(&label, Some(token), data, U256::ZERO).await?;
        tracing::info!(token = %name, amount = %balance, recipient = %to, "Balance swept");
        Ok(balance)
    }

    /// Renounce the deployer's admin role on a unit. Returns `false` if it held none.
    async fn renounce(&mut self, name: &str, contract: Address, deployer: Address) -> Result<bool> {
        let grant = RoleGrant {
            target: name.to_string(),
            address: contract,
            role: DEFAULT_ADMIN_ROLE.to_string(),
            grantee: deployer,
        };
        let role = B256::ZERO;
        if !self.has_role(contract, role, deployer).await? {
            return Ok(false);
        }

        let label = format!("{}.renounceRole({}, {})", name, DEFAULT_ADMIN_ROLE, deployer);
        let data = encode_call(
            "renounceRole(bytes32,address)",
            &[AbiValue::Bytes32(role), AbiValue::Address(deployer)],
        );
        self.ctx
            .submit(&label, Some(contract), data, U256::ZERO)
            .await
            .map_err(|e| grant.error(format!("renounce failed: {}", e)))?;
        Ok(true)
    }
}
