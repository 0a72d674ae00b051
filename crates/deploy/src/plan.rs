//! Dependency graph and deployment planning.
//!
//! The planner turns the declared units into a [`DeploymentPlan`]: a
//! topological order in which every unit comes after everything it
//! references. Units with no ordering constraint between them keep their
//! declaration order, so the same file always produces the same plan.

use std::collections::{BTreeMap, BTreeSet};

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::abi::FunctionSignature;
use crate::configure::GRANT_ROLE;
use crate::error::{DeployError, Result};
use crate::spec::{
    ArgSpec, DeploymentSpec, Idempotency, PairSpec, SyncPoint, UnitKind, UnitSpec,
};

/// Name → address lookup used to resolve argument references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    entries: BTreeMap<String, Address>,
    deployer: Address,
    admin: Option<Address>,
}

impl AddressBook {
    pub fn new(deployer: Address, admin: Option<Address>) -> Self {
        Self {
            entries: BTreeMap::new(),
            deployer,
            admin,
        }
    }

    /// Seed a book with the external addresses of a deployment.
    pub fn from_spec(spec: &DeploymentSpec) -> Self {
        let mut book = Self::new(
            spec.network.deployer,
            spec.handover.as_ref().map(|h| h.admin),
        );
        for (name, address) in &spec.addresses {
            book.insert(name, *address);
        }
        book
    }

    pub fn insert(&mut self, name: &str, address: Address) {
        self.entries.insert(name.to_string(), address);
    }

    pub fn resolve(&self, name: &str) -> Option<Address> {
        self.entries.get(name).copied()
    }

    pub fn deployer(&self) -> Address {
        self.deployer
    }

    pub fn admin(&self) -> Option<Address> {
        self.admin
    }

    pub fn entries(&self) -> &BTreeMap<String, Address> {
        &self.entries
    }
}

/// Lifecycle of a deployment unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnitState {
    /// Not yet submitted.
    Pending,
    /// Creation (or pair seeding) submitted, waiting for confirmation.
    Deploying,
    /// Confirmed on chain; the address is known.
    Deployed,
    /// Submission or confirmation failed; the run stopped here.
    Failed { reason: String },
}

/// What a unit turns into once executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitTemplate {
    Contract {
        contract: String,
        args: Vec<ArgSpec>,
    },
    Pair(PairSpec),
}

/// A logical on-chain component to be instantiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentUnit {
    pub name: String,
    pub template: UnitTemplate,
    /// Names of the units that must be deployed first, in declaration order.
    pub dependencies: Vec<String>,
    /// Known once the unit is deployed.
    pub address: Option<Address>,
    pub state: UnitState,
    pub access_control: bool,
    pub verify: bool,
}

impl DeploymentUnit {
    pub fn is_pair(&self) -> bool {
        matches!(self.template, UnitTemplate::Pair(_))
    }

    pub fn is_deployed(&self) -> bool {
        matches!(self.state, UnitState::Deployed)
    }

    /// Record a confirmed deployment.
    pub fn mark_deployed(&mut self, address: Address) {
        self.address = Some(address);
        self.state = UnitState::Deployed;
    }

    /// Artifact name, if this unit is a contract.
    pub fn contract(&self) -> Option<&str> {
        match &self.template {
            UnitTemplate::Contract { contract, .. } => Some(contract),
            UnitTemplate::Pair(_) => None,
        }
    }
}

/// Units in an order where every unit's dependencies come first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    units: Vec<DeploymentUnit>,
}

impl DeploymentPlan {
    pub fn units(&self) -> &[DeploymentUnit] {
        &self.units
    }

    pub fn units_mut(&mut self) -> &mut [DeploymentUnit] {
        &mut self.units
    }

    pub fn unit(&self, name: &str) -> Option<&DeploymentUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn unit_mut(&mut self, name: &str) -> Option<&mut DeploymentUnit> {
        self.units.iter_mut().find(|u| u.name == name)
    }

    pub fn order(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name.as_str()).collect()
    }

    /// Position of a unit in the plan.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.units.iter().position(|u| u.name == name)
    }
}

/// Whether `start` can reach itself by following dependencies.
fn on_cycle(edges: &[Vec<usize>], start: usize) -> bool {
    let mut seen = vec![false; edges.len()];
    let mut stack: Vec<usize> = edges[start].clone();
    while let Some(i) = stack.pop() {
        if i == start {
            return true;
        }
        if !std::mem::replace(&mut seen[i], true) {
            stack.extend_from_slice(&edges[i]);
        }
    }
    false
}

/// Builds deployment plans.
pub struct Planner;

impl Planner {
    /// Validate a whole deployment and order its units.
    ///
    /// Besides sorting, this checks every reference made by configuration
    /// steps, nonce skips and the handover, and parses every call signature,
    /// so that a broken file fails before any transaction is sent.
    pub fn plan(spec: &DeploymentSpec) -> Result<DeploymentPlan> {
        let externals: BTreeSet<&str> = spec.addresses.keys().map(String::as_str).collect();
        let plan = Self::sort(&spec.units, &externals)?;
        Self::validate_rest(spec, &externals)?;

        tracing::debug!(order = ?plan.order(), "Deployment plan built");
        Ok(plan)
    }

    /// Topologically sort units.
    ///
    /// Kahn's algorithm with the ready set ordered by declaration index, so
    /// independent units keep the order they were declared in.
    pub fn sort(specs: &[UnitSpec], externals: &BTreeSet<&str>) -> Result<DeploymentPlan> {
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.as_str(), i).is_some() || externals.contains(spec.name.as_str())
            {
                return Err(DeployError::DuplicateUnit(spec.name.clone()));
            }
        }

        let mut dependencies: Vec<Vec<String>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut deps: Vec<String> = Vec::new();
            for reference in unit_references(spec) {
                if index.contains_key(reference) {
                    if !deps.iter().any(|d| d == reference) {
                        deps.push(reference.to_string());
                    }
                } else if !externals.contains(reference) {
                    return Err(DeployError::UnresolvedReference {
                        unit: spec.name.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
            dependencies.push(deps);
        }

        let edges: Vec<Vec<usize>> = dependencies
            .iter()
            .map(|deps| deps.iter().map(|dep| index[dep.as_str()]).collect())
            .collect();

        let mut in_degree = vec![0usize; specs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, deps) in edges.iter().enumerate() {
            for &d in deps {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..specs.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut order = Vec::with_capacity(specs.len());

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != specs.len() {
            // Units that merely depend on a cycle are left out of the report.
            let units = (0..specs.len())
                .filter(|&i| in_degree[i] > 0 && on_cycle(&edges, i))
                .map(|i| specs[i].name.clone())
                .collect();
            return Err(DeployError::DependencyCycle { units });
        }

        let units = order
            .into_iter()
            .map(|i| {
                let spec = &specs[i];
                let template = match &spec.kind {
                    UnitKind::Contract { contract, args } => UnitTemplate::Contract {
                        contract: contract.clone(),
                        args: args.clone(),
                    },
                    UnitKind::Pair(pair) => UnitTemplate::Pair(pair.clone()),
                };
                DeploymentUnit {
                    name: spec.name.clone(),
                    template,
                    dependencies: std::mem::take(&mut dependencies[i]),
                    address: None,
                    state: UnitState::Pending,
                    access_control: spec.access_control,
                    verify: spec.verify,
                }
            })
            .collect();

        Ok(DeploymentPlan { units })
    }

    fn validate_rest(spec: &DeploymentSpec, externals: &BTreeSet<&str>) -> Result<()> {
        let known = |name: &str| externals.contains(name) || spec.unit(name).is_some();

        let check_args = |owner: &str, args: &[ArgSpec]| -> Result<()> {
            for arg in args {
                if let Some(reference) = arg.reference() {
                    if !known(reference) {
                        return Err(DeployError::UnresolvedReference {
                            unit: owner.to_string(),
                            reference: reference.to_string(),
                        });
                    }
                }
                if matches!(arg, ArgSpec::Admin) && spec.handover.is_none() {
                    return Err(DeployError::UnresolvedReference {
                        unit: owner.to_string(),
                        reference: "admin".to_string(),
                    });
                }
            }
            Ok(())
        };

        let has_pairs = spec
            .units
            .iter()
            .any(|u| matches!(u.kind, UnitKind::Pair(_)));
        if let Some(amm) = &spec.amm {
            for name in std::iter::once(&amm.router).chain(amm.factory.iter()) {
                if !externals.contains(name.as_str()) {
                    return Err(DeployError::UnresolvedReference {
                        unit: "amm".to_string(),
                        reference: name.clone(),
                    });
                }
            }
        } else if has_pairs {
            return Err(DeployError::UnresolvedReference {
                unit: "amm".to_string(),
                reference: "router".to_string(),
            });
        }

        for unit in &spec.units {
            match &unit.kind {
                UnitKind::Contract { args, .. } => check_args(&unit.name, args)?,
                UnitKind::Pair(pair) => {
                    check_args(&unit.name, pair.recipient.as_slice())?;
                }
            }
        }

        for (i, step) in spec.configure.iter().enumerate() {
            let owner = format!("configure[{}]", i + 1);
            if !known(&step.target) {
                return Err(DeployError::UnresolvedReference {
                    unit: owner,
                    reference: step.target.clone(),
                });
            }
            let signature = FunctionSignature::parse(&step.call)?;
            if step.idempotency == Idempotency::Once
                && step.check.is_none()
                && signature.to_string() != GRANT_ROLE
            {
                return Err(DeployError::InvalidCall {
                    signature: signature.to_string(),
                    reason: format!(
                        "{} is once-only but has no `check` to detect that it was already applied",
                        owner
                    ),
                });
            }
            check_args(&owner, &step.args)?;
            if let Some(check) = &step.check {
                FunctionSignature::parse(&check.call)?;
                check_args(&owner, &check.args)?;
            }
        }

        for skip in &spec.sync {
            if let SyncPoint::Unit(name) = &skip.after {
                if spec.unit(name).is_none() {
                    return Err(DeployError::UnresolvedReference {
                        unit: "sync".to_string(),
                        reference: name.clone(),
                    });
                }
            }
        }

        if let Some(handover) = &spec.handover {
            for token in &handover.sweep {
                if !known(token) {
                    return Err(DeployError::UnresolvedReference {
                        unit: "handover".to_string(),
                        reference: token.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Every name a unit depends on, explicit or through its arguments, in order of appearance.
fn unit_references(spec: &UnitSpec) -> Vec<&str> {
    let mut refs: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
    match &spec.kind {
        UnitKind::Contract { args, .. } => {
            refs.extend(args.iter().filter_map(ArgSpec::reference));
        }
        UnitKind::Pair(pair) => {
            refs.push(&pair.token_a.token);
            refs.push(&pair.token_b.token);
            refs.extend(pair.recipient.iter().filter_map(ArgSpec::reference));
        }
    }
    refs
}
