//! End-to-end deployment runs against the in-process simulated chain.
//!
//! Run with: cargo test --test deployment_test

use std::path::{Path, PathBuf};

use alloy_core::primitives::{Address, B256, U256};
use deistack_deploy::{
    ArtifactStore, DeployError, Deployment, DeploymentSpec, RunJournal, RunOptions,
    SimulatedChain, abi::role_id, deployment::ADDRESSES_FILENAME, run,
};

const DEPLOYER: &str = "0x00000000000000000000000000000000000000d0";
const ADMIN: &str = "0x00000000000000000000000000000000000000ad";

const NETWORK: &str = r#"
[network]
name = "simulated"
chain_id = 31337
rpc_url = "http://localhost:8545"
deployer = "0x00000000000000000000000000000000000000d0"

[network.confirmation]
poll_min_ms = 1
poll_max_ms = 5
timeout_secs = 1
"#;

const AMM: &str = r#"
[addresses]
router = "0x00000000000000000000000000000000000000a1"
usdc = "0x00000000000000000000000000000000000000c1"

[amm]
router = "router"
"#;

fn deployer() -> Address {
    DEPLOYER.parse().unwrap()
}

fn admin() -> Address {
    ADMIN.parse().unwrap()
}

fn ether(amount: u64) -> U256 {
    U256::from(amount) * U256::from(10u64).pow(U256::from(18))
}

fn spec(body: &str) -> DeploymentSpec {
    toml::from_str(&format!("{}\n{}", NETWORK, body)).unwrap()
}

fn options(dir: &Path) -> RunOptions {
    RunOptions {
        verify: false,
        ..RunOptions::new(dir.join("out"))
    }
}

fn address_of(report: &deistack_deploy::DeploymentReport, name: &str) -> Address {
    report
        .units
        .iter()
        .find(|u| u.name == name)
        .map(|u| u.address)
        .unwrap_or_else(|| panic!("unit {} not in report", name))
}

fn rinkeby() -> DeploymentSpec {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs/rinkeby.toml");
    let mut spec = DeploymentSpec::load_from_file(&path).unwrap();
    spec.verify.command = None;
    spec
}

#[tokio::test]
async fn test_rinkeby_dry_run() {
    let dir = tempdir::TempDir::new("deistack-rinkeby").unwrap();
    let spec = rinkeby();
    let chain = SimulatedChain::from_spec(&spec);
    let signer = spec.network.deployer;
    let final_admin = spec.handover.as_ref().unwrap().admin;
    assert_eq!(spec.network.confirmation.confirmations, 2);

    let report = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        run(&spec, chain.clone(), ArtifactStore::synthetic(), RunOptions::new(dir.path())),
    )
    .await
    .expect("dry run did not finish")
    .unwrap();

    // 9 contracts, 3 + 3 + 4 liquidity transactions, 8 nonce skips,
    // 19 configuration steps, 8 admin grants and 6 sweeps.
    assert_eq!(report.units.len(), 12);
    assert_eq!(report.final_nonce, 60);
    assert_eq!(report.transactions, 60);
    assert_eq!(chain.account_nonce(signer), 60);
    let creations = chain.transactions().iter().filter(|tx| tx.is_creation()).count();
    assert_eq!(creations, 9);

    let dei = address_of(&report, "dei");
    let deus = address_of(&report, "deus");
    let dei_deus = address_of(&report, "dei_deus");
    let staking = address_of(&report, "staking_dei_deus");

    // The pair holds the seed amounts and staking was built on top of it.
    assert_eq!(chain.balance_of(dei, dei_deus), ether(1500));
    assert_eq!(chain.balance_of(deus, dei_deus), ether(10));
    let code = chain.creation_code(staking).unwrap();
    assert_eq!(&code[44..64], dei_deus.as_slice());

    for name in ["staking_dei_deus", "staking_dei_usdc", "staking_deus_weth"] {
        assert!(chain.has_role(deus, role_id("MINTER_ROLE"), address_of(&report, name)));
    }
    for unit in &report.units {
        if unit.kind != "pair" && unit.kind != "DEIPoolLibrary" {
            assert!(chain.has_role(unit.address, B256::ZERO, final_admin), "{}", unit.name);
        }
    }
    assert!(chain.balance_of(dei, signer).is_zero());
    assert!(!chain.balance_of(dei_deus, final_admin).is_zero());

    let manifest = dir.path().join(deistack_deploy::verify::MANIFEST_FILENAME);
    assert!(manifest.exists());
    assert!(dir.path().join(ADDRESSES_FILENAME).exists());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_anything_is_sent() {
    let dir = tempdir::TempDir::new("deistack-cycle").unwrap();
    let spec = spec(
        r#"
[[units]]
name = "a"
kind = "contract"
contract = "A"
args = [{ ref = "b" }]

[[units]]
name = "b"
kind = "contract"
contract = "B"
args = [{ ref = "a" }]
"#,
    );
    let chain = SimulatedChain::from_spec(&spec);
    let outdata = options(dir.path()).outdata;

    let Err(err) = Deployment::start(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path())).await
    else {
        panic!("a cyclic deployment must not start");
    };

    assert!(matches!(err, DeployError::DependencyCycle { ref units } if units == &["a", "b"]));
    assert!(err.is_planning_error());
    assert!(chain.transactions().is_empty());
    assert!(!outdata.exists());
}

#[tokio::test]
async fn test_pair_seeding_feeds_staking() {
    let dir = tempdir::TempDir::new("deistack-pair").unwrap();
    let spec = spec(&format!(
        r#"{}
[[units]]
name = "staking"
kind = "contract"
contract = "Staking"
args = [{{ ref = "dei_deus" }}, {{ ref = "deus" }}, {{ uint = "1000" }}]

[[units]]
name = "dei"
kind = "contract"
contract = "DEIStablecoin"

[[units]]
name = "deus"
kind = "contract"
contract = "DEUSToken"

[[units]]
name = "dei_deus"
kind = "pair"
token_a = {{ token = "dei", amount = "1500e18" }}
token_b = {{ token = "deus", amount = "10e18" }}
"#,
        AMM
    ));
    let chain = SimulatedChain::from_spec(&spec);

    let report = run(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();

    let order: Vec<_> = report.units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(order, ["dei", "deus", "dei_deus", "staking"]);

    let dei = address_of(&report, "dei");
    let deus = address_of(&report, "deus");
    let pair = address_of(&report, "dei_deus");
    assert_eq!(chain.balance_of(dei, pair), ether(1500));
    assert_eq!(chain.balance_of(deus, pair), ether(10));
    // LP tokens go to the deployer by default.
    assert!(!chain.balance_of(pair, deployer()).is_zero());

    let code = chain.creation_code(address_of(&report, "staking")).unwrap();
    assert_eq!(&code[44..64], pair.as_slice());
}

#[tokio::test]
async fn test_expired_deadline_stops_the_run() {
    let dir = tempdir::TempDir::new("deistack-deadline").unwrap();
    let spec = spec(&format!(
        r#"{}
[[units]]
name = "dei"
kind = "contract"
contract = "DEIStablecoin"

[[units]]
name = "dei_usdc"
kind = "pair"
token_a = {{ token = "dei", amount = "1000e18" }}
token_b = {{ token = "usdc", amount = "1000e6" }}
deadline = {{ at = 1 }}

[[units]]
name = "staking"
kind = "contract"
contract = "Staking"
args = [{{ ref = "dei_usdc" }}]
"#,
        AMM
    ));
    let chain = SimulatedChain::from_spec(&spec);

    let err = run(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap_err();

    assert!(
        matches!(err, DeployError::DeploymentTransaction { ref label, .. } if label == "dei_usdc: addLiquidity"),
        "{err}"
    );
    // dei, two approvals, the reverted addLiquidity.
    assert_eq!(chain.account_nonce(deployer()), 4);

    let journal = RunJournal::load(&options(dir.path()).outdata).unwrap().unwrap();
    assert_eq!(journal.units.keys().collect::<Vec<_>>(), ["dei"]);
    assert_eq!(journal.transcript.len(), 4);
    assert!(!journal.transcript[3].status);
}

const DEI_STEPS: &str = r#"
[[units]]
name = "dei"
kind = "contract"
contract = "DEIStablecoin"

[[configure]]
target = "dei"
call = "setDEIStep(uint256)"
args = [{ uint = "1000" }]

[[configure]]
target = "dei"
call = "setRefreshCooldown(uint256)"
args = [{ uint = "1800" }]

[[configure]]
target = "dei"
call = "setPriceBands(uint256,uint256)"
args = [{ uint = "1040000" }, { uint = "960000" }]
"#;

#[tokio::test]
async fn test_failed_step_resumes_where_it_stopped() {
    let dir = tempdir::TempDir::new("deistack-resume").unwrap();
    let spec = spec(DEI_STEPS);
    let chain = SimulatedChain::from_spec(&spec);

    let planned = Deployment::start(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();
    let Ok(deployed) = planned.deploy().await else {
        panic!("deploy phase failed");
    };
    let dei = deployed.book().resolve("dei").unwrap();
    chain.revert_on(dei, "setRefreshCooldown(uint256)");

    let Err(err) = deployed.configure().await else {
        panic!("step 2 must fail");
    };
    let DeployError::ConfigurationStep { index, label, .. } = err else {
        panic!("expected a configuration step error, got {err}");
    };
    assert_eq!(index, 2);
    assert_eq!(label, "dei.setRefreshCooldown(uint256)");
    assert!(chain.was_called(dei, "setDEIStep(uint256)"));
    assert!(!chain.was_called(dei, "setPriceBands(uint256,uint256)"));

    let journal = RunJournal::load(&options(dir.path()).outdata).unwrap().unwrap();
    assert!(journal.step_done(1));
    assert!(!journal.step_done(2));
    assert_eq!(chain.account_nonce(deployer()), 3);

    chain.stop_reverting(dei, "setRefreshCooldown(uint256)");
    let report = run(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();

    // Only steps 2 and 3 were sent again; dei was restored, not redeployed.
    assert_eq!(report.transactions, 2);
    assert_eq!(address_of(&report, "dei"), dei);
    assert!(chain.was_called(dei, "setPriceBands(uint256,uint256)"));
    assert_eq!(chain.account_nonce(deployer()), 5);
}

#[tokio::test]
async fn test_step_skipped_with_from_step_runs_on_next_resume() {
    let dir = tempdir::TempDir::new("deistack-from-step").unwrap();
    let spec = spec(DEI_STEPS);
    let chain = SimulatedChain::from_spec(&spec);

    let planned = Deployment::start(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();
    let Ok(deployed) = planned.deploy().await else {
        panic!("deploy phase failed");
    };
    let dei = deployed.book().resolve("dei").unwrap();
    chain.revert_on(dei, "setRefreshCooldown(uint256)");
    assert!(deployed.configure().await.is_err());

    // Jump over the failing step.
    let skip_ahead = RunOptions {
        from_step: Some(3),
        ..options(dir.path())
    };
    run(&spec, chain.clone(), ArtifactStore::synthetic(), skip_ahead)
        .await
        .unwrap();
    assert!(chain.was_called(dei, "setPriceBands(uint256,uint256)"));

    let journal = RunJournal::load(&options(dir.path()).outdata).unwrap().unwrap();
    assert!(journal.step_done(3));
    assert!(!journal.step_done(2));
    assert_eq!(journal.first_pending_step(), 2);

    // The skipped step is still pending; nothing else is sent again.
    chain.stop_reverting(dei, "setRefreshCooldown(uint256)");
    let nonce = chain.account_nonce(deployer());
    let report = run(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();
    assert_eq!(report.transactions, 1);
    assert!(chain.was_called(dei, "setRefreshCooldown(uint256)"));
    assert_eq!(chain.account_nonce(deployer()), nonce + 1);

    let journal = RunJournal::load(&options(dir.path()).outdata).unwrap().unwrap();
    assert_eq!(journal.first_pending_step(), 4);
}

#[tokio::test]
async fn test_shadow_environment_burns_nonces() {
    let body = r#"
[[units]]
name = "dei"
kind = "contract"
contract = "DEIStablecoin"

[[units]]
name = "deus"
kind = "contract"
contract = "DEUSToken"

[[sync]]
after = { unit = "dei" }
count = 3
reason = "pair created by hand on the primary"

[[sync]]
after = { phase = "deploy" }
count = 1
reason = "manual transfer on the primary"
"#;

    let primary = spec(body);
    let mut shadow = primary.clone();
    shadow.network.environment = deistack_deploy::spec::Environment::Shadow;

    let dir = tempdir::TempDir::new("deistack-shadow").unwrap();
    let primary_chain = SimulatedChain::from_spec(&primary);
    let shadow_chain = SimulatedChain::from_spec(&shadow);

    let on_primary = run(&primary, primary_chain.clone(), ArtifactStore::synthetic(), options(&dir.path().join("primary")))
        .await
        .unwrap();
    let on_shadow = run(&shadow, shadow_chain.clone(), ArtifactStore::synthetic(), options(&dir.path().join("shadow")))
        .await
        .unwrap();

    assert_eq!(primary_chain.account_nonce(deployer()), 2);
    assert_eq!(shadow_chain.account_nonce(deployer()), 6);
    assert_eq!(on_shadow.final_nonce, 6);
    // The skips sit between dei and deus, so deus moves to another address.
    assert_eq!(address_of(&on_primary, "dei"), address_of(&on_shadow, "dei"));
    assert_ne!(address_of(&on_primary, "deus"), address_of(&on_shadow, "deus"));

    let journal = RunJournal::load(&options(&dir.path().join("shadow")).outdata)
        .unwrap()
        .unwrap();
    assert_eq!(journal.syncs.len(), 5);
}

#[tokio::test]
async fn test_second_run_sends_nothing() {
    let dir = tempdir::TempDir::new("deistack-rerun").unwrap();
    let spec = spec(&format!(
        r#"
[[units]]
name = "dei"
kind = "contract"
contract = "DEIStablecoin"
access_control = true

[[configure]]
target = "dei"
call = "grantRole(bytes32,address)"
args = [{{ role = "MINTER_ROLE" }}, "admin"]
idempotency = "once"

[handover]
admin = "{}"
revoke_deployer = true
sweep = ["dei"]
"#,
        ADMIN
    ));
    let chain = SimulatedChain::from_spec(&spec);

    let first = run(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();
    let dei = address_of(&first, "dei");
    let handover = first.handover.unwrap();
    assert_eq!(handover.renounced, vec!["dei".to_string()]);
    assert!(chain.has_role(dei, B256::ZERO, admin()));
    assert!(!chain.has_role(dei, B256::ZERO, deployer()));
    assert!(chain.has_role(dei, role_id("MINTER_ROLE"), admin()));

    let nonce = chain.account_nonce(deployer());
    let second = run(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();
    assert_eq!(second.transactions, 0);
    assert!(second.handover.is_none());
    assert_eq!(chain.account_nonce(deployer()), nonce);
}

#[tokio::test]
async fn test_journal_of_another_deployment_needs_fresh() {
    let dir = tempdir::TempDir::new("deistack-fresh").unwrap();
    let original = spec(
        r#"
[[units]]
name = "dei"
kind = "contract"
contract = "DEIStablecoin"
"#,
    );
    let mut changed = original.clone();
    changed.units[0].name = "dei_v2".to_string();

    let chain = SimulatedChain::from_spec(&original);
    run(&original, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap();

    let err = run(&changed, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("--fresh"), "{err}");

    let report = run(
        &changed,
        chain.clone(),
        ArtifactStore::synthetic(),
        RunOptions {
            fresh: true,
            ..options(dir.path())
        },
    )
    .await
    .unwrap();
    assert_eq!(report.units[0].name, "dei_v2");
    assert_eq!(chain.account_nonce(deployer()), 2);
}

#[tokio::test]
async fn test_unconfirmed_transaction_times_out() {
    let dir = tempdir::TempDir::new("deistack-timeout").unwrap();
    let spec = spec(
        r#"
[[units]]
name = "dei"
kind = "contract"
contract = "DEIStablecoin"
"#,
    );
    let chain = SimulatedChain::from_spec(&spec);
    chain.withhold_receipts(true);

    let err = run(&spec, chain.clone(), ArtifactStore::synthetic(), options(dir.path()))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ConfirmationTimeout { .. }), "{err}");
    // No retry: the one creation was sent and nothing after it.
    assert_eq!(chain.transactions().len(), 1);
}
