//! End-to-end runs of the resume controller against an in-memory ledger.
//!
//! Run with: cargo test --test orchestrator

mod common;

use std::{collections::BTreeSet, time::Duration};

use alloy_core::primitives::{Address, TxHash, keccak256};
use anyhow::Result;
use common::{
    MockTransactionLayer, Phase, artifact, fast_settings, init_test_tracing, provider, target,
};
use hoist_deploy::{
    ConstructorArg, DeployError, ManifestStore, ModuleDefinition, ResumeController, RunState,
    StaticProvider, StepKind, TxError, TxRequest, cancel_channel,
};
use tempdir::TempDir;

/// Test setup: a deployments directory and a shared mock ledger.
struct TestContext {
    _dir: TempDir,
    store: ManifestStore,
    layer: MockTransactionLayer,
}

impl TestContext {
    fn new() -> Self {
        Self::with_layer(|layer| layer)
    }

    fn with_layer(configure: impl FnOnce(MockTransactionLayer) -> MockTransactionLayer) -> Self {
        init_test_tracing();
        let dir = TempDir::new("hoist-test").expect("Failed to create temp dir");
        let store = ManifestStore::new(dir.path().join("deployments"));
        let layer = configure(MockTransactionLayer::new());
        Self {
            _dir: dir,
            store,
            layer,
        }
    }

    fn controller(
        &self,
        artifacts: StaticProvider,
        max_in_flight: usize,
    ) -> ResumeController<MockTransactionLayer, StaticProvider> {
        ResumeController::new(self.store.clone(), self.layer.clone(), artifacts)
            .settings(fast_settings(max_in_flight))
    }

    fn manifest_path(&self) -> std::path::PathBuf {
        self.store.manifest_path("local", "official")
    }

    fn manifest_bytes(&self) -> Option<String> {
        std::fs::read_to_string(self.manifest_path()).ok()
    }
}

/// `A`, then `B` taking `A`'s address, then `C` which only has to come after `A`.
fn chain() -> Vec<ModuleDefinition> {
    vec![
        ModuleDefinition::new("A"),
        ModuleDefinition::new("B").arg(ConstructorArg::module("A")),
        ModuleDefinition::new("C").depends_on("A"),
    ]
}

#[tokio::test]
async fn test_fresh_deployment_in_dependency_order() -> Result<()> {
    let ctx = TestContext::new();
    let definitions = vec![
        ModuleDefinition::new("B").arg(ConstructorArg::module("A")),
        ModuleDefinition::new("A"),
    ];

    let outcome = ctx.controller(provider(), 4).run(&target(), &definitions).await?;

    assert_eq!(ctx.layer.deployed_modules(), vec!["A", "B"]);
    assert_eq!(outcome.transactions, 2);
    assert_eq!(
        outcome.history,
        vec![
            RunState::Loading,
            RunState::Graphing,
            RunState::Diffing,
            RunState::Executing,
            RunState::Aggregating,
            RunState::Completed,
        ]
    );

    let manifest = ctx.store.load(&target())?;
    assert!(manifest.is_completed());
    let a = manifest.module("A").found().expect("A should be recorded");
    let b = manifest.module("B").found().expect("B should be recorded");
    assert_eq!(a.deployed_address, MockTransactionLayer::address_for(1));
    assert_eq!(b.deployed_address, MockTransactionLayer::address_for(2));
    assert_eq!(a.contract.as_deref(), Some("A"));
    assert!(manifest.router_address().is_none());

    // B's creation code carries A's address as its constructor argument.
    let TxRequest::Deploy { code, .. } = &ctx.layer.submitted()[1] else {
        panic!("second transaction should be a deployment");
    };
    assert_eq!(&code[code.len() - 20..], a.deployed_address.as_slice());

    Ok(())
}

#[tokio::test]
async fn test_second_run_is_a_noop() -> Result<()> {
    let ctx = TestContext::new();
    ctx.controller(provider(), 4).run(&target(), &chain()).await?;
    let before = ctx.manifest_bytes();
    let submitted = ctx.layer.submitted().len();

    let outcome = ctx.controller(provider(), 4).run(&target(), &chain()).await?;

    assert!(outcome.was_noop());
    assert_eq!(ctx.layer.submitted().len(), submitted);
    assert_eq!(
        outcome.history,
        vec![
            RunState::Loading,
            RunState::Graphing,
            RunState::Diffing,
            RunState::Completed,
        ]
    );
    assert!(outcome.plan.steps.iter().all(|s| s.kind == StepKind::NoOp));
    assert_eq!(ctx.manifest_bytes(), before, "A no-op run must not rewrite the manifest");

    Ok(())
}

#[tokio::test]
async fn test_resume_after_failed_step() -> Result<()> {
    let ctx = TestContext::new();
    let definitions = vec![
        ModuleDefinition::new("A"),
        ModuleDefinition::new("B").arg(ConstructorArg::module("A")),
        ModuleDefinition::new("C").depends_on("B"),
    ];
    ctx.layer.fail(
        "B",
        Phase::Submit,
        TxError::Rejected("insufficient funds".to_string()),
        1,
    );

    let err = ctx
        .controller(provider(), 1)
        .run(&target(), &definitions)
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        DeployError::StepFailed { module, kind: StepKind::Deploy, cause: TxError::Rejected(_) }
            if module == "B"
    ));

    let manifest = ctx.store.load(&target())?;
    assert!(!manifest.is_completed());
    assert!(manifest.module("A").found().is_some());
    assert!(manifest.module("B").found().is_none());
    assert!(manifest.module("C").found().is_none());

    let outcome = ctx.controller(provider(), 1).run(&target(), &definitions).await?;

    assert_eq!(outcome.plan.kind_of("A"), Some(StepKind::NoOp));
    assert_eq!(outcome.transactions, 2);
    assert_eq!(ctx.layer.deployed_modules(), vec!["A", "B", "C"]);
    let resumed = ctx.store.load(&target())?;
    assert!(resumed.is_completed());

    // The resumed run ends where a run that never failed ends.
    let uninterrupted = TestContext::new();
    uninterrupted
        .controller(provider(), 1)
        .run(&target(), &definitions)
        .await?;
    let expected = uninterrupted.store.load(&target())?;
    assert_eq!(resumed.contracts, expected.contracts);
    assert_eq!(resumed.router, expected.router);
    assert_eq!(resumed.properties.completed, expected.properties.completed);

    Ok(())
}

#[tokio::test]
async fn test_transient_receipt_failure_repolls_same_transaction() -> Result<()> {
    let ctx = TestContext::new();
    ctx.layer.fail(
        "A",
        Phase::Receipt,
        TxError::Transient("connection reset".to_string()),
        2,
    );

    ctx.controller(provider(), 1)
        .run(&target(), &[ModuleDefinition::new("A")])
        .await?;

    assert_eq!(ctx.layer.submitted().len(), 1, "Retries must not resubmit");
    assert_eq!(ctx.layer.receipt_polls(), 3);
    assert!(ctx.store.load(&target())?.module("A").found().is_some());

    Ok(())
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_step() -> Result<()> {
    let ctx = TestContext::new();
    ctx.layer.fail(
        "A",
        Phase::Submit,
        TxError::Transient("rate limited".to_string()),
        usize::MAX,
    );

    let err = ctx
        .controller(provider(), 1)
        .run(&target(), &[ModuleDefinition::new("A")])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::StepFailed { cause: TxError::Transient(_), .. }
    ));
    assert!(ctx.layer.submitted().is_empty());
    assert!(!ctx.manifest_path().exists(), "Nothing may be recorded");

    Ok(())
}

#[tokio::test]
async fn test_indeterminate_submission_is_not_resent() -> Result<()> {
    let ctx = TestContext::new();
    ctx.layer.fail(
        "A",
        Phase::Submit,
        TxError::Indeterminate("request timed out".to_string()),
        1,
    );

    let err = ctx
        .controller(provider(), 1)
        .run(&target(), &[ModuleDefinition::new("A")])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::StepFailed { cause: TxError::Indeterminate(_), .. }
    ));
    assert_eq!(ctx.layer.submit_attempts(), 1);
    assert!(!ctx.manifest_path().exists(), "Nothing may be recorded");

    Ok(())
}

#[tokio::test]
async fn test_reverted_transaction_is_not_retried() -> Result<()> {
    let ctx = TestContext::new();
    ctx.layer.fail(
        "A",
        Phase::Receipt,
        TxError::Reverted {
            tx_hash: TxHash::repeat_byte(1),
        },
        1,
    );

    let err = ctx
        .controller(provider(), 1)
        .run(&target(), &[ModuleDefinition::new("A")])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeployError::StepFailed { cause: TxError::Reverted { .. }, .. }
    ));
    assert_eq!(ctx.layer.receipt_polls(), 1);

    Ok(())
}

#[tokio::test]
async fn test_dependents_start_after_prerequisites_are_persisted() -> Result<()> {
    let ctx = TestContext::with_layer(|layer| layer.receipt_delay(Duration::from_millis(10)));
    let layer = ctx.layer.clone().observe(ctx.store.clone(), target());
    let controller = ResumeController::new(ctx.store.clone(), layer.clone(), provider())
        .settings(fast_settings(4));

    let definitions = vec![
        ModuleDefinition::new("A"),
        ModuleDefinition::new("B").arg(ConstructorArg::module("A")),
        ModuleDefinition::new("C").depends_on("A"),
        ModuleDefinition::new("D").depends_on("B").depends_on("C"),
    ];
    controller.run(&target(), &definitions).await?;

    let names = |modules: &[&str]| -> BTreeSet<String> {
        modules.iter().map(|m| m.to_string()).collect()
    };
    assert_eq!(layer.persisted_at_submit("A"), Some(names(&[])));
    assert_eq!(layer.persisted_at_submit("B"), Some(names(&["A"])));
    assert_eq!(layer.persisted_at_submit("C"), Some(names(&["A"])));
    assert_eq!(layer.persisted_at_submit("D"), Some(names(&["A", "B", "C"])));

    // B and C are independent and overlap.
    assert_eq!(layer.max_in_flight(), 2);

    Ok(())
}

#[tokio::test]
async fn test_in_flight_steps_are_bounded() -> Result<()> {
    let definitions = vec![
        ModuleDefinition::new("A"),
        ModuleDefinition::new("B").arg(ConstructorArg::value(Address::ZERO.to_string())),
        ModuleDefinition::new("C"),
        ModuleDefinition::new("D"),
    ];

    for max_in_flight in [1, 2] {
        let ctx = TestContext::with_layer(|layer| layer.receipt_delay(Duration::from_millis(10)));
        ctx.controller(provider(), max_in_flight)
            .run(&target(), &definitions)
            .await?;

        assert_eq!(ctx.layer.max_in_flight(), max_in_flight);
        assert_eq!(ctx.layer.deployed_modules().len(), 4);
    }

    Ok(())
}

#[tokio::test]
async fn test_selector_collision_aborts_before_any_transaction() -> Result<()> {
    let ctx = TestContext::new();
    let artifacts = provider()
        .with(artifact("TokenA", "0x6010", &["transfer(address,uint256)"], &[]))
        .with(artifact("TokenB", "0x6020", &["transfer(address,uint256)"], &[]));
    let definitions = vec![
        ModuleDefinition::new("tokenA").contract("TokenA").routed(true),
        ModuleDefinition::new("tokenB").contract("TokenB").routed(true),
    ];

    let err = ctx
        .controller(artifacts, 4)
        .run(&target(), &definitions)
        .await
        .unwrap_err();

    let DeployError::SelectorCollision { modules, .. } = err else {
        panic!("expected a selector collision, got {err:?}");
    };
    assert_eq!(modules.len(), 2);
    assert!(ctx.layer.submitted().is_empty());
    assert!(!ctx.manifest_path().exists());

    Ok(())
}

#[tokio::test]
async fn test_cycle_aborts_before_any_transaction() -> Result<()> {
    let ctx = TestContext::new();
    let definitions = vec![
        ModuleDefinition::new("A").depends_on("B"),
        ModuleDefinition::new("B").depends_on("A"),
    ];

    let err = ctx
        .controller(provider(), 4)
        .run(&target(), &definitions)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::CyclicDependency { cycle } if cycle == vec!["A", "B", "A"]));
    assert!(ctx.layer.submitted().is_empty());
    assert!(!ctx.manifest_path().exists());

    Ok(())
}

#[tokio::test]
async fn test_changed_bytecode_upgrades_module_and_dependents() -> Result<()> {
    let ctx = TestContext::new();
    ctx.controller(provider(), 1).run(&target(), &chain()).await?;
    let before = ctx.store.load(&target())?;

    let upgraded = provider().with(artifact("A", "0x6011", &[], &[]));
    let outcome = ctx.controller(upgraded, 1).run(&target(), &chain()).await?;

    assert_eq!(outcome.plan.kind_of("A"), Some(StepKind::Upgrade));
    assert_eq!(outcome.plan.kind_of("B"), Some(StepKind::Upgrade));
    assert_eq!(outcome.plan.kind_of("C"), Some(StepKind::NoOp));
    assert_eq!(ctx.layer.deployed_modules(), vec!["A", "B", "C", "A", "B"]);

    let after = ctx.store.load(&target())?;
    let (a_before, a_after) = (&before.contracts["A"], &after.contracts["A"]);
    assert_ne!(a_before.fingerprint, a_after.fingerprint);
    assert_eq!(a_after.deployed_address, MockTransactionLayer::address_for(4));
    assert_ne!(before.contracts["B"].fingerprint, after.contracts["B"].fingerprint);
    assert_eq!(before.contracts["C"], after.contracts["C"]);
    assert!(after.is_completed());

    Ok(())
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() -> Result<()> {
    let ctx = TestContext::new();
    ctx.controller(provider(), 4).run(&target(), &chain()).await?;
    let before = ctx.manifest_bytes();
    let submitted = ctx.layer.submitted().len();

    let _held = ctx.store.lock(&target())?;
    let upgraded = provider().with(artifact("C", "0x6033", &[], &[]));
    let err = ctx
        .controller(upgraded, 4)
        .run(&target(), &chain())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ConcurrentRunDetected { .. }));
    assert_eq!(ctx.layer.submitted().len(), submitted);
    assert_eq!(ctx.manifest_bytes(), before);

    Ok(())
}

#[tokio::test]
async fn test_failed_upgrade_clears_completed_flag() -> Result<()> {
    let ctx = TestContext::new();
    ctx.controller(provider(), 4).run(&target(), &chain()).await?;
    assert!(ctx.store.load(&target())?.is_completed());

    ctx.layer.fail("C", Phase::Submit, TxError::Rejected("nope".to_string()), 1);
    let upgraded = provider().with(artifact("C", "0x6033", &[], &[]));
    ctx.controller(upgraded, 4)
        .run(&target(), &chain())
        .await
        .unwrap_err();

    let manifest = ctx.store.load(&target())?;
    assert!(!manifest.is_completed());
    assert_eq!(manifest.contracts.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_routed_modules_are_aggregated_behind_router() -> Result<()> {
    let ctx = TestContext::new();
    let artifacts = provider()
        .with(artifact(
            "OwnerModule",
            "0x6101",
            &["owner()", "nominateNewOwner(address)"],
            &[],
        ))
        .with(artifact(
            "ElectionModule",
            "0x6102",
            &["getEpochIndex()", "initializeElectionModule(address)"],
            &[],
        ));
    let definitions = vec![
        ModuleDefinition::new("owner").contract("OwnerModule").routed(true),
        ModuleDefinition::new("election")
            .contract("ElectionModule")
            .routed(true)
            .initializer(
                "initializeElectionModule(address)",
                vec![ConstructorArg::module("A")],
            ),
        ModuleDefinition::new("A"),
    ];

    let outcome = ctx
        .controller(artifacts.clone(), 1)
        .run(&target(), &definitions)
        .await?;

    assert_eq!(
        ctx.layer.deployed_modules(),
        vec!["A", "election", "owner", "router"]
    );
    assert_eq!(outcome.transactions, 6);

    let manifest = ctx.store.load(&target())?;
    let router = manifest.router_address().expect("router should be deployed");
    assert_eq!(router, MockTransactionLayer::address_for(4));
    assert!(manifest.contracts["router"].is_proxy);
    assert_eq!(manifest.contracts["owner"].proxy_address, Some(router));
    assert_eq!(manifest.contracts["election"].proxy_address, Some(router));
    assert_eq!(manifest.contracts["A"].proxy_address, None);
    assert!(manifest.contracts["election"].initialized);
    assert_eq!(manifest.router.entries.len(), 4);
    assert!(manifest.is_completed());

    let calls = ctx.layer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "router");
    assert_eq!(calls[0].1, router);
    assert_eq!(&calls[0].2[..4], &keccak256("setRoutes(bytes4[],address[])")[..4]);
    assert_eq!(calls[1].0, "election");
    assert_eq!(calls[1].1, router);
    assert_eq!(&calls[1].2[..4], &keccak256("initializeElectionModule(address)")[..4]);
    assert_eq!(
        &calls[1].2[calls[1].2.len() - 20..],
        manifest.contracts["A"].deployed_address.as_slice()
    );

    // Nothing changed: no transaction at all.
    let outcome = ctx
        .controller(artifacts.clone(), 1)
        .run(&target(), &definitions)
        .await?;
    assert!(outcome.was_noop());

    // A new owner implementation only needs a redeploy and one table update.
    let upgraded = artifacts.with(artifact(
        "OwnerModule",
        "0x6201",
        &["owner()", "nominateNewOwner(address)"],
        &[],
    ));
    let outcome = ctx.controller(upgraded, 1).run(&target(), &definitions).await?;
    assert_eq!(outcome.transactions, 2);
    assert_eq!(ctx.layer.deployed_modules().last().map(String::as_str), Some("owner"));
    assert_eq!(ctx.layer.calls().len(), 3);

    let manifest = ctx.store.load(&target())?;
    assert_eq!(manifest.router_address(), Some(router));
    assert_eq!(manifest.contracts["owner"].proxy_address, Some(router));
    assert!(
        manifest
            .router
            .entries
            .iter()
            .filter(|entry| entry.module == "owner")
            .all(|entry| entry.implementation == manifest.contracts["owner"].deployed_address)
    );

    Ok(())
}

#[tokio::test]
async fn test_standalone_initializer_runs_after_deploy() -> Result<()> {
    let ctx = TestContext::new();
    let artifacts = provider().with(artifact("Token", "0x6301", &["initialize(uint256)"], &[]));
    let definitions = vec![
        ModuleDefinition::new("token")
            .contract("Token")
            .initializer("initialize(uint256)", vec![ConstructorArg::value(1000)]),
    ];

    ctx.controller(artifacts.clone(), 1)
        .run(&target(), &definitions)
        .await?;

    let manifest = ctx.store.load(&target())?;
    let token = &manifest.contracts["token"];
    assert!(token.initialized);

    let calls = ctx.layer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, token.deployed_address);

    let outcome = ctx.controller(artifacts, 1).run(&target(), &definitions).await?;
    assert!(outcome.was_noop());

    Ok(())
}

#[tokio::test]
async fn test_upgraded_initializer_reference_reinitializes() -> Result<()> {
    let ctx = TestContext::new();
    let artifacts = provider().with(artifact("X", "0x6401", &["setA(address)"], &[]));
    let definitions = vec![
        ModuleDefinition::new("A"),
        ModuleDefinition::new("X")
            .contract("X")
            .initializer("setA(address)", vec![ConstructorArg::module("A")]),
    ];

    ctx.controller(artifacts.clone(), 1)
        .run(&target(), &definitions)
        .await?;
    assert_eq!(ctx.layer.calls().len(), 1);

    let upgraded = artifacts.with(artifact("A", "0x6011", &[], &[]));
    let outcome = ctx
        .controller(upgraded.clone(), 1)
        .run(&target(), &definitions)
        .await?;

    assert_eq!(outcome.plan.kind_of("A"), Some(StepKind::Upgrade));
    assert_eq!(outcome.plan.kind_of("X"), Some(StepKind::NoOp));
    let init = outcome
        .plan
        .steps
        .iter()
        .find(|step| step.kind == StepKind::Initialize)
        .expect("X should be initialized again");
    assert_eq!(init.module, "X");
    assert_eq!(init.prerequisites, vec![0]);
    assert_eq!(outcome.transactions, 2);
    assert_eq!(ctx.layer.deployed_modules(), vec!["A", "X", "A"]);

    // X is now wired to A's new address.
    let manifest = ctx.store.load(&target())?;
    let calls = ctx.layer.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1, manifest.contracts["X"].deployed_address);
    assert_eq!(
        &calls[1].2[calls[1].2.len() - 20..],
        manifest.contracts["A"].deployed_address.as_slice()
    );

    let outcome = ctx.controller(upgraded, 1).run(&target(), &definitions).await?;
    assert!(outcome.was_noop());

    Ok(())
}

#[tokio::test]
async fn test_upgraded_routed_module_keeps_initialization() -> Result<()> {
    let ctx = TestContext::new();
    let election = |code: &str| {
        artifact(
            "ElectionModule",
            code,
            &["getEpochIndex()", "initializeElectionModule(uint256)"],
            &[],
        )
    };
    let artifacts = provider().with(election("0x6102"));
    let definitions = vec![
        ModuleDefinition::new("election")
            .contract("ElectionModule")
            .routed(true)
            .initializer(
                "initializeElectionModule(uint256)",
                vec![ConstructorArg::value(7)],
            ),
    ];

    ctx.controller(artifacts.clone(), 1)
        .run(&target(), &definitions)
        .await?;
    let before = ctx.store.load(&target())?.contracts["election"].clone();
    assert!(before.initialized);

    let upgraded = artifacts.with(election("0x6202"));
    let outcome = ctx
        .controller(upgraded.clone(), 1)
        .run(&target(), &definitions)
        .await?;

    assert_eq!(outcome.plan.kind_of("election"), Some(StepKind::Upgrade));
    assert!(outcome.plan.router_initializers.is_empty());
    // The redeploy and one routing table update, no second initializer call.
    assert_eq!(outcome.transactions, 2);
    let initializer_calls = ctx
        .layer
        .calls()
        .iter()
        .filter(|(module, ..)| module == "election")
        .count();
    assert_eq!(initializer_calls, 1);

    let after = ctx.store.load(&target())?.contracts["election"].clone();
    assert_ne!(after.deployed_address, before.deployed_address);
    assert!(after.initialized);
    assert_eq!(after.initializer_fingerprint, before.initializer_fingerprint);

    let outcome = ctx.controller(upgraded, 1).run(&target(), &definitions).await?;
    assert!(outcome.was_noop());

    Ok(())
}

#[tokio::test]
async fn test_cancel_while_step_in_flight() -> Result<()> {
    let ctx = TestContext::with_layer(|layer| layer.receipt_delay(Duration::from_millis(50)));
    let definitions = vec![
        ModuleDefinition::new("A"),
        ModuleDefinition::new("B").arg(ConstructorArg::module("A")),
    ];

    // Cancel as soon as A is on its way.
    let (handle, signal) = cancel_channel();
    let layer = ctx.layer.clone();
    tokio::spawn(async move {
        while layer.submitted().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        handle.cancel();
    });

    let err = ctx
        .controller(provider(), 4)
        .cancel_signal(signal)
        .run(&target(), &definitions)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Cancelled { completed: 1 }), "{err}");
    assert_eq!(ctx.layer.deployed_modules(), vec!["A"]);
    assert_eq!(ctx.layer.confirmed(), vec!["A"]);

    let manifest = ctx.store.load(&target())?;
    assert!(manifest.module("A").found().is_some(), "In-flight step must be recorded");
    assert!(manifest.module("B").found().is_none());
    assert!(!manifest.is_completed());

    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_sends_nothing() -> Result<()> {
    let ctx = TestContext::new();
    let (handle, signal) = cancel_channel();
    handle.cancel();

    let err = ctx
        .controller(provider(), 4)
        .cancel_signal(signal)
        .run(&target(), &chain())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Cancelled { completed: 0 }));
    assert!(ctx.layer.submitted().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_legacy_manifest_is_redeployed() -> Result<()> {
    let ctx = TestContext::new();
    let path = ctx.manifest_path();
    std::fs::create_dir_all(path.parent().expect("manifest has a parent directory"))?;
    std::fs::write(
        &path,
        serde_json::json!({
            "A": {
                "address": "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512",
                "contract": "A",
                "constructorArguments": [],
                "tx": "0x0202020202020202020202020202020202020202020202020202020202020202"
            }
        })
        .to_string(),
    )?;

    let outcome = ctx
        .controller(provider(), 4)
        .run(&target(), &[ModuleDefinition::new("A")])
        .await?;

    assert_eq!(outcome.plan.kind_of("A"), Some(StepKind::Upgrade));
    assert_eq!(ctx.layer.deployed_modules(), vec!["A"]);

    let document: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(document["version"], 2);
    assert_eq!(document["properties"]["completed"], true);

    Ok(())
}

#[tokio::test]
async fn test_plan_is_a_dry_run() -> Result<()> {
    let ctx = TestContext::new();
    let controller = ctx.controller(provider(), 4);

    let plan = controller.plan(&target(), &chain())?;

    assert_eq!(plan.order, vec!["A", "B", "C"]);
    assert_eq!(plan.pending_steps(), 3);
    assert!(ctx.layer.submitted().is_empty());
    assert!(!ctx.store.root().exists(), "A dry run must not touch the disk");

    Ok(())
}
