//! Classification of desired modules against the manifest.
//!
//! The diff only looks at definitions, artifacts and the manifest. It never talks to the
//! network, so a plan can always be computed offline.

use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use serde::Serialize;

use crate::{
    artifact::ArtifactProvider,
    error::{DeployError, DeployResult},
    fingerprint::Fingerprint,
    manifest::Manifest,
    module::{ConstructorArg, ModuleDefinition, ModuleUnit, PreparedModule, resolve_args},
    router::{self, RouterPlan, RouterSettings},
};

/// What has to happen to a module.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// No record exists yet.
    Deploy,
    /// A record exists but no longer matches the desired fingerprint.
    Upgrade,
    /// Call the module's initializer.
    Initialize,
    /// The record is current.
    NoOp,
}

impl StepKind {
    /// Whether the step creates a new contract.
    pub fn deploys(self) -> bool {
        matches!(self, StepKind::Deploy | StepKind::Upgrade)
    }
}

/// One unit of work in an execution batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentStep {
    /// Index of the step within its batch.
    pub id: usize,
    pub module: String,
    pub kind: StepKind,
    /// Steps that must have completed and been persisted first. Always lower ids.
    pub prerequisites: Vec<usize>,
}

/// Everything a run needs to converge the target to the desired state.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Modules in dependency order.
    pub order: Vec<String>,
    /// Prepared modules by name.
    pub units: BTreeMap<String, ModuleUnit>,
    /// The execution batch.
    pub steps: Vec<DeploymentStep>,
    /// Routed modules whose initializer runs through the router once it is aggregated.
    pub router_initializers: Vec<String>,
    pub router: RouterPlan,
}

impl Plan {
    pub fn unit(&self, name: &str) -> Option<&ModuleUnit> {
        self.units.get(name)
    }

    /// Classification of `name`'s deploy step.
    pub fn kind_of(&self, name: &str) -> Option<StepKind> {
        self.steps
            .iter()
            .find(|step| step.module == name && step.kind != StepKind::Initialize)
            .map(|step| step.kind)
    }

    /// Number of transactions the batch will send, router phase excluded.
    pub fn pending_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.kind != StepKind::NoOp).count()
    }

    /// True when applying the plan would not send a single transaction.
    pub fn is_noop(&self) -> bool {
        self.pending_steps() == 0 && self.router_initializers.is_empty() && !self.router.has_work()
    }
}

/// Classify every module of `order` against `manifest` and build the execution batch.
pub fn diff<A: ArtifactProvider + ?Sized>(
    order: &[String],
    definitions: &[ModuleDefinition],
    artifacts: &A,
    manifest: &Manifest,
    router_settings: &RouterSettings,
) -> DeployResult<Plan> {
    let by_name: BTreeMap<&str, &ModuleDefinition> =
        definitions.iter().map(|d| (d.name.as_str(), d)).collect();

    if by_name.contains_key(router_settings.name.as_str()) {
        return Err(DeployError::DuplicateModule(router_settings.name.clone()));
    }

    let mut kinds: BTreeMap<&str, StepKind> = BTreeMap::new();
    let mut units = BTreeMap::new();
    let mut steps: Vec<DeploymentStep> = Vec::new();
    // Last step touching a module that is not a no-op, for prerequisite wiring.
    let mut last_step: BTreeMap<&str, usize> = BTreeMap::new();
    let mut router_initializers = Vec::new();

    for name in order {
        let Some(&definition) = by_name.get(name.as_str()) else {
            continue;
        };
        let artifact = artifacts.artifact(definition.contract_name())?;
        let record = manifest.module(name).found();

        // References to modules that are redeployed in this run resolve only at execution.
        let inputs_changing = definition
            .address_inputs()
            .iter()
            .any(|input| kinds.get(input).is_some_and(|kind| *kind != StepKind::NoOp));

        let fingerprint = if inputs_changing {
            None
        } else {
            resolve_args(&definition.args, |module| deployed_address(manifest, module))
                .ok()
                .map(|args| Fingerprint::compute(&artifact.bytecode, &args))
        };

        let kind = match (record, &fingerprint) {
            (None, _) => StepKind::Deploy,
            (Some(record), Some(fingerprint)) if record.fingerprint == *fingerprint => {
                StepKind::NoOp
            }
            (Some(_), _) => StepKind::Upgrade,
        };

        tracing::debug!(
            module = %name,
            kind = %kind,
            fingerprint = fingerprint.as_ref().map(Fingerprint::short).unwrap_or("pending"),
            recorded = record.map(|r| r.fingerprint.short()).unwrap_or("none"),
            "Module classified"
        );

        let dependency_steps: Vec<usize> = {
            let mut ids: Vec<usize> = definition
                .dependencies()
                .iter()
                .filter_map(|dep| last_step.get(dep.as_str()).copied())
                .collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        let unit = ModuleUnit::new(PreparedModule {
            definition: definition.clone(),
            artifact,
            fingerprint,
        });

        let id = steps.len();
        steps.push(DeploymentStep {
            id,
            module: name.clone(),
            kind,
            prerequisites: if kind == StepKind::NoOp {
                Vec::new()
            } else {
                dependency_steps.clone()
            },
        });
        if kind != StepKind::NoOp {
            last_step.insert(name.as_str(), id);
        }

        // Initializer references take the address of modules earlier in the order.
        let initializer_inputs_changing = definition
            .initializer
            .iter()
            .flat_map(|init| init.args.iter())
            .filter_map(ConstructorArg::referenced_module)
            .any(|input| kinds.get(input).is_some_and(|kind| *kind != StepKind::NoOp));

        let needs_init = match (&definition.initializer, record) {
            (None, _) => false,
            (Some(_), None) => true,
            // Routed initializers are one-shot, upgrades keep the existing initialization.
            (Some(_), Some(record)) if definition.routed => {
                if record.initialized && initializer_inputs_changing {
                    tracing::warn!(
                        module = %name,
                        "Initializer inputs changed but routed initializers only run once"
                    );
                }
                !record.initialized
            }
            (Some(_), Some(record)) => {
                kind != StepKind::NoOp
                    || !record.initialized
                    || initializer_inputs_changing
                    || record.initializer_fingerprint.as_ref().is_some_and(|recorded| {
                        initializer_fingerprint(manifest, definition).as_ref() != Some(recorded)
                    })
            }
        };

        if needs_init {
            if unit.is_routed() {
                router_initializers.push(name.clone());
            } else {
                let mut prerequisites = dependency_steps;
                if kind != StepKind::NoOp {
                    prerequisites.push(id);
                }
                let init_id = steps.len();
                steps.push(DeploymentStep {
                    id: init_id,
                    module: name.clone(),
                    kind: StepKind::Initialize,
                    prerequisites,
                });
                last_step.insert(name.as_str(), init_id);
            }
        }

        kinds.insert(name.as_str(), kind);
        units.insert(name.clone(), unit);
    }

    let router = router::plan_routes(&units, &kinds, manifest)?;

    Ok(Plan {
        order: order.to_vec(),
        units,
        steps,
        router_initializers,
        router,
    })
}

/// Address a module reference resolves to for constructor arguments.
pub(crate) fn deployed_address(manifest: &Manifest, module: &str) -> Option<Address> {
    manifest.module(module).found().map(|r| r.deployed_address)
}

/// Fingerprint of `definition`'s initializer call against the current manifest.
///
/// References are taken at their deployed address, so the value only moves when a referenced
/// module is redeployed. `None` when a reference has no record yet.
pub(crate) fn initializer_fingerprint(
    manifest: &Manifest,
    definition: &ModuleDefinition,
) -> Option<Fingerprint> {
    let initializer = definition.initializer.as_ref()?;
    let args = resolve_args(&initializer.args, |module| deployed_address(manifest, module)).ok()?;
    Some(Fingerprint::compute(initializer.signature.as_bytes(), &args))
}
