//! Router aggregation: one routing table for every routed module.
//!
//! Routed modules are not called at their own address. Their external functions are
//! registered in a single router contract, keyed by 4-byte selector, and callers go through
//! the router. The table is rebuilt from the modules' ABIs on every run and written to the
//! router in one aggregate transaction whenever it differs from what was last recorded.

use std::collections::BTreeMap;

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Selector},
};
use serde::{Deserialize, Serialize};

use crate::{
    artifact::{ArtifactProvider, encode_typed_call},
    diff::{Plan, StepKind, deployed_address, initializer_fingerprint},
    error::{DeployError, DeployResult},
    executor::{StepExecutor, initializer_request},
    fingerprint::Fingerprint,
    manifest::{Manifest, ModuleRecord, RouterEntry},
    module::{ConstructorArg, DeployableModule, ModuleUnit, resolve_args},
    transaction::{TransactionLayer, TxError, TxRequest},
};

/// Manifest key of the router record.
pub const DEFAULT_ROUTER_NAME: &str = "router";

/// Artifact the router is deployed from.
pub const DEFAULT_ROUTER_CONTRACT: &str = "Router";

/// Function receiving the full routing table.
pub const DEFAULT_UPDATE_SIGNATURE: &str = "setRoutes(bytes4[],address[])";

/// How the router is deployed and updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Name of the router record in the manifest.
    pub name: String,
    /// Router artifact.
    pub contract: String,
    /// Router constructor arguments.
    pub args: Vec<ConstructorArg>,
    /// Signature of the aggregate update function, taking the selectors and their
    /// implementation addresses as two parallel arrays.
    pub update_signature: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_ROUTER_NAME.to_string(),
            contract: DEFAULT_ROUTER_CONTRACT.to_string(),
            args: Vec::new(),
            update_signature: DEFAULT_UPDATE_SIGNATURE.to_string(),
        }
    }
}

/// A selector and the module serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub selector: Selector,
    pub module: String,
    pub signature: String,
}

/// Router work a plan implies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterPlan {
    /// Desired table, sorted by selector.
    pub routes: Vec<Route>,
    /// The router has to be deployed first.
    pub deploy_router: bool,
    /// The recorded table is stale.
    pub update_routes: bool,
}

impl RouterPlan {
    pub fn has_work(&self) -> bool {
        self.deploy_router || self.update_routes
    }
}

/// Build the routing table of `modules`.
///
/// Fails with [`DeployError::SelectorCollision`] when two modules expose the same selector.
pub fn collect_routes<'m, M, I>(modules: I) -> DeployResult<Vec<Route>>
where
    M: DeployableModule + 'm,
    I: IntoIterator<Item = &'m M>,
{
    let mut by_selector: BTreeMap<Selector, Vec<(&str, String)>> = BTreeMap::new();
    for module in modules {
        for function in module.interface_selectors() {
            by_selector
                .entry(function.selector)
                .or_default()
                .push((module.name(), function.signature));
        }
    }

    let mut routes = Vec::with_capacity(by_selector.len());
    for (selector, mut owners) in by_selector {
        if owners.len() > 1 {
            owners.sort();
            return Err(DeployError::SelectorCollision {
                selector,
                modules: owners
                    .into_iter()
                    .map(|(module, signature)| format!("{module}.{signature}"))
                    .collect(),
            });
        }
        if let Some((module, signature)) = owners.pop() {
            routes.push(Route {
                selector,
                module: module.to_string(),
                signature,
            });
        }
    }

    Ok(routes)
}

/// Decide what the router phase of a run has to do.
pub(crate) fn plan_routes(
    units: &BTreeMap<String, ModuleUnit>,
    kinds: &BTreeMap<&str, StepKind>,
    manifest: &Manifest,
) -> DeployResult<RouterPlan> {
    let routes = collect_routes(units.values())?;
    let any_routed = units.values().any(ModuleUnit::is_routed);
    let deploy_router = any_routed && manifest.router_address().is_none();

    // Implementations of modules redeployed in this run are only known afterwards.
    let desired: Option<Vec<RouterEntry>> = routes
        .iter()
        .map(|route| {
            if kinds.get(route.module.as_str()) != Some(&StepKind::NoOp) {
                return None;
            }
            deployed_address(manifest, &route.module).map(|implementation| RouterEntry {
                selector: route.selector,
                module: route.module.clone(),
                signature: route.signature.clone(),
                implementation,
            })
        })
        .collect();

    let update_routes = deploy_router
        || desired.is_none_or(|entries| entries != manifest.router.entries);

    tracing::debug!(
        routes = routes.len(),
        deploy_router,
        update_routes,
        "Router planned"
    );

    Ok(RouterPlan {
        routes,
        deploy_router,
        update_routes,
    })
}

/// Applies the router phase of a plan.
pub struct RouterAggregator<'a, T, A: ?Sized> {
    executor: &'a StepExecutor<'a, T>,
    artifacts: &'a A,
    settings: &'a RouterSettings,
}

impl<'a, T, A> RouterAggregator<'a, T, A>
where
    T: TransactionLayer,
    A: ArtifactProvider + ?Sized,
{
    pub fn new(
        executor: &'a StepExecutor<'a, T>,
        artifacts: &'a A,
        settings: &'a RouterSettings,
    ) -> Self {
        Self {
            executor,
            artifacts,
            settings,
        }
    }

    /// Deploy the router if needed, write the routing table and run routed initializers.
    ///
    /// Returns the number of transactions sent.
    pub async fn aggregate(&self, plan: &Plan, manifest: &mut Manifest) -> DeployResult<usize> {
        let routes = collect_routes(plan.units.values())?;
        let any_routed = plan.units.values().any(ModuleUnit::is_routed);
        let mut transactions = 0;

        let router = match manifest.router_address() {
            Some(address) => Some(address),
            None if any_routed => {
                transactions += 1;
                Some(self.deploy_router(manifest).await?)
            }
            None => None,
        };

        let mut changed = relink(plan, manifest, router);

        if let Some(router) = router {
            let entries = routes
                .iter()
                .map(|route| {
                    let implementation =
                        deployed_address(manifest, &route.module).ok_or_else(|| {
                            DeployError::encoding(
                                &route.module,
                                "routing table",
                                "module has no deployment record",
                            )
                        })?;
                    Ok::<_, DeployError>(RouterEntry {
                        selector: route.selector,
                        module: route.module.clone(),
                        signature: route.signature.clone(),
                        implementation,
                    })
                })
                .collect::<DeployResult<Vec<_>>>()?;

            if entries != manifest.router.entries {
                self.write_routes(router, &entries).await?;
                transactions += 1;
                manifest.router.entries = entries;
                changed = true;
            } else {
                tracing::info!(routes = entries.len(), "Routing table is up to date");
            }
        }

        if changed {
            self.executor.persist(manifest)?;
        }

        for name in &plan.router_initializers {
            let (Some(router), Some(unit)) = (router, plan.unit(name)) else {
                continue;
            };
            let request = initializer_request(manifest, unit.definition(), router)?;
            let receipt = self
                .executor
                .send(&request)
                .await
                .map_err(|cause| step_failed(name, StepKind::Initialize, cause))?;
            transactions += 1;

            let fingerprint = initializer_fingerprint(manifest, unit.definition());
            if let Some(record) = manifest.contracts.get_mut(name) {
                record.initialized = true;
                record.initializer_fingerprint = fingerprint;
            }
            tracing::info!(
                module = %name,
                tx = %receipt.tx_hash,
                "Module initialized through router"
            );
            self.executor.persist(manifest)?;
        }

        Ok(transactions)
    }

    async fn deploy_router(&self, manifest: &mut Manifest) -> DeployResult<Address> {
        let name = &self.settings.name;
        let artifact = self.artifacts.artifact(&self.settings.contract)?;

        let args = resolve_args(&self.settings.args, |module| deployed_address(manifest, module))
            .map_err(|missing| {
                DeployError::encoding(
                    name,
                    "constructor arguments",
                    format!("module '{missing}' has no deployment record"),
                )
            })?;
        let code = artifact.creation_code(name, &args)?;

        tracing::info!(router = %name, contract = %self.settings.contract, "Deploying router...");
        let receipt = self
            .executor
            .send(&TxRequest::Deploy {
                module: name.clone(),
                code,
            })
            .await
            .map_err(|cause| step_failed(name, StepKind::Deploy, cause))?;

        let address = receipt.contract_address.ok_or_else(|| {
            step_failed(
                name,
                StepKind::Deploy,
                TxError::Rejected("receipt carries no contract address".to_string()),
            )
        })?;

        let mut record = ModuleRecord::new(
            address,
            Fingerprint::compute(&artifact.bytecode, &args),
            receipt.tx_hash,
        );
        record.is_proxy = true;
        record.contract = Some(self.settings.contract.clone());

        *manifest = manifest.clone().record_module(name.clone(), record);
        self.executor.persist(manifest)?;

        tracing::info!(router = %name, address = %address, "Router deployed");
        Ok(address)
    }

    async fn write_routes(&self, router: Address, entries: &[RouterEntry]) -> DeployResult<()> {
        let name = &self.settings.name;
        let selectors = entries
            .iter()
            .map(|entry| {
                DynSolValue::FixedBytes(B256::right_padding_from(entry.selector.as_slice()), 4)
            })
            .collect();
        let implementations = entries
            .iter()
            .map(|entry| DynSolValue::Address(entry.implementation))
            .collect();

        let data = encode_typed_call(
            name,
            &self.settings.update_signature,
            &[
                DynSolValue::Array(selectors),
                DynSolValue::Array(implementations),
            ],
        )?;

        tracing::info!(router = %router, routes = entries.len(), "Updating routing table...");
        let receipt = self
            .executor
            .send(&TxRequest::Call {
                module: name.clone(),
                to: router,
                data,
            })
            .await
            .map_err(|cause| step_failed(name, StepKind::Upgrade, cause))?;

        tracing::info!(tx = %receipt.tx_hash, "Routing table updated");
        Ok(())
    }
}

/// Point routed records at the router and detach standalone ones.
///
/// Returns whether a record changed.
fn relink(plan: &Plan, manifest: &mut Manifest, router: Option<Address>) -> bool {
    let mut changed = false;
    for (name, unit) in &plan.units {
        let Some(record) = manifest.contracts.get_mut(name) else {
            continue;
        };
        let proxy = if unit.is_routed() { router } else { None };
        if record.proxy_address != proxy {
            record.proxy_address = proxy;
            changed = true;
        }
    }
    changed
}

fn step_failed(module: &str, kind: StepKind, cause: TxError) -> DeployError {
    DeployError::StepFailed {
        module: module.to_string(),
        kind,
        cause,
    }
}
