//! Step execution: dispatch, retry and persist-after-every-step.

use std::{
    collections::BTreeSet,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use futures::{StreamExt, stream::FuturesUnordered};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    artifact::encode_call,
    diff::{DeploymentStep, Plan, StepKind, deployed_address, initializer_fingerprint},
    error::{DeployError, DeployResult},
    fingerprint::Fingerprint,
    manifest::{Manifest, ManifestStore, ModuleRecord},
    module::{ModuleDefinition, resolve_args},
    transaction::{PendingTx, Receipt, TransactionLayer, TxError, TxRequest},
};

/// Default number of steps allowed in flight at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Default number of retries of a transient failure.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Tuning of the step executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of independent steps in flight together. Values below 1 act as 1.
    pub max_in_flight: usize,
    /// Retries of a transient failure before the step fails.
    pub max_retries: usize,
    /// First backoff delay.
    #[serde(with = "millis", rename = "min_backoff_ms")]
    pub min_backoff: Duration,
    /// Upper bound of the backoff delay.
    #[serde(with = "millis", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Receiving side of a cancellation request.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self(receiver)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Sending side of a cancellation request.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Ask the run to stop dispatching new steps.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Create a linked cancellation handle and signal.
pub fn cancel_channel() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle(sender), CancelSignal(receiver))
}

/// Outcome of a fully executed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Steps completed, no-ops included.
    pub completed: usize,
    /// Transactions confirmed.
    pub transactions: usize,
}

/// A step whose inputs have been resolved against the manifest.
struct PreparedStep {
    request: TxRequest,
    /// Fingerprint the new record gets, for deploy and upgrade steps.
    fingerprint: Option<Fingerprint>,
    /// Initializer fingerprint recorded by initialize steps.
    initializer_fingerprint: Option<Fingerprint>,
}

/// Runs deployment steps against a transaction layer, persisting the manifest after each one.
pub struct StepExecutor<'a, T> {
    transactions: &'a T,
    store: &'a ManifestStore,
    config: &'a ExecutorConfig,
    cancel: CancelSignal,
}

impl<'a, T: TransactionLayer> StepExecutor<'a, T> {
    pub fn new(
        transactions: &'a T,
        store: &'a ManifestStore,
        config: &'a ExecutorConfig,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            transactions,
            store,
            config,
            cancel,
        }
    }

    /// Execute the batch of `plan`, updating and saving `manifest` as steps complete.
    ///
    /// A step is dispatched once all its prerequisites are persisted. After the first failure
    /// or a cancellation request nothing new is dispatched, but steps already in flight run to
    /// completion and are recorded.
    pub async fn execute(&self, plan: &Plan, manifest: &mut Manifest) -> DeployResult<BatchReport> {
        let mut done: BTreeSet<usize> = BTreeSet::new();
        let mut waiting: BTreeSet<usize> = BTreeSet::new();
        for step in &plan.steps {
            if step.kind == StepKind::NoOp {
                done.insert(step.id);
            } else {
                waiting.insert(step.id);
            }
        }

        let max_in_flight = self.config.max_in_flight.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<DeployError> = None;
        let mut transactions = 0;

        loop {
            if failure.is_none() && !self.cancel.is_cancelled() {
                let ready: Vec<usize> = waiting
                    .iter()
                    .copied()
                    .filter(|id| {
                        plan.steps[*id]
                            .prerequisites
                            .iter()
                            .all(|prerequisite| done.contains(prerequisite))
                    })
                    .collect();

                for id in ready {
                    if in_flight.len() >= max_in_flight {
                        break;
                    }
                    let step = &plan.steps[id];
                    match self.prepare(plan, step, manifest) {
                        Ok(prepared) => {
                            waiting.remove(&id);
                            tracing::info!(
                                module = %step.module,
                                kind = %step.kind,
                                "Dispatching step..."
                            );
                            in_flight.push(self.run_step(step, prepared));
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }

            let Some((step, prepared, result)) = in_flight.next().await else {
                break;
            };

            let applied = result
                .map_err(|cause| DeployError::StepFailed {
                    module: step.module.clone(),
                    kind: step.kind,
                    cause,
                })
                .and_then(|receipt| self.apply(plan, step, prepared, receipt, manifest));

            match applied {
                Ok(()) => {
                    done.insert(step.id);
                    transactions += 1;
                }
                Err(e) => {
                    tracing::error!(
                        module = %step.module,
                        kind = %step.kind,
                        err = %e,
                        "Step failed"
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        if !waiting.is_empty() {
            tracing::warn!(
                completed = done.len(),
                remaining = waiting.len(),
                "Cancellation requested, stopping before the remaining steps"
            );
            return Err(DeployError::Cancelled {
                completed: done.len(),
            });
        }

        Ok(BatchReport {
            completed: done.len(),
            transactions,
        })
    }

    fn prepare(
        &self,
        plan: &Plan,
        step: &DeploymentStep,
        manifest: &Manifest,
    ) -> DeployResult<PreparedStep> {
        let unit = plan.unit(&step.module).ok_or_else(|| {
            DeployError::encoding(&step.module, "step", "module is not part of the plan")
        })?;

        match step.kind {
            StepKind::Deploy | StepKind::Upgrade => {
                let args = resolve_args(&unit.definition().args, |module| {
                    deployed_address(manifest, module)
                })
                .map_err(|missing| {
                    DeployError::encoding(
                        &step.module,
                        "constructor arguments",
                        format!("module '{missing}' has no deployment record"),
                    )
                })?;

                let code = unit.artifact().creation_code(&step.module, &args)?;
                Ok(PreparedStep {
                    request: TxRequest::Deploy {
                        module: step.module.clone(),
                        code,
                    },
                    fingerprint: Some(Fingerprint::compute(&unit.artifact().bytecode, &args)),
                    initializer_fingerprint: None,
                })
            }
            StepKind::Initialize => {
                let to = manifest
                    .module(&step.module)
                    .found()
                    .map(ModuleRecord::callable_address)
                    .ok_or_else(|| {
                        DeployError::encoding(&step.module, "initializer", "module is not deployed")
                    })?;
                Ok(PreparedStep {
                    request: initializer_request(manifest, unit.definition(), to)?,
                    fingerprint: None,
                    initializer_fingerprint: initializer_fingerprint(manifest, unit.definition()),
                })
            }
            StepKind::NoOp => Err(DeployError::encoding(
                &step.module,
                "step",
                "no-op steps have no transaction",
            )),
        }
    }

    async fn run_step<'s>(
        &self,
        step: &'s DeploymentStep,
        prepared: PreparedStep,
    ) -> (&'s DeploymentStep, PreparedStep, Result<Receipt, TxError>) {
        let result = self.send(&prepared.request).await;
        (step, prepared, result)
    }

    /// Record a confirmed step and persist the manifest.
    fn apply(
        &self,
        plan: &Plan,
        step: &DeploymentStep,
        prepared: PreparedStep,
        receipt: Receipt,
        manifest: &mut Manifest,
    ) -> DeployResult<()> {
        match prepared.fingerprint {
            Some(fingerprint) => {
                let address = receipt.contract_address.ok_or_else(|| DeployError::StepFailed {
                    module: step.module.clone(),
                    kind: step.kind,
                    cause: TxError::Rejected("receipt carries no contract address".to_string()),
                })?;

                let mut record = ModuleRecord::new(address, fingerprint, receipt.tx_hash);
                if let Some(unit) = plan.unit(&step.module) {
                    record.contract = Some(unit.definition().contract_name().to_string());
                    if unit.is_routed() {
                        record.proxy_address = manifest.router_address();
                        // Routed initializers run once, an upgrade keeps the initialization.
                        if let Some(previous) = manifest.module(&step.module).found() {
                            record.initialized = previous.initialized;
                            record.initializer_fingerprint =
                                previous.initializer_fingerprint.clone();
                        }
                    }
                }

                tracing::info!(
                    module = %step.module,
                    kind = %step.kind,
                    address = %address,
                    tx = %receipt.tx_hash,
                    "Module deployed"
                );
                *manifest = manifest.clone().record_module(step.module.clone(), record);
            }
            None => {
                if let Some(record) = manifest.contracts.get_mut(&step.module) {
                    record.initialized = true;
                    record.initializer_fingerprint = prepared.initializer_fingerprint;
                }
                tracing::info!(module = %step.module, tx = %receipt.tx_hash, "Module initialized");
            }
        }

        self.persist(manifest)
    }

    /// Stamp and save `manifest`.
    pub(crate) fn persist(&self, manifest: &mut Manifest) -> DeployResult<()> {
        manifest.touch();
        self.store.save(manifest)
    }

    /// Submit `request` and wait for its receipt, retrying transient failures.
    ///
    /// Once a submission went through, retries poll the same transaction instead of sending
    /// a second one.
    pub(crate) async fn send(&self, request: &TxRequest) -> Result<Receipt, TxError> {
        let pending: Mutex<Option<PendingTx>> = Mutex::new(None);
        let pending = &pending;
        let transactions = self.transactions;

        let attempt = move || async move {
            let submitted = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            let tx = match submitted {
                Some(tx) => tx,
                None => {
                    let tx = transactions.submit(request).await?;
                    *pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());
                    tx
                }
            };

            transactions.await_receipt(&tx).await
        };

        attempt
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(TxError::is_transient)
            .notify(|err: &TxError, delay: Duration| {
                tracing::warn!(
                    module = request.module(),
                    err = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient transaction failure, retrying..."
                );
            })
            .await
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.min_backoff)
            .with_max_delay(self.config.max_backoff)
            .with_max_times(self.config.max_retries)
            .with_jitter()
    }
}

/// Call to `definition`'s initializer at `to`.
///
/// Module references in the initializer arguments resolve to callable addresses.
pub(crate) fn initializer_request(
    manifest: &Manifest,
    definition: &ModuleDefinition,
    to: alloy_core::primitives::Address,
) -> DeployResult<TxRequest> {
    let Some(initializer) = &definition.initializer else {
        return Err(DeployError::encoding(
            &definition.name,
            "initializer",
            "module declares no initializer",
        ));
    };

    let args = resolve_args(&initializer.args, |module| {
        manifest
            .module(module)
            .found()
            .map(ModuleRecord::callable_address)
    })
    .map_err(|missing| {
        DeployError::encoding(
            &definition.name,
            "initializer arguments",
            format!("module '{missing}' has no deployment record"),
        )
    })?;

    Ok(TxRequest::Call {
        module: definition.name.clone(),
        to,
        data: encode_call(&definition.name, &initializer.signature, &args)?,
    })
}
