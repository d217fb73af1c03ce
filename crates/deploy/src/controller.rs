//! The per-run state machine.

use std::fmt;

use crate::{
    artifact::ArtifactProvider,
    diff::{self, Plan},
    error::{DeployError, DeployResult},
    executor::{CancelSignal, ExecutorConfig, StepExecutor},
    graph,
    manifest::{Manifest, ManifestStore, NetworkIdentity},
    module::ModuleDefinition,
    router::{RouterAggregator, RouterSettings},
    transaction::TransactionLayer,
};

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum RunState {
    Loading,
    Graphing,
    Diffing,
    Executing,
    Aggregating,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// Transient state of one invocation.
#[derive(Debug)]
pub struct RunContext {
    pub target: NetworkIdentity,
    pub manifest: Manifest,
    /// Steps completed so far, no-ops included.
    pub position: usize,
    /// Transactions confirmed so far.
    pub transactions: usize,
    state: RunState,
    history: Vec<RunState>,
}

impl RunContext {
    fn new(target: NetworkIdentity) -> Self {
        Self {
            manifest: Manifest::empty(target.clone()),
            target,
            position: 0,
            transactions: 0,
            state: RunState::Loading,
            history: vec![RunState::Loading],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!(
            network = %self.target.name,
            instance = %self.target.instance,
            from = %self.state,
            to = %next,
            "Run state changed"
        );
        self.state = next;
        self.history.push(next);
    }
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RunOutcome {
    pub plan: Plan,
    pub manifest: Manifest,
    /// Transactions confirmed by this run.
    pub transactions: usize,
    /// States the run went through, in order.
    pub history: Vec<RunState>,
}

impl RunOutcome {
    /// The run found nothing to do.
    pub fn was_noop(&self) -> bool {
        self.transactions == 0
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} modules, {} transactions",
            self.manifest.network.name,
            self.manifest.network.instance,
            self.plan.order.len(),
            self.transactions
        )?;
        if let Some(router) = self.manifest.router_address() {
            write!(f, ", router at {router}")?;
        }
        Ok(())
    }
}

/// Settings of the orchestrator independent of the target.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub executor: ExecutorConfig,
    pub router: RouterSettings,
}

/// Drives a target from its recorded state to the desired one.
///
/// A run holds the target's manifest lock from start to end. Every confirmed step is
/// persisted before anything depending on it starts, so a run that stops for any reason can
/// be restarted and picks up where it left off.
pub struct ResumeController<T, A> {
    store: ManifestStore,
    transactions: T,
    artifacts: A,
    settings: RunSettings,
    cancel: CancelSignal,
}

impl<T, A> ResumeController<T, A>
where
    T: TransactionLayer,
    A: ArtifactProvider,
{
    pub fn new(store: ManifestStore, transactions: T, artifacts: A) -> Self {
        Self {
            store,
            transactions,
            artifacts,
            settings: RunSettings::default(),
            cancel: CancelSignal::never(),
        }
    }

    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn transactions(&self) -> &T {
        &self.transactions
    }

    /// Compute the plan for `target` without taking the lock or writing anything.
    pub fn plan(
        &self,
        target: &NetworkIdentity,
        definitions: &[ModuleDefinition],
    ) -> DeployResult<Plan> {
        let manifest = self.store.load(target)?;
        let order = graph::deployment_order(definitions)?;
        diff::diff(
            &order,
            definitions,
            &self.artifacts,
            &manifest,
            &self.settings.router,
        )
    }

    /// Converge `target` to `definitions`.
    pub async fn run(
        &self,
        target: &NetworkIdentity,
        definitions: &[ModuleDefinition],
    ) -> DeployResult<RunOutcome> {
        let _lock = self.store.lock(target)?;
        let mut context = RunContext::new(target.clone());

        match self.drive(&mut context, definitions).await {
            Ok(plan) => {
                let transactions = context.transactions;
                tracing::info!(
                    network = %target.name,
                    instance = %target.instance,
                    transactions,
                    "Deployment completed"
                );
                Ok(RunOutcome {
                    plan,
                    manifest: context.manifest,
                    transactions,
                    history: context.history,
                })
            }
            Err(e) => {
                let failed_in = context.state();
                context.transition(RunState::Failed);
                tracing::error!(
                    network = %target.name,
                    instance = %target.instance,
                    state = %failed_in,
                    position = context.position,
                    err = %e,
                    "Deployment failed"
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        context: &mut RunContext,
        definitions: &[ModuleDefinition],
    ) -> DeployResult<Plan> {
        context.manifest = self.store.load(&context.target)?;

        context.transition(RunState::Graphing);
        let order = graph::deployment_order(definitions)?;
        tracing::debug!(order = ?order, "Deployment order resolved");

        context.transition(RunState::Diffing);
        let plan = diff::diff(
            &order,
            definitions,
            &self.artifacts,
            &context.manifest,
            &self.settings.router,
        )?;
        tracing::info!(
            modules = plan.order.len(),
            pending = plan.pending_steps(),
            router_work = plan.router.has_work(),
            "Plan computed"
        );

        if context.manifest.is_completed() && plan.is_noop() {
            tracing::info!("Manifest is complete and nothing changed, skipping execution");
            context.position = plan.steps.len();
            context.transition(RunState::Completed);
            return Ok(plan);
        }

        let executor = StepExecutor::new(
            &self.transactions,
            &self.store,
            &self.settings.executor,
            self.cancel.clone(),
        );

        context.transition(RunState::Executing);
        if context.manifest.properties.completed {
            context.manifest.properties.completed = false;
            executor.persist(&mut context.manifest)?;
        }

        let report = executor.execute(&plan, &mut context.manifest).await?;
        context.position = report.completed;
        context.transactions += report.transactions;

        if self.cancel.is_cancelled() {
            return Err(DeployError::Cancelled {
                completed: context.position,
            });
        }

        context.transition(RunState::Aggregating);
        let aggregator = RouterAggregator::new(&executor, &self.artifacts, &self.settings.router);
        context.transactions += aggregator.aggregate(&plan, &mut context.manifest).await?;

        context.manifest.properties.completed = true;
        executor.persist(&mut context.manifest)?;
        context.transition(RunState::Completed);
        Ok(plan)
    }
}
