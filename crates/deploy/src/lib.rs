//! hoist-deploy - Deployment manifest and migration orchestrator for on-chain modules.
//!
//! This crate decides which contract modules of a project must be (re)deployed to a target
//! network, deploys them in dependency order, wires routed modules behind a single router
//! and keeps a manifest of what exists on each target so every run is incremental and
//! resumable.

mod artifact;
pub use artifact::{
    Artifact, ArtifactProvider, CachedProvider, DirArtifactProvider, InterfaceFunction,
    StaticProvider, encode_call, encode_typed_call,
};

mod config;
pub use config::{
    CONFIG_FILENAME, DEFAULT_INSTANCE, ENV_PREFIX, ExecutorSection, HoistConfig, NetworkConfig,
    ProjectConfig,
};

mod controller;
pub use controller::{ResumeController, RunContext, RunOutcome, RunSettings, RunState};

mod diff;
pub use diff::{DeploymentStep, Plan, StepKind, diff};

mod error;
pub use error::{DeployError, DeployResult};

mod executor;
pub use executor::{
    BatchReport, CancelHandle, CancelSignal, DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_RETRIES,
    ExecutorConfig, StepExecutor, cancel_channel,
};

mod fingerprint;
pub use fingerprint::Fingerprint;

mod graph;
pub use graph::deployment_order;

pub mod manifest;
pub use manifest::{
    Lookup, MANIFEST_VERSION, Manifest, ManifestLock, ManifestStore, ModuleRecord,
    NetworkIdentity, Properties, RouterEntry, RouterTable,
};

mod module;
pub use module::{
    ConstructorArg, DeployableModule, InitializerCall, ModuleDefinition, ModuleUnit,
    PreparedModule, resolve_args,
};

mod query;
pub use query::{Check, CodeSource, ManifestQuery, RpcCodeSource, VerificationReport};

mod router;
pub use router::{
    DEFAULT_ROUTER_CONTRACT, DEFAULT_ROUTER_NAME, DEFAULT_UPDATE_SIGNATURE, Route, RouterAggregator,
    RouterPlan, RouterSettings, collect_routes,
};

pub mod rpc;

mod transaction;
pub use transaction::{
    DEFAULT_POLL_INTERVAL, DEFAULT_RECEIPT_TIMEOUT, PendingTx, Receipt, RpcTransactionLayer,
    TransactionLayer, TxError, TxRequest,
};
