//! Error taxonomy for the orchestrator.

use std::path::PathBuf;

use alloy_core::primitives::Selector;
use thiserror::Error;

use crate::{diff::StepKind, transaction::TxError};

/// Result alias used across the orchestrator.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that abort a deployment run.
///
/// Every variant is fatal for the current run. Transient transaction errors never show up
/// here directly: they are retried by the executor and only surface wrapped in
/// [`DeployError::StepFailed`] once the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The persisted manifest cannot be trusted.
    #[error("corrupt manifest {}: {reason}", path.display())]
    CorruptManifest { path: PathBuf, reason: String },

    /// The module graph contains a cycle.
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A module depends on a module that is not defined.
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },

    /// Two definitions share the same name.
    #[error("module '{0}' is defined more than once")]
    DuplicateModule(String),

    /// Two routed modules expose the same external selector.
    #[error("selector {selector} is exposed by several modules: {}", modules.join(", "))]
    SelectorCollision {
        selector: Selector,
        modules: Vec<String>,
    },

    /// A step could not be completed.
    #[error("{kind} step for module '{module}' failed: {cause}")]
    StepFailed {
        module: String,
        kind: StepKind,
        #[source]
        cause: TxError,
    },

    /// Another run holds the lock for the same target.
    #[error("another run is already in progress for {network}/{instance}")]
    ConcurrentRunDetected { network: String, instance: String },

    /// The run observed a cancellation request.
    #[error("run cancelled after {completed} completed steps")]
    Cancelled { completed: usize },

    /// A build artifact could not be loaded.
    #[error("failed to load artifact '{contract}'")]
    Artifact {
        contract: String,
        #[source]
        source: anyhow::Error,
    },

    /// Arguments could not be resolved or ABI-encoded.
    #[error("failed to encode {what} for module '{module}': {reason}")]
    Encoding {
        module: String,
        what: &'static str,
        reason: String,
    },

    /// Filesystem failure while touching the manifest or its lock.
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptManifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn encoding(
        module: impl Into<String>,
        what: &'static str,
        reason: impl ToString,
    ) -> Self {
        Self::Encoding {
            module: module.into(),
            what,
            reason: reason.to_string(),
        }
    }
}
