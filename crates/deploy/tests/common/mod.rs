//! Shared fixtures for the orchestrator tests.

#![allow(dead_code)]

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_core::primitives::{Address, Bytes, TxHash, keccak256};
use hoist_deploy::{
    Artifact, ExecutorConfig, ManifestStore, NetworkIdentity, PendingTx, Receipt, RunSettings,
    StaticProvider, TransactionLayer, TxError, TxRequest,
};
use serde_json::json;

/// Initialize tracing for tests (idempotent).
pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn target() -> NetworkIdentity {
    NetworkIdentity::new("local", "official")
}

/// Executor settings with backoff short enough for tests.
pub fn fast_settings(max_in_flight: usize) -> RunSettings {
    RunSettings {
        executor: ExecutorConfig {
            max_in_flight,
            max_retries: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..RunSettings::default()
    }
}

/// Build an artifact exposing `functions` (full signatures) and a constructor taking
/// `constructor` parameter types.
pub fn artifact(contract: &str, code: &str, functions: &[&str], constructor: &[&str]) -> Artifact {
    let mut abi: Vec<serde_json::Value> = functions
        .iter()
        .map(|signature| {
            let (name, params) = signature
                .split_once('(')
                .expect("signature must contain parameters");
            let inputs: Vec<serde_json::Value> = params
                .trim_end_matches(')')
                .split(',')
                .filter(|ty| !ty.is_empty())
                .map(|ty| json!({ "name": "", "type": ty }))
                .collect();
            json!({
                "type": "function",
                "name": name,
                "inputs": inputs,
                "outputs": [],
                "stateMutability": "nonpayable"
            })
        })
        .collect();

    if !constructor.is_empty() {
        let inputs: Vec<serde_json::Value> = constructor
            .iter()
            .map(|ty| json!({ "name": "", "type": ty }))
            .collect();
        abi.push(json!({
            "type": "constructor",
            "inputs": inputs,
            "stateMutability": "nonpayable"
        }));
    }

    Artifact::from_json(contract, &json!({ "abi": abi, "bytecode": code }).to_string())
        .expect("Failed to build test artifact")
}

/// Artifacts of the default router plus `A`, `B` (constructor takes an address), `C`, `D`.
pub fn provider() -> StaticProvider {
    StaticProvider::new()
        .with(artifact("Router", "0x60ff", &["setRoutes(bytes4[],address[])"], &[]))
        .with(artifact("A", "0x6001", &[], &[]))
        .with(artifact("B", "0x6002", &[], &["address"]))
        .with(artifact("C", "0x6003", &[], &[]))
        .with(artifact("D", "0x6004", &[], &[]))
}

/// Which call of the transaction layer a scripted failure hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Submit,
    Receipt,
}

#[derive(Debug)]
struct ScriptedFailure {
    module: String,
    phase: Phase,
    error: TxError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MockState {
    nonce: u64,
    submit_attempts: usize,
    submitted: Vec<TxRequest>,
    pending: HashMap<TxHash, (u64, TxRequest)>,
    confirmed: Vec<String>,
    receipt_polls: usize,
    failures: Vec<ScriptedFailure>,
    in_flight: usize,
    max_in_flight: usize,
    /// For each submission, the modules recorded on disk at that moment.
    persisted_at_submit: Vec<(String, BTreeSet<String>)>,
}

/// In-memory ledger with deterministic addresses and scripted failures.
#[derive(Debug, Clone, Default)]
pub struct MockTransactionLayer {
    state: Arc<Mutex<MockState>>,
    receipt_delay: Duration,
    observe: Option<(ManifestStore, NetworkIdentity)>,
}

impl MockTransactionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every receipt for `delay`, so independent steps overlap.
    pub fn receipt_delay(mut self, delay: Duration) -> Self {
        self.receipt_delay = delay;
        self
    }

    /// Snapshot the manifest of `target` on every submission.
    pub fn observe(mut self, store: ManifestStore, target: NetworkIdentity) -> Self {
        self.observe = Some((store, target));
        self
    }

    /// Make the next `times` calls of `phase` for `module` fail with `error`.
    pub fn fail(&self, module: &str, phase: Phase, error: TxError, times: usize) {
        self.lock().failures.push(ScriptedFailure {
            module: module.to_string(),
            phase,
            error,
            remaining: times,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Every request accepted by `submit`, in order.
    pub fn submitted(&self) -> Vec<TxRequest> {
        self.lock().submitted.clone()
    }

    /// Modules of the accepted deployments, in submission order.
    pub fn deployed_modules(&self) -> Vec<String> {
        self.lock()
            .submitted
            .iter()
            .filter_map(|request| match request {
                TxRequest::Deploy { module, .. } => Some(module.clone()),
                TxRequest::Call { .. } => None,
            })
            .collect()
    }

    /// `(module, to)` of every accepted call, in submission order.
    pub fn calls(&self) -> Vec<(String, Address, Bytes)> {
        self.lock()
            .submitted
            .iter()
            .filter_map(|request| match request {
                TxRequest::Call { module, to, data } => {
                    Some((module.clone(), *to, data.clone()))
                }
                TxRequest::Deploy { .. } => None,
            })
            .collect()
    }

    /// Modules of confirmed transactions, in confirmation order.
    pub fn confirmed(&self) -> Vec<String> {
        self.lock().confirmed.clone()
    }

    /// Calls of `submit`, failed ones included.
    pub fn submit_attempts(&self) -> usize {
        self.lock().submit_attempts
    }

    pub fn receipt_polls(&self) -> usize {
        self.lock().receipt_polls
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn persisted_at_submit(&self, module: &str) -> Option<BTreeSet<String>> {
        self.lock()
            .persisted_at_submit
            .iter()
            .find(|(name, _)| name == module)
            .map(|(_, modules)| modules.clone())
    }

    /// Address the mock assigns to the `nonce`-th transaction.
    pub fn address_for(nonce: u64) -> Address {
        Address::from_word(keccak256(nonce.to_be_bytes()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn scripted(&self, module: &str, phase: Phase) -> Option<TxError> {
        let mut state = self.lock();
        let failure = state
            .failures
            .iter_mut()
            .find(|f| f.module == module && f.phase == phase && f.remaining > 0)?;
        failure.remaining -= 1;
        Some(failure.error.clone())
    }
}

impl TransactionLayer for MockTransactionLayer {
    async fn submit(&self, request: &TxRequest) -> Result<PendingTx, TxError> {
        self.lock().submit_attempts += 1;
        if let Some(error) = self.scripted(request.module(), Phase::Submit) {
            return Err(error);
        }

        let persisted = self.observe.as_ref().map(|(store, target)| {
            store
                .load(target)
                .map(|manifest| manifest.contracts.keys().cloned().collect())
                .unwrap_or_default()
        });

        let mut state = self.lock();
        state.nonce += 1;
        let nonce = state.nonce;
        let tx_hash = keccak256(format!("tx-{nonce}"));
        state.submitted.push(request.clone());
        state.pending.insert(tx_hash, (nonce, request.clone()));
        if let Some(persisted) = persisted {
            state
                .persisted_at_submit
                .push((request.module().to_string(), persisted));
        }

        Ok(PendingTx { tx_hash })
    }

    async fn await_receipt(&self, pending: &PendingTx) -> Result<Receipt, TxError> {
        {
            let mut state = self.lock();
            state.receipt_polls += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        if !self.receipt_delay.is_zero() {
            tokio::time::sleep(self.receipt_delay).await;
        }

        let mut state = self.lock();
        state.in_flight -= 1;
        let (nonce, request) = state
            .pending
            .get(&pending.tx_hash)
            .cloned()
            .ok_or_else(|| TxError::Rejected("unknown transaction".to_string()))?;
        drop(state);

        if let Some(error) = self.scripted(request.module(), Phase::Receipt) {
            return Err(error);
        }

        self.lock().confirmed.push(request.module().to_string());

        Ok(Receipt {
            tx_hash: pending.tx_hash,
            contract_address: match request {
                TxRequest::Deploy { .. } => Some(Self::address_for(nonce)),
                TxRequest::Call { .. } => None,
            },
        })
    }
}
