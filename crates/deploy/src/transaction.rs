//! The transaction layer: the only place the orchestrator touches the ledger.
//!
//! The orchestrator never signs, prices or sequences transactions itself. It hands a
//! [`TxRequest`] to a [`TransactionLayer`] and waits for a [`Receipt`].

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, Bytes, TxHash};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::rpc::{self, RpcError};

/// A transaction the orchestrator wants on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRequest {
    /// Contract creation with the given creation code (bytecode + encoded arguments).
    Deploy { module: String, code: Bytes },
    /// Call into an existing contract.
    Call {
        module: String,
        to: Address,
        data: Bytes,
    },
}

impl TxRequest {
    /// The module this transaction is made for.
    pub fn module(&self) -> &str {
        match self {
            TxRequest::Deploy { module, .. } | TxRequest::Call { module, .. } => module,
        }
    }
}

/// Handle to a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub tx_hash: TxHash,
}

/// Successful inclusion of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    /// Address of the created contract, for deployments.
    pub contract_address: Option<Address>,
}

/// Failure reported by the transaction layer.
#[derive(Debug, Clone, Error)]
pub enum TxError {
    /// Worth retrying with the same inputs (connectivity, rate limits, receipt timeout).
    #[error("transient error: {0}")]
    Transient(String),
    /// The transaction was mined but reverted.
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: TxHash },
    /// The node refused the transaction or the receipt made no sense.
    #[error("rejected: {0}")]
    Rejected(String),
    /// A submission failed after it may have reached the node. Sending it again could land
    /// the same transaction twice.
    #[error("submission outcome unknown: {0}")]
    Indeterminate(String),
}

impl TxError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TxError::Transient(_))
    }
}

impl From<RpcError> for TxError {
    fn from(err: RpcError) -> Self {
        if err.is_transient() {
            TxError::Transient(err.to_string())
        } else {
            TxError::Rejected(err.to_string())
        }
    }
}

/// Classify a failed `eth_sendTransaction`.
///
/// Only failures where the request provably never reached the node, or where the node
/// answered with a retryable error, may be retried blindly.
fn submit_error(err: RpcError) -> TxError {
    match &err {
        RpcError::Transport { source, .. } if source.is_connect() => {
            TxError::Transient(err.to_string())
        }
        RpcError::Transport { .. } | RpcError::Malformed { .. } => {
            TxError::Indeterminate(err.to_string())
        }
        RpcError::Response { .. } => err.into(),
    }
}

/// Submits transactions and resolves them to receipts.
pub trait TransactionLayer: Send + Sync {
    /// Hand a transaction to the ledger.
    fn submit(&self, request: &TxRequest)
    -> impl Future<Output = Result<PendingTx, TxError>> + Send;

    /// Wait until `pending` is included.
    fn await_receipt(
        &self,
        pending: &PendingTx,
    ) -> impl Future<Output = Result<Receipt, TxError>> + Send;
}

/// Default interval between `eth_getTransactionReceipt` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time to wait for a receipt before reporting a transient timeout.
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: TxHash,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_address: Option<Address>,
}

/// JSON-RPC transaction layer sending from an account unlocked on the node.
#[derive(Debug, Clone)]
pub struct RpcTransactionLayer {
    client: reqwest::Client,
    url: Url,
    from: Address,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl RpcTransactionLayer {
    pub fn new(url: Url, from: Address) -> anyhow::Result<Self> {
        Ok(Self {
            client: rpc::create_client()?,
            url,
            from,
            poll_interval: DEFAULT_POLL_INTERVAL,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        })
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn receipt_timeout(mut self, receipt_timeout: Duration) -> Self {
        self.receipt_timeout = receipt_timeout;
        self
    }

    async fn fetch_receipt(&self, tx_hash: TxHash) -> Result<Option<RpcReceipt>, TxError> {
        let receipt: Option<RpcReceipt> = rpc::json_rpc_call(
            &self.client,
            self.url.as_str(),
            "eth_getTransactionReceipt",
            vec![serde_json::json!(tx_hash)],
        )
        .await?;
        Ok(receipt)
    }
}

impl TransactionLayer for RpcTransactionLayer {
    async fn submit(&self, request: &TxRequest) -> Result<PendingTx, TxError> {
        let tx = match request {
            TxRequest::Deploy { code, .. } => serde_json::json!({
                "from": self.from,
                "data": code,
            }),
            TxRequest::Call { to, data, .. } => serde_json::json!({
                "from": self.from,
                "to": to,
                "data": data,
            }),
        };

        let tx_hash: TxHash = rpc::json_rpc_call(
            &self.client,
            self.url.as_str(),
            "eth_sendTransaction",
            vec![tx],
        )
        .await
        .map_err(submit_error)?;

        tracing::debug!(module = request.module(), tx_hash = %tx_hash, "Transaction submitted");
        Ok(PendingTx { tx_hash })
    }

    async fn await_receipt(&self, pending: &PendingTx) -> Result<Receipt, TxError> {
        let start = std::time::Instant::now();

        loop {
            if start.elapsed() > self.receipt_timeout {
                return Err(TxError::Transient(format!(
                    "no receipt for {} after {}s",
                    pending.tx_hash,
                    self.receipt_timeout.as_secs()
                )));
            }

            match self.fetch_receipt(pending.tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status.as_deref().and_then(rpc::parse_hex_u64) == Some(0) {
                        return Err(TxError::Reverted {
                            tx_hash: receipt.transaction_hash,
                        });
                    }
                    return Ok(Receipt {
                        tx_hash: receipt.transaction_hash,
                        contract_address: receipt.contract_address,
                    });
                }
                Ok(None) => {
                    tracing::trace!(tx_hash = %pending.tx_hash, "Receipt not available yet");
                }
                Err(e) if e.is_transient() => {
                    tracing::trace!(
                        tx_hash = %pending.tx_hash,
                        error = %e,
                        "Receipt poll failed, retrying..."
                    );
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
