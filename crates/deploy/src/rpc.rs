//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::time::Duration;

use alloy_core::primitives::{Address, Bytes};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC error codes nodes use for rate limiting and temporary unavailability.
const TRANSIENT_ERROR_CODES: &[i64] = &[-32005, 429];

/// Failure of a single JSON-RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request produced no usable response. A timeout may still have reached the node.
    #[error("failed to send {method} request: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },
    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code} on {method}: {message}")]
    Response {
        method: String,
        code: i64,
        message: String,
    },
    /// The response could not be interpreted.
    #[error("malformed {method} response: {reason}")]
    Malformed { method: String, reason: String },
}

impl RpcError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport { .. } => true,
            RpcError::Response { code, .. } => TRANSIENT_ERROR_CODES.contains(code),
            RpcError::Malformed { .. } => false,
        }
    }
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result, or an error if the request failed or returned an error response.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|source| RpcError::Transport {
            method: method.to_string(),
            source,
        })?;

    let result: Value = response.json().await.map_err(|source| RpcError::Transport {
        method: method.to_string(),
        source,
    })?;

    if let Some(error) = result.get("error") {
        return Err(RpcError::Response {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    let result_value = result
        .get("result")
        .cloned()
        .ok_or_else(|| RpcError::Malformed {
            method: method.to_string(),
            reason: "no result in response".to_string(),
        })?;

    serde_json::from_value(result_value).map_err(|e| RpcError::Malformed {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Query `eth_chainId` and parse the hex result.
pub async fn chain_id(client: &reqwest::Client, url: &str) -> Result<u64, RpcError> {
    let result: String = json_rpc_call(client, url, "eth_chainId", vec![]).await?;
    parse_hex_u64(&result).ok_or_else(|| RpcError::Malformed {
        method: "eth_chainId".to_string(),
        reason: format!("not a hex quantity: {result}"),
    })
}

/// Query the runtime code deployed at `address`.
pub async fn code_at(
    client: &reqwest::Client,
    url: &str,
    address: Address,
) -> Result<Bytes, RpcError> {
    json_rpc_call(
        client,
        url,
        "eth_getCode",
        vec![serde_json::json!(address), serde_json::json!("latest")],
    )
    .await
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(value: &str) -> Option<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}
