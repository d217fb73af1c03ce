//! Read-only access to a manifest and on-chain verification of what it records.

use std::{fmt, future::Future};

use alloy_core::primitives::{Address, Bytes};
use derive_more::Deref;
use url::Url;

use crate::{
    manifest::{Lookup, Manifest, ModuleRecord},
    rpc::{self, RpcError},
};

/// Read-only view over a loaded manifest.
#[derive(Debug, Clone, Deref)]
pub struct ManifestQuery(Manifest);

impl ManifestQuery {
    pub fn new(manifest: Manifest) -> Self {
        Self(manifest)
    }

    pub fn get_module(&self, name: &str) -> Lookup<'_> {
        self.0.module(name)
    }

    pub fn router_address(&self) -> Option<Address> {
        self.0.router_address()
    }

    /// Address callers should use to reach `name`.
    pub fn callable_address(&self, name: &str) -> Option<Address> {
        self.get_module(name).found().map(ModuleRecord::callable_address)
    }

    /// Run the post-deployment checks against `code`.
    pub async fn verify<C: CodeSource>(&self, code: &C) -> VerificationReport {
        let mut checks = Vec::new();

        checks.push(Check {
            name: "completed".to_string(),
            passed: self.0.is_completed(),
            detail: if self.0.is_completed() {
                "last run completed".to_string()
            } else {
                "last run did not complete".to_string()
            },
        });

        let routed = self
            .0
            .contracts
            .values()
            .filter(|record| !record.is_proxy && record.proxy_address.is_some())
            .count();
        let proxies = self.0.contracts.values().filter(|r| r.is_proxy).count();
        if routed > 0 || proxies > 0 {
            checks.push(Check {
                name: "router".to_string(),
                passed: proxies == 1,
                detail: format!("{proxies} proxy records, {routed} routed modules"),
            });
        }

        for (name, record) in &self.0.contracts {
            let address = record.callable_address();
            let (passed, detail) = match code.code_at(address).await {
                Ok(bytes) if !bytes.is_empty() => {
                    (true, format!("{address} ({} bytes)", bytes.len()))
                }
                Ok(_) => (false, format!("{address} has no code")),
                Err(e) => (false, format!("{address}: {e}")),
            };
            checks.push(Check {
                name: name.clone(),
                passed,
                detail,
            });
        }

        VerificationReport { checks }
    }
}

/// Source of deployed runtime code.
pub trait CodeSource: Send + Sync {
    fn code_at(&self, address: Address) -> impl Future<Output = Result<Bytes, RpcError>> + Send;
}

/// Reads code through `eth_getCode`.
#[derive(Debug, Clone)]
pub struct RpcCodeSource {
    client: reqwest::Client,
    url: Url,
}

impl RpcCodeSource {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        Ok(Self {
            client: rpc::create_client()?,
            url,
        })
    }
}

impl CodeSource for RpcCodeSource {
    async fn code_at(&self, address: Address) -> Result<Bytes, RpcError> {
        rpc::code_at(&self.client, self.url.as_str(), address).await
    }
}

/// One verification check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of [`ManifestQuery::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub checks: Vec<Check>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

fn status_icon(passed: bool) -> &'static str {
    if passed { "[OK]" } else { "[FAIL]" }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed() { "VERIFIED" } else { "FAILED" };
        writeln!(f, "Deployment Status: {}", status)?;
        writeln!(f)?;

        for check in &self.checks {
            writeln!(f, "{}", check)?;
        }

        Ok(())
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  {} {}: {}", status_icon(self.passed), self.name, self.detail)
    }
}
