//! Manifest data model.

use std::collections::{BTreeMap, BTreeSet};

use alloy_core::primitives::{Address, Selector, TxHash};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::Fingerprint;

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 2;

/// Identity of a deployment target: a network and a named instance on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIdentity {
    /// Network name, as configured (e.g. `optimistic-kovan`).
    pub name: String,
    /// Chain ID of the network, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Instance name distinguishing parallel deployments on the same network.
    pub instance: String,
}

impl NetworkIdentity {
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain_id: None,
            instance: instance.into(),
        }
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }
}

/// Free-form properties of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    /// Set once every module is current and the router table is aggregated.
    #[serde(default)]
    pub completed: bool,
    /// Time of the last write (RFC 3339). Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// One deployed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    /// Address the module's code was deployed at.
    pub deployed_address: Address,
    /// Router address for modules reached through the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<Address>,
    /// True for the router record itself.
    #[serde(default)]
    pub is_proxy: bool,
    /// Fingerprint of the deployed bytecode and constructor arguments.
    pub fingerprint: Fingerprint,
    /// Deployment transaction.
    pub tx: TxHash,
    /// Artifact name the module was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    /// Whether the module's initializer has been called since its last deployment.
    #[serde(default)]
    pub initialized: bool,
    /// Fingerprint of the last initializer call, signature and resolved arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer_fingerprint: Option<Fingerprint>,
    /// Fields this version does not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ModuleRecord {
    pub fn new(deployed_address: Address, fingerprint: Fingerprint, tx: TxHash) -> Self {
        Self {
            deployed_address,
            proxy_address: None,
            is_proxy: false,
            fingerprint,
            tx,
            contract: None,
            initialized: false,
            initializer_fingerprint: None,
            extra: BTreeMap::new(),
        }
    }

    /// The address external callers should use.
    ///
    /// The proxy address takes precedence whenever it is set, otherwise the deployed address.
    pub fn callable_address(&self) -> Address {
        self.proxy_address.unwrap_or(self.deployed_address)
    }
}

/// One routed selector as deployed in the router.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterEntry {
    pub selector: Selector,
    pub module: String,
    pub signature: String,
    /// Address the router dispatches the selector to.
    pub implementation: Address,
}

/// Routing table as last written to the router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterTable {
    #[serde(default)]
    pub entries: Vec<RouterEntry>,
}

/// Result of looking a module up by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Found(&'a ModuleRecord),
    NotFound,
}

impl<'a> Lookup<'a> {
    pub fn found(self) -> Option<&'a ModuleRecord> {
        match self {
            Lookup::Found(record) => Some(record),
            Lookup::NotFound => None,
        }
    }
}

/// Persisted deployment record for one (network, instance) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub network: NetworkIdentity,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub contracts: BTreeMap<String, ModuleRecord>,
    #[serde(default)]
    pub router: RouterTable,
}

impl Manifest {
    /// A manifest for a target nothing has been deployed to yet.
    pub fn empty(network: NetworkIdentity) -> Self {
        Self {
            version: MANIFEST_VERSION,
            network,
            properties: Properties::default(),
            contracts: BTreeMap::new(),
            router: RouterTable::default(),
        }
    }

    /// Insert or overwrite a module record, returning the updated manifest.
    pub fn record_module(mut self, name: impl Into<String>, record: ModuleRecord) -> Self {
        self.contracts.insert(name.into(), record);
        self
    }

    pub fn module(&self, name: &str) -> Lookup<'_> {
        match self.contracts.get(name) {
            Some(record) => Lookup::Found(record),
            None => Lookup::NotFound,
        }
    }

    /// Name and record of the router, if one has been deployed.
    pub fn router_record(&self) -> Option<(&str, &ModuleRecord)> {
        self.contracts
            .iter()
            .find(|(_, record)| record.is_proxy)
            .map(|(name, record)| (name.as_str(), record))
    }

    pub fn router_address(&self) -> Option<Address> {
        self.router_record().map(|(_, record)| record.deployed_address)
    }

    pub fn is_completed(&self) -> bool {
        self.properties.completed
    }

    pub(crate) fn touch(&mut self) {
        self.properties.updated_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Structural checks run on every load.
    pub fn validate(&self, expected: &NetworkIdentity) -> Result<(), String> {
        if self.network.name != expected.name || self.network.instance != expected.instance {
            return Err(format!(
                "manifest belongs to {}/{}, expected {}/{}",
                self.network.name, self.network.instance, expected.name, expected.instance
            ));
        }

        if let (Some(recorded), Some(wanted)) = (self.network.chain_id, expected.chain_id) {
            if recorded != wanted {
                return Err(format!(
                    "manifest was written for chain {recorded}, target is chain {wanted}"
                ));
            }
        }

        let proxies = self.contracts.values().filter(|r| r.is_proxy).count();
        if proxies > 1 {
            return Err(format!("{proxies} records are marked as proxy, at most one allowed"));
        }

        let mut selectors = BTreeSet::new();
        for entry in &self.router.entries {
            if !self.contracts.contains_key(&entry.module) {
                return Err(format!(
                    "router entry {} points at unknown module '{}'",
                    entry.selector, entry.module
                ));
            }
            if !selectors.insert(entry.selector) {
                return Err(format!("router selector {} is recorded twice", entry.selector));
            }
        }

        Ok(())
    }
}
