//! Upgrade of pre-versioned manifests.
//!
//! The first deployment files were flat JSON objects keyed by module name:
//!
//! ```json
//! { "ccToken": { "address": "0x..", "contract": "..:CoreContributorToken",
//!                "constructorArguments": [..], "tx": "0x.." } }
//! ```
//!
//! They carry no schema version, no properties and no fingerprints.

use std::collections::BTreeMap;

use alloy_core::primitives::{Address, TxHash};
use serde_json::{Map, Value};

use super::types::{Manifest, ModuleRecord, NetworkIdentity};
use crate::fingerprint::Fingerprint;

/// Whether a raw document looks like a version 1 manifest.
pub(crate) fn is_legacy(document: &Map<String, Value>) -> bool {
    !document.contains_key("version")
        && !document.contains_key("contracts")
        && document.values().all(Value::is_object)
}

/// Convert a version 1 document to the current model.
///
/// Every field of every entry is carried over: interpreted fields map onto the record,
/// anything else lands in [`ModuleRecord::extra`]. Records get the legacy fingerprint so
/// the next run redeploys them, and the manifest is not marked completed.
pub(crate) fn upgrade(
    document: Map<String, Value>,
    network: &NetworkIdentity,
) -> Result<Manifest, String> {
    let mut manifest = Manifest::empty(network.clone());

    for (name, entry) in document {
        let Value::Object(mut fields) = entry else {
            return Err(format!("legacy entry '{name}' is not an object"));
        };

        let address = fields
            .remove("address")
            .or_else(|| fields.remove("deployedAddress"))
            .ok_or_else(|| format!("legacy entry '{name}' has no address"))?;
        let deployed_address: Address = serde_json::from_value(address)
            .map_err(|e| format!("legacy entry '{name}' has an invalid address: {e}"))?;

        let tx = match fields.remove("tx") {
            Some(tx) => serde_json::from_value::<TxHash>(tx)
                .map_err(|e| format!("legacy entry '{name}' has an invalid tx hash: {e}"))?,
            None => TxHash::ZERO,
        };

        let contract = match fields.remove("contract") {
            Some(Value::String(contract)) => Some(contract),
            Some(other) => {
                fields.insert("contract".to_string(), other);
                None
            }
            None => None,
        };

        let record = ModuleRecord {
            deployed_address,
            proxy_address: None,
            is_proxy: false,
            fingerprint: Fingerprint::legacy(),
            tx,
            contract,
            initialized: false,
            initializer_fingerprint: None,
            extra: fields.into_iter().collect::<BTreeMap<_, _>>(),
        };

        manifest = manifest.record_module(name, record);
    }

    Ok(manifest)
}
