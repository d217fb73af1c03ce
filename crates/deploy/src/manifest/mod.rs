//! Deployment manifest: the persisted record of what exists on each target.

mod legacy;
mod store;
mod types;

pub use store::{ManifestLock, ManifestStore};
pub use types::{
    Lookup, MANIFEST_VERSION, Manifest, ModuleRecord, NetworkIdentity, Properties, RouterEntry,
    RouterTable,
};
