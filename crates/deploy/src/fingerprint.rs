use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Content hash of a module's build artifact and its resolved constructor arguments.
///
/// Two deployments of the same bytecode with the same constructor arguments share a
/// fingerprint, so the fingerprint alone decides whether a recorded module is still current.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Marker carried by records upgraded from manifests that predate fingerprints.
    ///
    /// It never matches a computed fingerprint, so such modules are redeployed once.
    pub const LEGACY: &'static str = "legacy";

    /// Compute a SHA-256 fingerprint over the creation bytecode and the resolved arguments.
    ///
    /// The arguments are serialized to compact JSON before hashing. `serde_json::Value`
    /// keeps object keys sorted, so the encoding is stable for equal inputs.
    pub fn compute(bytecode: &[u8], args: &[Value]) -> Self {
        let encoded_args =
            serde_json::to_vec(args).expect("serializing JSON values cannot fail");

        let mut hasher = Sha256::new();
        hasher.update((bytecode.len() as u64).to_be_bytes());
        hasher.update(bytecode);
        hasher.update(encoded_args);

        Self(hex::encode(hasher.finalize()))
    }

    /// Fingerprint for a record upgraded from a legacy manifest.
    pub fn legacy() -> Self {
        Self(Self::LEGACY.to_string())
    }

    pub fn is_legacy(&self) -> bool {
        self.0 == Self::LEGACY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for tables and log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}
