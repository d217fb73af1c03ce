//! Manifest persistence.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde_json::Value;

use super::{
    legacy,
    types::{MANIFEST_VERSION, Manifest, NetworkIdentity},
};
use crate::error::{DeployError, DeployResult};

/// Reads and writes manifests under a deployments directory.
///
/// Layout: `<root>/<network>/<instance>.json`, with the run lock next to it at
/// `<root>/<network>/<instance>.lock`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, network: &str, instance: &str) -> PathBuf {
        self.root.join(network).join(format!("{instance}.json"))
    }

    fn lock_path(&self, network: &str, instance: &str) -> PathBuf {
        self.root.join(network).join(format!("{instance}.lock"))
    }

    /// Load the manifest of `target`, or an empty one if nothing was deployed yet.
    pub fn load(&self, target: &NetworkIdentity) -> DeployResult<Manifest> {
        let path = self.manifest_path(&target.name, &target.instance);

        if !path.exists() {
            tracing::debug!(
                path = %path.display(),
                "No manifest found, starting from an empty one"
            );
            return Ok(Manifest::empty(target.clone()));
        }

        let content = fs::read_to_string(&path).map_err(|e| DeployError::io(&path, e))?;
        let manifest = Self::parse(&path, &content, target)?;

        manifest
            .validate(target)
            .map_err(|reason| DeployError::corrupt(&path, reason))?;

        tracing::debug!(
            path = %path.display(),
            modules = manifest.contracts.len(),
            completed = manifest.is_completed(),
            "Manifest loaded"
        );
        Ok(manifest)
    }

    fn parse(path: &Path, content: &str, target: &NetworkIdentity) -> DeployResult<Manifest> {
        let document: Value = serde_json::from_str(content)
            .map_err(|e| DeployError::corrupt(path, format!("invalid JSON: {e}")))?;

        let Value::Object(document) = document else {
            return Err(DeployError::corrupt(path, "top-level value is not an object"));
        };

        if legacy::is_legacy(&document) {
            tracing::warn!(
                path = %path.display(),
                "Manifest predates schema versioning, upgrading in memory"
            );
            return legacy::upgrade(document, target)
                .map_err(|reason| DeployError::corrupt(path, reason));
        }

        let version = document
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| DeployError::corrupt(path, "missing schema version"))?;

        if version == 0 || version > u64::from(MANIFEST_VERSION) {
            return Err(DeployError::corrupt(
                path,
                format!(
                    "unsupported schema version {version} (supported: 1..={MANIFEST_VERSION})"
                ),
            ));
        }

        if version == 1 {
            tracing::warn!(path = %path.display(), "Version 1 manifest, upgrading in memory");
            let mut document = document;
            document.remove("version");
            let entries = match document.remove("contracts") {
                Some(Value::Object(contracts)) => contracts,
                Some(_) => return Err(DeployError::corrupt(path, "contracts is not an object")),
                None => document,
            };
            return legacy::upgrade(entries, target)
                .map_err(|reason| DeployError::corrupt(path, reason));
        }

        serde_json::from_value(Value::Object(document))
            .map_err(|e| DeployError::corrupt(path, format!("invalid structure: {e}")))
    }

    /// Atomically replace the persisted manifest.
    ///
    /// The document is written to a temporary file in the same directory, flushed to disk and
    /// renamed over the previous manifest, so readers only ever see a complete document.
    pub fn save(&self, manifest: &Manifest) -> DeployResult<()> {
        let path = self.manifest_path(&manifest.network.name, &manifest.network.instance);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).map_err(|e| DeployError::io(&dir, e))?;

        let mut manifest = manifest.clone();
        manifest.version = MANIFEST_VERSION;

        let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| {
            DeployError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path).map_err(|e| DeployError::io(&tmp_path, e))?;
            file.write_all(&bytes)
                .and_then(|()| file.write_all(b"\n"))
                .and_then(|()| file.sync_all())
                .map_err(|e| DeployError::io(&tmp_path, e))?;
        }

        fs::rename(&tmp_path, &path).map_err(|e| DeployError::io(&path, e))?;

        #[cfg(unix)]
        if let Ok(dir_handle) = File::open(&dir) {
            // Persist the rename itself.
            let _ = dir_handle.sync_all();
        }

        tracing::debug!(path = %path.display(), "Manifest saved");
        Ok(())
    }

    /// Take the exclusive run lock of `target` without blocking.
    ///
    /// Fails with [`DeployError::ConcurrentRunDetected`] when another run holds it.
    pub fn lock(&self, target: &NetworkIdentity) -> DeployResult<ManifestLock> {
        let path = self.lock_path(&target.name, &target.instance);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| DeployError::io(dir, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| DeployError::io(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Manifest lock acquired");
                Ok(ManifestLock { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(DeployError::ConcurrentRunDetected {
                    network: target.name.clone(),
                    instance: target.instance.clone(),
                })
            }
            Err(e) => Err(DeployError::io(&path, e)),
        }
    }
}

/// Exclusive advisory lock on one target, released on drop.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
    path: PathBuf,
}

impl ManifestLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(
                path = %self.path.display(),
                err = %e,
                "Failed to release manifest lock"
            );
        }
    }
}
