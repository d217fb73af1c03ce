//! Build artifact lookup.
//!
//! Compiled contracts are read from a directory of JSON artifacts, one file per contract
//! (`<artifacts_dir>/<Contract>.json`). Both the Foundry layout (`bytecode.object`) and the
//! Hardhat layout (`bytecode` as a plain hex string) are accepted.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt},
    json_abi::{Function, JsonAbi, Param},
    primitives::{Bytes, Selector},
};
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{DeployError, DeployResult};

/// A compiled contract.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Contract name the artifact was looked up by.
    pub contract: String,
    /// Contract ABI.
    pub abi: JsonAbi,
    /// Creation bytecode, without constructor arguments.
    pub bytecode: Bytes,
}

/// One externally callable function of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceFunction {
    pub selector: Selector,
    pub signature: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(String),
    Object { object: String },
}

#[derive(Deserialize)]
struct RawArtifact {
    abi: JsonAbi,
    bytecode: RawBytecode,
}

impl Artifact {
    /// Parse an artifact from its JSON representation.
    pub fn from_json(contract: &str, content: &str) -> anyhow::Result<Self> {
        let raw: RawArtifact =
            serde_json::from_str(content).context("Failed to parse artifact JSON")?;

        let hex_code = match raw.bytecode {
            RawBytecode::Hex(code) => code,
            RawBytecode::Object { object } => object,
        };

        let bytecode = hex::decode(hex_code.trim_start_matches("0x"))
            .context("Artifact bytecode is not valid hex")?;

        if bytecode.is_empty() {
            anyhow::bail!("Artifact has no creation bytecode (abstract contract or interface?)");
        }

        Ok(Self {
            contract: contract.to_string(),
            abi: raw.abi,
            bytecode: Bytes::from(bytecode),
        })
    }

    /// Every function of the ABI with its selector, sorted by selector.
    pub fn interface(&self) -> Vec<InterfaceFunction> {
        let mut functions: Vec<_> = self
            .abi
            .functions()
            .map(|function| InterfaceFunction {
                selector: function.selector(),
                signature: function.signature(),
            })
            .collect();
        functions.sort_by(|a, b| a.selector.cmp(&b.selector));
        functions
    }

    /// Creation code with the ABI-encoded constructor arguments appended.
    pub fn creation_code(&self, module: &str, args: &[Value]) -> DeployResult<Bytes> {
        let mut code = self.bytecode.to_vec();

        match &self.abi.constructor {
            Some(constructor) => {
                let values = coerce_params(module, &constructor.inputs, args)?;
                let encoded = constructor
                    .abi_encode_input(&values)
                    .map_err(|e| DeployError::encoding(module, "constructor arguments", e))?;
                code.extend_from_slice(&encoded);
            }
            None if !args.is_empty() => {
                return Err(DeployError::encoding(
                    module,
                    "constructor arguments",
                    format!("contract has no constructor but {} arguments were given", args.len()),
                ));
            }
            None => {}
        }

        Ok(Bytes::from(code))
    }
}

/// Calldata for calling `signature` (e.g. `initialize(address,uint256)`) with `args`.
pub fn encode_call(module: &str, signature: &str, args: &[Value]) -> DeployResult<Bytes> {
    let function = Function::parse(signature)
        .map_err(|e| DeployError::encoding(module, "call signature", e))?;
    let values = coerce_params(module, &function.inputs, args)?;
    let calldata = function
        .abi_encode_input(&values)
        .map_err(|e| DeployError::encoding(module, "call arguments", e))?;
    Ok(Bytes::from(calldata))
}

/// Calldata for an already typed call.
pub fn encode_typed_call(
    module: &str,
    signature: &str,
    values: &[DynSolValue],
) -> DeployResult<Bytes> {
    let function = Function::parse(signature)
        .map_err(|e| DeployError::encoding(module, "call signature", e))?;
    let calldata = function
        .abi_encode_input(values)
        .map_err(|e| DeployError::encoding(module, "call arguments", e))?;
    Ok(Bytes::from(calldata))
}

fn coerce_params(module: &str, params: &[Param], args: &[Value]) -> DeployResult<Vec<DynSolValue>> {
    if params.len() != args.len() {
        return Err(DeployError::encoding(
            module,
            "arguments",
            format!("expected {} arguments, got {}", params.len(), args.len()),
        ));
    }

    params
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            let ty = DynSolType::parse(&param.selector_type())
                .map_err(|e| DeployError::encoding(module, "argument type", e))?;
            let literal = json_literal(arg).ok_or_else(|| {
                DeployError::encoding(module, "argument", format!("unsupported value {arg}"))
            })?;
            ty.coerce_str(&literal).map_err(|e| {
                DeployError::encoding(module, "argument", format!("{literal} as {ty}: {e}"))
            })
        })
        .collect()
}

/// Render a JSON argument in the literal syntax understood by [`DynSolType::coerce_str`].
fn json_literal(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let items = items.iter().map(json_literal).collect::<Option<Vec<_>>>()?;
            Some(format!("[{}]", items.join(", ")))
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// Supplies build artifacts by contract name.
///
/// Lookups are expected to be pure: the same name yields the same artifact for the duration
/// of a run.
pub trait ArtifactProvider: Send + Sync {
    fn artifact(&self, contract: &str) -> DeployResult<Arc<Artifact>>;
}

/// Reads `<dir>/<Contract>.json` artifacts from disk.
#[derive(Debug, Clone)]
pub struct DirArtifactProvider {
    dir: PathBuf,
}

impl DirArtifactProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, contract: &str) -> PathBuf {
        // Foundry nests artifacts as `out/<File>.sol/<Contract>.json`.
        let foundry = self
            .dir
            .join(format!("{contract}.sol"))
            .join(format!("{contract}.json"));
        if foundry.exists() {
            return foundry;
        }
        self.dir.join(format!("{contract}.json"))
    }
}

impl ArtifactProvider for DirArtifactProvider {
    fn artifact(&self, contract: &str) -> DeployResult<Arc<Artifact>> {
        let path = self.artifact_path(contract);
        let load = || -> anyhow::Result<Artifact> {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read artifact {}", path.display()))?;
            Artifact::from_json(contract, &content)
        };

        let artifact = load().map_err(|source| DeployError::Artifact {
            contract: contract.to_string(),
            source,
        })?;

        tracing::debug!(contract, path = %path.display(), "Artifact loaded");
        Ok(Arc::new(artifact))
    }
}

/// Memoizes another provider.
pub struct CachedProvider<P> {
    inner: P,
    cache: Mutex<HashMap<String, Arc<Artifact>>>,
}

impl<P: ArtifactProvider> CachedProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl<P: ArtifactProvider> ArtifactProvider for CachedProvider<P> {
    fn artifact(&self, contract: &str) -> DeployResult<Arc<Artifact>> {
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(contract)
        {
            return Ok(hit.clone());
        }

        let artifact = self.inner.artifact(contract)?;
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(contract.to_string(), artifact.clone());
        Ok(artifact)
    }
}

/// In-memory provider, used for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    artifacts: HashMap<String, Arc<Artifact>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, artifact: Artifact) -> Self {
        self.artifacts
            .insert(artifact.contract.clone(), Arc::new(artifact));
        self
    }

    pub fn insert(&mut self, artifact: Artifact) {
        self.artifacts
            .insert(artifact.contract.clone(), Arc::new(artifact));
    }
}

impl ArtifactProvider for StaticProvider {
    fn artifact(&self, contract: &str) -> DeployResult<Arc<Artifact>> {
        self.artifacts
            .get(contract)
            .cloned()
            .ok_or_else(|| DeployError::Artifact {
                contract: contract.to_string(),
                source: anyhow::anyhow!("no artifact registered for {contract}"),
            })
    }
}
