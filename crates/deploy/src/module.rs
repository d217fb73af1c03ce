//! Desired module definitions and the capability the orchestrator works against.

use std::{collections::BTreeSet, sync::Arc};

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    artifact::{Artifact, InterfaceFunction},
    fingerprint::Fingerprint,
};

/// A constructor or initializer argument.
///
/// Arguments are either literal JSON values or a reference to another module, resolved at
/// execution time. Constructor references take the deployed address, initializer references
/// the callable one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstructorArg {
    /// `{ module = "token" }` - address of another module.
    Module { module: String },
    /// Any literal value accepted by the ABI encoder.
    Value(Value),
}

impl ConstructorArg {
    pub fn module(name: impl Into<String>) -> Self {
        Self::Module {
            module: name.into(),
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// The module this argument points at, if any.
    pub fn referenced_module(&self) -> Option<&str> {
        match self {
            Self::Module { module } => Some(module),
            Self::Value(_) => None,
        }
    }
}

/// A call made once after a module is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializerCall {
    /// Function signature, e.g. `initializeOwnerModule(address)`.
    pub signature: String,
    #[serde(default)]
    pub args: Vec<ConstructorArg>,
}

/// Desired state of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    /// Logical module name, the key in the manifest.
    pub name: String,
    /// Artifact name. Defaults to the module name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    /// Modules that must exist before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Constructor arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ConstructorArg>,
    /// Whether the module's functions are dispatched through the router.
    #[serde(default)]
    pub routed: bool,
    /// Optional one-time initialization call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<InitializerCall>,
}

impl ModuleDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contract: None,
            depends_on: Vec::new(),
            args: Vec::new(),
            routed: false,
            initializer: None,
        }
    }

    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    pub fn depends_on(mut self, module: impl Into<String>) -> Self {
        self.depends_on.push(module.into());
        self
    }

    pub fn arg(mut self, arg: ConstructorArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn routed(mut self, routed: bool) -> Self {
        self.routed = routed;
        self
    }

    pub fn initializer(mut self, signature: impl Into<String>, args: Vec<ConstructorArg>) -> Self {
        self.initializer = Some(InitializerCall {
            signature: signature.into(),
            args,
        });
        self
    }

    pub fn contract_name(&self) -> &str {
        self.contract.as_deref().unwrap_or(&self.name)
    }

    /// Modules whose address is an input of this module's constructor.
    pub fn address_inputs(&self) -> BTreeSet<&str> {
        self.args
            .iter()
            .filter_map(ConstructorArg::referenced_module)
            .collect()
    }

    /// Declared dependencies plus every module referenced by an argument, sorted.
    pub fn dependencies(&self) -> Vec<String> {
        let initializer_refs = self
            .initializer
            .iter()
            .flat_map(|init| init.args.iter())
            .filter_map(ConstructorArg::referenced_module);

        self.depends_on
            .iter()
            .map(String::as_str)
            .chain(self.address_inputs())
            .chain(initializer_refs)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

/// Uniform capability of a deployable module.
///
/// The router aggregator and the reporting code are generic over this trait rather than over
/// a concrete module type.
pub trait DeployableModule {
    fn name(&self) -> &str;

    fn dependencies(&self) -> Vec<String>;

    /// Planned fingerprint, `None` while one of its address inputs is being redeployed.
    fn fingerprint(&self) -> Option<&Fingerprint>;

    /// Functions the module exposes through the router. Empty for standalone modules.
    fn interface_selectors(&self) -> Vec<InterfaceFunction>;
}

/// A definition joined with its artifact.
#[derive(Debug, Clone)]
pub struct PreparedModule {
    pub definition: ModuleDefinition,
    pub artifact: Arc<Artifact>,
    pub fingerprint: Option<Fingerprint>,
}

/// The closed set of module shapes the orchestrator deploys.
#[derive(Debug, Clone)]
pub enum ModuleUnit {
    /// Called directly at its own address.
    Standalone(PreparedModule),
    /// Reached through the shared router.
    Routed(PreparedModule),
}

impl ModuleUnit {
    pub fn new(prepared: PreparedModule) -> Self {
        if prepared.definition.routed {
            Self::Routed(prepared)
        } else {
            Self::Standalone(prepared)
        }
    }

    pub fn prepared(&self) -> &PreparedModule {
        match self {
            Self::Standalone(prepared) | Self::Routed(prepared) => prepared,
        }
    }

    pub fn definition(&self) -> &ModuleDefinition {
        &self.prepared().definition
    }

    pub fn artifact(&self) -> &Artifact {
        &self.prepared().artifact
    }

    pub fn is_routed(&self) -> bool {
        matches!(self, Self::Routed(_))
    }
}

impl DeployableModule for ModuleUnit {
    fn name(&self) -> &str {
        &self.definition().name
    }

    fn dependencies(&self) -> Vec<String> {
        self.definition().dependencies()
    }

    fn fingerprint(&self) -> Option<&Fingerprint> {
        self.prepared().fingerprint.as_ref()
    }

    fn interface_selectors(&self) -> Vec<InterfaceFunction> {
        match self {
            Self::Routed(prepared) => prepared.artifact.interface(),
            Self::Standalone(_) => Vec::new(),
        }
    }
}

/// Resolve arguments to literal values using `lookup` for module references.
///
/// Returns `Err(module)` with the first reference `lookup` could not resolve.
pub fn resolve_args<F>(args: &[ConstructorArg], lookup: F) -> Result<Vec<Value>, String>
where
    F: Fn(&str) -> Option<Address>,
{
    args.iter()
        .map(|arg| match arg {
            ConstructorArg::Value(value) => Ok(value.clone()),
            ConstructorArg::Module { module } => lookup(module)
                .map(|address| Value::String(address.to_string()))
                .ok_or_else(|| module.clone()),
        })
        .collect()
}
