//! Project configuration (`Hoist.toml`).

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    controller::RunSettings,
    executor::ExecutorConfig,
    manifest::NetworkIdentity,
    module::{ConstructorArg, ModuleDefinition},
    router::RouterSettings,
    transaction::{DEFAULT_POLL_INTERVAL, DEFAULT_RECEIPT_TIMEOUT},
};

/// Name of the project configuration file.
pub const CONFIG_FILENAME: &str = "Hoist.toml";

/// Prefix of environment variables overriding configuration values.
pub const ENV_PREFIX: &str = "HOIST_";

/// Instance used when none is requested.
pub const DEFAULT_INSTANCE: &str = "official";

/// Where deployments and artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root of the manifests, one directory per network.
    pub deployments_dir: PathBuf,
    /// Directory of compiled contract artifacts.
    pub artifacts_dir: PathBuf,
    /// Instance deployed to when none is given on the command line.
    pub default_instance: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            deployments_dir: PathBuf::from("deployments"),
            artifacts_dir: PathBuf::from("out"),
            default_instance: DEFAULT_INSTANCE.to_string(),
        }
    }
}

/// A network modules can be deployed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: Url,
    /// Expected chain ID. Checked against the node and the manifest when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Account unlocked on the node that sends every transaction.
    pub from: Address,
}

/// Executor tuning plus receipt polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    #[serde(flatten)]
    pub tuning: ExecutorConfig,
    /// Time to wait for a receipt before retrying.
    pub receipt_timeout_secs: u64,
    /// Interval between receipt polls.
    pub poll_interval_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            tuning: ExecutorConfig::default(),
            receipt_timeout_secs: DEFAULT_RECEIPT_TIMEOUT.as_secs(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl ExecutorSection {
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The whole project file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoistConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub executor: ExecutorSection,
    /// Desired modules.
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

impl HoistConfig {
    /// Load the configuration from a TOML file (or a directory containing `Hoist.toml`),
    /// with `HOIST_`-prefixed environment variables on top.
    ///
    /// Nested keys are separated by `__`, e.g. `HOIST_EXECUTOR__MAX_IN_FLIGHT=1`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file or directory not found: {}",
                path.display()
            ));
        }

        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let config: Self = Figment::new()
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        tracing::info!(
            path = %config_path.display(),
            networks = config.networks.len(),
            modules = config.modules.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn network(&self, name: &str) -> Result<&NetworkConfig> {
        self.networks.get(name).with_context(|| {
            let known: Vec<&str> = self.networks.keys().map(String::as_str).collect();
            format!("Unknown network '{name}' (configured: {})", known.join(", "))
        })
    }

    /// Identity of the deployment of `instance` (or the default instance) on `network`.
    pub fn target(&self, network: &str, instance: Option<&str>) -> Result<NetworkIdentity> {
        let config = self.network(network)?;
        let instance = instance.unwrap_or(&self.project.default_instance);
        let target = NetworkIdentity::new(network, instance);
        Ok(match config.chain_id {
            Some(chain_id) => target.with_chain_id(chain_id),
            None => target,
        })
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            executor: self.executor.tuning.clone(),
            router: self.router.clone(),
        }
    }

    /// A starter configuration for a local node.
    pub fn sample() -> Result<Self> {
        let local = NetworkConfig {
            rpc_url: Url::parse("http://127.0.0.1:8545").context("Invalid sample RPC URL")?,
            chain_id: Some(31337),
            from: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse()
                .context("Invalid sample sender address")?,
        };

        Ok(Self {
            networks: BTreeMap::from([("local".to_string(), local)]),
            modules: vec![
                ModuleDefinition::new("ownerModule")
                    .contract("OwnerModule")
                    .routed(true),
                ModuleDefinition::new("councilToken")
                    .contract("CouncilToken")
                    .arg(ConstructorArg::value("Council Token"))
                    .arg(ConstructorArg::value("CT")),
                ModuleDefinition::new("electionModule")
                    .contract("ElectionModule")
                    .routed(true)
                    .initializer(
                        "initializeElectionModule(address)",
                        vec![ConstructorArg::module("councilToken")],
                    ),
            ],
            ..Self::default()
        })
    }
}
