use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hoist_deploy::CONFIG_FILENAME;
use tracing::level_filters::LevelFilter;

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "hoist")]
#[command(
    author,
    version,
    about = "Incremental, resumable deployment of on-chain modules"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "HOIST_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the project configuration, or to the directory holding it.
    #[arg(short, long, alias = "conf", env = "HOIST_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    /// The network to deploy to, as named in the configuration.
    ///
    /// May be omitted when the configuration declares a single network.
    #[arg(short, long, env = "HOIST_NETWORK", global = true)]
    pub network: Option<String>,

    /// The deployment instance on the network.
    ///
    /// Defaults to the project's `default_instance`.
    #[arg(short, long, env = "HOIST_INSTANCE", global = true)]
    pub instance: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Deploy every module that is missing or out of date, then aggregate the router.
    Deploy,

    /// Show what a deployment would do without sending anything.
    Plan,

    /// Print the manifest of a deployment.
    Inspect {
        /// Only show this module.
        module: Option<String>,

        /// Output format.
        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Check that every recorded module has code on chain.
    Verify,

    /// Write a starter configuration.
    Init {
        /// Overwrite an existing configuration.
        #[arg(long)]
        force: bool,
    },
}
