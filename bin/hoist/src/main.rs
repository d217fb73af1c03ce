//! hoist deploys a project's contract modules to a network, incrementally and resumably.

mod cli;

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, OutputFormat};
use hoist_deploy::{
    CONFIG_FILENAME, CachedProvider, DeployError, DirArtifactProvider, HoistConfig, ManifestQuery,
    ManifestStore, NetworkConfig, NetworkIdentity, Plan, ResumeController, RpcCodeSource,
    RpcTransactionLayer, StepKind, cancel_channel, rpc,
};

/// Exit code of a run refused because another one holds the manifest lock.
const EXIT_CONCURRENT_RUN: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            match err.downcast_ref::<DeployError>() {
                Some(DeployError::ConcurrentRunDetected { .. }) => {
                    ExitCode::from(EXIT_CONCURRENT_RUN)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Init { force } = cli.command {
        return init(&cli.config, force);
    }

    let project = Project::load(&cli.config, cli.network.as_deref(), cli.instance.as_deref())?;

    match cli.command {
        Command::Deploy => deploy(&project).await,
        Command::Plan => plan(&project),
        Command::Inspect { module, format } => inspect(&project, module.as_deref(), format),
        Command::Verify => verify(&project).await,
        Command::Init { .. } => Ok(()),
    }
}

/// A loaded configuration resolved against one target.
struct Project {
    config: HoistConfig,
    network: NetworkConfig,
    target: NetworkIdentity,
    /// Directory relative paths of the configuration are resolved against.
    root: PathBuf,
}

impl Project {
    fn load(path: &Path, network: Option<&str>, instance: Option<&str>) -> Result<Self> {
        let config = HoistConfig::load(path)?;

        let network_name = match network {
            Some(name) => name.to_string(),
            None => match config.networks.keys().collect::<Vec<_>>().as_slice() {
                [only] => only.to_string(),
                _ => anyhow::bail!("Several networks are configured, select one with --network"),
            },
        };

        let root = if path.is_dir() {
            path.to_path_buf()
        } else {
            path.parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };

        Ok(Self {
            network: config.network(&network_name)?.clone(),
            target: config.target(&network_name, instance)?,
            config,
            root,
        })
    }

    fn store(&self) -> ManifestStore {
        ManifestStore::new(self.root.join(&self.config.project.deployments_dir))
    }

    fn artifacts(&self) -> CachedProvider<DirArtifactProvider> {
        CachedProvider::new(DirArtifactProvider::new(
            self.root.join(&self.config.project.artifacts_dir),
        ))
    }

    fn transactions(&self) -> Result<RpcTransactionLayer> {
        Ok(
            RpcTransactionLayer::new(self.network.rpc_url.clone(), self.network.from)?
                .poll_interval(self.config.executor.poll_interval())
                .receipt_timeout(self.config.executor.receipt_timeout()),
        )
    }

    fn controller(
        &self,
    ) -> Result<ResumeController<RpcTransactionLayer, CachedProvider<DirArtifactProvider>>> {
        Ok(
            ResumeController::new(self.store(), self.transactions()?, self.artifacts())
                .settings(self.config.run_settings()),
        )
    }

    /// Refuse to talk to a node whose chain ID differs from the configured one.
    async fn check_chain_id(&self) -> Result<()> {
        let Some(expected) = self.network.chain_id else {
            return Ok(());
        };

        let client = rpc::create_client()?;
        let actual = rpc::chain_id(&client, self.network.rpc_url.as_str())
            .await
            .with_context(|| format!("Failed to reach {}", self.network.rpc_url))?;

        if actual != expected {
            anyhow::bail!(
                "Node at {} reports chain ID {actual}, configuration expects {expected}",
                self.network.rpc_url
            );
        }
        Ok(())
    }
}

async fn deploy(project: &Project) -> Result<()> {
    project.check_chain_id().await?;

    let (cancel, signal) = cancel_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, waiting for in-flight transactions...");
            cancel.cancel();
        }
    });

    tracing::info!(
        network = %project.target.name,
        instance = %project.target.instance,
        modules = project.config.modules.len(),
        "Starting deployment..."
    );

    let outcome = project
        .controller()?
        .cancel_signal(signal)
        .run(&project.target, &project.config.modules)
        .await?;

    println!("{}", plan_table(&outcome.plan));
    println!("{outcome}");
    Ok(())
}

fn plan(project: &Project) -> Result<()> {
    let plan = project
        .controller()?
        .plan(&project.target, &project.config.modules)?;

    println!("{}", plan_table(&plan));
    if plan.is_noop() {
        println!("Nothing to do.");
        return Ok(());
    }

    println!("{} transactions in the batch", plan.pending_steps());
    if plan.router.deploy_router {
        println!("The router will be deployed.");
    }
    if plan.router.update_routes {
        println!("The routing table will be updated ({} routes).", plan.router.routes.len());
    }
    for name in &plan.router_initializers {
        println!("{name} will be initialized through the router.");
    }
    Ok(())
}

fn inspect(project: &Project, module: Option<&str>, format: OutputFormat) -> Result<()> {
    let query = ManifestQuery::new(project.store().load(&project.target)?);

    if let Some(name) = module {
        let record = query
            .get_module(name)
            .found()
            .with_context(|| {
                format!("Module '{name}' is not deployed on {}", project.target.name)
            })?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(record)?),
            OutputFormat::Table => {
                let mut table = Table::new();
                table.load_preset(UTF8_FULL).set_header(vec!["Field", "Value"]);
                let rows = [
                    ("deployed address", record.deployed_address.to_string()),
                    ("callable address", record.callable_address().to_string()),
                    ("fingerprint", record.fingerprint.to_string()),
                    ("tx", record.tx.to_string()),
                    ("initialized", record.initialized.to_string()),
                ];
                for (field, value) in rows {
                    table.add_row(vec![field.to_string(), value]);
                }
                println!("{table}");
            }
        }
        return Ok(());
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&*query)?),
        OutputFormat::Table => {
            let mut contracts = Table::new();
            contracts.load_preset(UTF8_FULL).set_header(vec![
                "Module",
                "Contract",
                "Callable address",
                "Proxy",
                "Fingerprint",
                "Tx",
            ]);
            for (name, record) in &query.contracts {
                contracts.add_row(vec![
                    name.clone(),
                    record.contract.clone().unwrap_or_default(),
                    record.callable_address().to_string(),
                    record.is_proxy.to_string(),
                    record.fingerprint.short().to_string(),
                    record.tx.to_string(),
                ]);
            }
            println!("{contracts}");

            if !query.router.entries.is_empty() {
                let mut routes = Table::new();
                routes
                    .load_preset(UTF8_FULL)
                    .set_header(vec!["Selector", "Signature", "Module"]);
                for entry in &query.router.entries {
                    routes.add_row(vec![
                        entry.selector.to_string(),
                        entry.signature.clone(),
                        entry.module.clone(),
                    ]);
                }
                println!("{routes}");
            }

            let status = if query.is_completed() { "completed" } else { "incomplete" };
            println!("{}/{}: {status}", query.network.name, query.network.instance);
        }
    }
    Ok(())
}

async fn verify(project: &Project) -> Result<()> {
    project.check_chain_id().await?;

    let query = ManifestQuery::new(project.store().load(&project.target)?);
    let code = RpcCodeSource::new(project.network.rpc_url.clone())?;
    let report = query.verify(&code).await;

    println!("{report}");
    if !report.passed() {
        anyhow::bail!("Verification of {}/{} failed", project.target.name, project.target.instance);
    }
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    let path = if path.is_dir() {
        path.join(CONFIG_FILENAME)
    } else {
        path.to_path_buf()
    };

    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }

    HoistConfig::sample()?.save_to_file(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn plan_table(plan: &Plan) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["#", "Module", "Step", "After"]);
    for step in &plan.steps {
        let after = step
            .prerequisites
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let kind = match step.kind {
            StepKind::NoOp => "-".to_string(),
            kind => kind.to_string(),
        };
        table.add_row(vec![step.id.to_string(), step.module.clone(), kind, after]);
    }
    table
}
