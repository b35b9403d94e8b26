use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use workflow_orchestrator::config::MasterConfig;
use workflow_orchestrator::domain::workflow::WorkflowDefinition;
use workflow_orchestrator::loader::parser::parse_json_file;
use workflow_orchestrator::logger;
use workflow_orchestrator::master::MasterServer;
use workflow_orchestrator::registry::MemoryRegistry;
use workflow_orchestrator::store::MemoryInstanceStore;

/// Standalone workflow master with an in-process registry and instance store.
#[derive(Debug, Parser)]
#[command(name = "workflow-master", version, about)]
struct Cli {
    /// JSON configuration file. Defaults apply to everything it leaves out.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `listenHost`.
    #[arg(long)]
    host: Option<String>,

    /// Overrides `listenPort`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Overrides the default log filter, e.g. `debug` or `workflow_orchestrator=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Workflow definition files submitted once the master is ACTIVE.
    #[arg(short, long = "workflow")]
    workflows: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MasterConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => MasterConfig::default(),
    };
    if let Some(host) = cli.host {
        config.listen_host = host;
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    config.validate()?;

    let _log_guard = logger::init(&config.log);

    let registry = MemoryRegistry::new();
    let store = Arc::new(MemoryInstanceStore::new());
    let master = MasterServer::start(config, Arc::new(registry.connect()), store.clone()).await.context("starting master")?;

    if !cli.workflows.is_empty() {
        log::info!("Waiting to become ACTIVE before submitting {} workflows.", cli.workflows.len());
        let interrupted = tokio::select! {
            _ = master.wait_until_active() => false,
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                true
            }
        };
        if interrupted {
            log::info!("Received ctrl-c while STAND_BY.");
            master.shutdown().await;
            store.close();
            return Ok(());
        }
    }

    for path in &cli.workflows {
        let definition: WorkflowDefinition = parse_json_file(path).with_context(|| format!("reading workflow {}", path.display()))?;
        let id = master.submit_workflow(definition)?;
        log::info!("Workflow from {} is running as instance {}.", path.display(), id);
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    log::info!("Received ctrl-c.");

    master.shutdown().await;
    store.close();
    Ok(())
}
