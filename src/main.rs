use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shellbox::cli;
use shellbox::registry::{JsonFileStore, Registry};
use shellbox::runtime::docker::DockerRuntime;
use shellbox::runtime::ContainerRuntime;
use shellbox::server::{self, AppState};
use shellbox::term::PtySessionManager;
use shellbox::workspace::Orchestrator;

#[derive(Parser)]
#[command(name = "shellbox", about = "Containerized development workspaces with browser terminals")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: REST API plus WebSocket terminal bridge.
    Serve {
        /// Path to the TOML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Check the host environment (config, container engine).
    Check {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the persisted workspace table.
    Status {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    match args.command {
        Command::Serve { config } => {
            let config = cli::load_config(config.as_deref())?;
            serve(config).await
        }
        Command::Check { config } => {
            let config = cli::load_config(config.as_deref())?;
            cli::run_check(&config).await
        }
        Command::Status { config } => {
            let config = cli::load_config(config.as_deref())?;
            cli::run_status(&config)
        }
    }
}

async fn serve(config: shellbox::config::Config) -> Result<()> {
    let config = Arc::new(config);

    if let Some(dir) = config.server.state_file.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
    }

    let store = JsonFileStore::new(&config.server.state_file);
    let registry = Arc::new(Registry::new(Box::new(store)));
    let loaded = registry.load().await?;
    info!(workspaces = loaded, state_file = %config.server.state_file.display(), "registry loaded");

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(config.runtime.engine_binary.clone()));
    let sessions = Arc::new(PtySessionManager::new(
        config.clone(),
        registry.clone(),
        runtime.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        registry.clone(),
        runtime,
        sessions.clone(),
    ));

    orchestrator
        .reconcile()
        .await
        .context("reconciling persisted workspaces with the engine")?;

    server::serve(AppState { orchestrator, sessions, config }).await
}
