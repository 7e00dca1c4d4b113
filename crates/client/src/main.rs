//! Tether Client
//!
//! Keeps a local project in sync with a tether server and runs it, falling
//! back to the copy on disk whenever the server cannot be reached.

mod actions;
mod config;
mod connection;
mod runtime;
mod state;
mod supervisor;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tether_common::{ProjectManifest, ProjectStatus};

use actions::ActionRunner;
use config::ClientConfig;
use connection::Transport;
use runtime::ClientRuntime;
use state::{Behavior, ClientRuntimeState, ClientSignal};
use supervisor::{Supervisor, SupervisorSettings};
use sync::{UpdateExecutor, Updater};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether Client - sync a project from a tether server and run it")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides connection.server_address
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Overrides connection.key
    #[arg(short, long, global = true)]
    key: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, update and run the project (default)
    Run,

    /// Show the local project without connecting
    Status,

    GenerateConfig {
        #[arg(short, long, default_value = "client.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config_path = cli.config.unwrap_or_else(ClientConfig::default_path);
    let mut config = if config_path.exists() {
        ClientConfig::load(&config_path)?
    } else {
        ClientConfig::default()
    };

    if let Some(server) = cli.server {
        config.connection.server_address = server;
    }
    if let Some(key) = cli.key {
        config.connection.key = Some(key);
    }

    match cli.command {
        Some(Commands::Run) | None => run(config).await,
        Some(Commands::Status) => show_status(&config),
        Some(Commands::GenerateConfig { output }) => generate_config(&output),
    }
}

async fn run(config: ClientConfig) -> Result<()> {
    config.validate()?;

    let manifest_path = config.project.manifest_path();
    let has_manifest = ProjectManifest::load(&manifest_path)
        .with_context(|| format!("Failed to read {:?}", manifest_path))?
        .is_some();

    let behavior = Behavior {
        auto_update: config.behavior.auto_update,
        auto_start: config.behavior.auto_start,
        reconnection_attempts: config.connection.reconnection_attempts,
    };
    let state = ClientRuntimeState::new(behavior, has_manifest);
    info!("Local project status: {}", state.project_status());

    let client_id = format!("tether-{}", Uuid::new_v4());
    info!("Connecting to {} as {}", config.connection.server_address, client_id);
    let (transport, channels) = Transport::spawn(config.connection.clone(), client_id)
        .context("Failed to set up transport")?;

    let project_dir = config.project.dir.clone();
    let updater = Updater::new(
        &project_dir,
        &manifest_path,
        config.project.ignore.clone(),
        UpdateExecutor::new(&project_dir, Duration::from_millis(config.behavior.pacing_ms)),
    );
    let actions = ActionRunner::new(&project_dir, config.project.package_manager.clone());
    let supervisor = Arc::new(Supervisor::new(SupervisorSettings {
        project_dir: project_dir.clone(),
        manifest_path: manifest_path.clone(),
        package_manager: config.project.package_manager.clone(),
        start_script: config.project.start_script.clone(),
        auto_restart: config.behavior.auto_restart,
        restart_delay: Duration::from_millis(config.behavior.restart_delay_ms),
    }));

    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    tokio::spawn(log_signals(signals_rx));

    let runtime = ClientRuntime::new(state, transport, channels, updater, actions, supervisor, signals_tx);
    runtime
        .run(async {
            let name = shutdown_signal().await;
            info!("Received {}, stopping project", name);
        })
        .await;

    Ok(())
}

async fn log_signals(mut signals: mpsc::UnboundedReceiver<ClientSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            ClientSignal::Ready => info!("Client is ready"),
            ClientSignal::Unready => warn!("Server unreachable, running offline"),
            ClientSignal::Start => info!("Project can be started"),
            ClientSignal::Updated(report) => info!("Update finished: {}", report),
            ClientSignal::UpdateFailed(reason) => error!("Update failed: {}", reason),
            ClientSignal::ProjectExited(outcome) => info!("Project stopped: {}", outcome),
        }
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "Ctrl+C",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "Ctrl+C"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl+C"
    }
}

fn show_status(config: &ClientConfig) -> Result<()> {
    let manifest_path = config.project.manifest_path();
    let manifest = ProjectManifest::load(&manifest_path)
        .with_context(|| format!("Failed to read {:?}", manifest_path))?;

    println!();
    println!("  Server:      {}", config.connection.server_address);
    println!("  Project dir: {:?}", config.project.dir);

    match manifest {
        Some(manifest) => {
            println!("  Status:      {}", ProjectStatus::Unknown);
            println!("  Name:        {}", manifest.name);
            println!("  Version:     {}", manifest.version);
            if let Some(description) = &manifest.description {
                println!("  Description: {}", description);
            }
            let script = &config.project.start_script;
            if !manifest.has_script(script) {
                println!("  Warning:     script '{}' is missing from {}", script, config.project.manifest);
            }
        }
        None => {
            println!("  Status:      {}", ProjectStatus::Empty);
            println!("  No {} found, the first run downloads the project", config.project.manifest);
        }
    }
    println!();

    Ok(())
}

fn generate_config(output: &PathBuf) -> Result<()> {
    let content = config::generate_example_config()?;
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {:?}", output))?;
    println!("Generated example config at {:?}", output);
    Ok(())
}
