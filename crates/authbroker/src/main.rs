//! authbroker - account access broker for confined applications
//!
//! Usage:
//!   authbroker serve
//!   authbroker profile <pid>
//!   authbroker config [--json]
//!
//! The service exits on its own after a period without requests.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use authbroker::{
    broker::Broker,
    catalog::{Catalog, FileCatalog},
    config::BrokerConfig,
    idle::IdleSupervisor,
    manager::RequestManager,
    notify::NotifySendSurface,
    server::{PeerTable, Server},
    trust::{ProcfsProfiles, TrustResolver},
    window::{LoggingWindowHost, WindowRouter},
};
use authbroker_core::{process, Paths};

/// authbroker - account access broker for confined applications
#[derive(Parser)]
#[command(name = "authbroker")]
#[command(version)]
#[command(about = "Brokers account access prompts for confined applications")]
pub struct Cli {
    /// Configuration file (default: ~/.config/authbroker/broker.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service
    #[command(about = "Listen for access requests")]
    Serve {
        /// Socket callers connect to
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Socket for the dialog renderer
        #[arg(long)]
        renderer_socket: Option<PathBuf>,

        /// Exit after this many milliseconds without activity (<= 0 never exits)
        #[arg(long, allow_negative_numbers = true)]
        idle_timeout_ms: Option<i64>,
    },

    /// Print the confinement profile of a process
    #[command(about = "Show the confinement profile of a process")]
    Profile {
        /// Process id
        pid: u32,
    },

    /// Print the effective configuration
    #[command(about = "Show the effective configuration")]
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BrokerConfig::load_from(path)?,
        None => BrokerConfig::load()?,
    };
    config.apply_env();

    // RUST_LOG wins over the configured verbosity; logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve {
            socket,
            renderer_socket,
            idle_timeout_ms,
        } => {
            if socket.is_some() {
                config.socket_path = socket;
            }
            if renderer_socket.is_some() {
                config.renderer_socket_path = renderer_socket;
            }
            if let Some(ms) = idle_timeout_ms {
                config.idle_timeout_ms = ms;
            }
            cmd_serve(config).await
        }
        Commands::Profile { pid } => cmd_profile(pid),
        Commands::Config { json } => cmd_config(config, json),
    }
}

async fn cmd_serve(config: BrokerConfig) -> Result<()> {
    let paths = Paths::new();

    let catalog: Arc<dyn Catalog> = Arc::new(FileCatalog::load_from(&config.catalog_path(&paths))?);
    let processes = Arc::new(ProcfsProfiles);
    let peers = Arc::new(PeerTable::new(processes.clone()));
    let trust = Arc::new(
        TrustResolver::new(peers.clone(), processes, Arc::clone(&catalog))
            .with_lookup_timeout(config.profile_lookup_timeout()),
    );

    let (consent_tx, consent_rx) = mpsc::unbounded_channel();
    let surface = NotifySendSurface::new(consent_tx).with_timeout(config.consent_timeout());

    let mut idle = IdleSupervisor::new(config.idle_timeout_ms);
    let manager = RequestManager::new(
        Arc::clone(&trust),
        catalog,
        WindowRouter::new(Arc::new(LoggingWindowHost)),
        Arc::new(surface),
    )
    .with_default_application_label(config.default_application_label.as_str())
    .with_activity(idle.watch("requests"), idle.watch("consent"));

    let (broker, handle) = Broker::new(manager, trust, consent_rx);
    let server = Server::bind(
        &config.socket_path(&paths),
        &config.renderer_socket_path(&paths),
    )?;
    info!(
        socket = %server.path().display(),
        renderer_socket = %server.renderer_path().display(),
        idle_timeout = ?idle.timeout(),
        "Starting authbroker"
    );

    let mut server = tokio::spawn(server.run(handle, peers));
    let shutdown = async {
        tokio::select! {
            _ = idle.run() => info!("No activity, exiting"),
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            result = &mut server => match result {
                Ok(Err(e)) => error!(error = %e, "Server failed"),
                Err(e) => error!(error = %e, "Server task failed"),
                Ok(Ok(())) => {}
            },
        }
    };
    broker.run(shutdown).await;
    server.abort();

    Ok(())
}

fn cmd_profile(pid: u32) -> Result<()> {
    let profile = process::profile_for_pid(pid)
        .with_context(|| format!("Failed to read the confinement profile of {}", pid))?;
    println!("{}", profile);
    Ok(())
}

fn cmd_config(mut config: BrokerConfig, json: bool) -> Result<()> {
    let paths = Paths::new();
    config.socket_path = Some(config.socket_path(&paths));
    config.renderer_socket_path = Some(config.renderer_socket_path(&paths));
    config.catalog_path = Some(config.catalog_path(&paths));

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}
