//! ipc-broker
//!
//! `ipc-broker serve` runs the broker; `ipc-broker worker` is the worker
//! process the broker spawns. Workers find the broker through
//! `IPC_BROKER_SOCKET`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ipc_broker_daemon::config::{BrokerConfig, LOG_LEVEL_ENV, SOCKET_ENV};
use ipc_broker_daemon::server::Broker;
use ipc_broker_daemon::spawner::CommandSpawner;
use ipc_broker_daemon::transport::unix::default_socket_path;
use ipc_broker_daemon::worker::{ScriptHost, WorkerClient};

#[derive(Parser, Debug)]
#[command(name = "ipc-broker")]
#[command(about = "Multi-process RPC broker over Unix sockets")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker
    Serve {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Socket path (overrides the configuration)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Connection cap (overrides the configuration)
        #[arg(long)]
        max_connections: Option<usize>,
    },
    /// Run a worker process
    Worker {
        /// Broker socket (default: $IPC_BROKER_SOCKET)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Workers inherit the broker's level unless told otherwise
    let level = args
        .log_level
        .clone()
        .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)))
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Serve {
            config,
            socket,
            max_connections,
        } => serve(config, socket, max_connections, level).await,
        Command::Worker { socket } => worker(socket).await,
    }
}

async fn serve(
    config: Option<PathBuf>,
    socket: Option<PathBuf>,
    max_connections: Option<usize>,
    level: String,
) -> Result<()> {
    let mut config = BrokerConfig::load(config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(max) = max_connections {
        config.max_connections = max;
    }

    let (program, worker_args) = config.worker_command()?;
    info!(
        socket = %config.socket_path.display(),
        worker = %program.display(),
        "Loaded configuration"
    );
    let spawner = CommandSpawner::new(program, worker_args).with_log_level(level);
    let broker = Broker::new(config, Arc::new(spawner))?;

    let listener = broker.bind()?;
    let serving = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.serve(listener).await })
    };

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    broker.stop().await;
    serving.await.context("Accept loop panicked")?;
    Ok(())
}

async fn worker(socket: Option<PathBuf>) -> Result<()> {
    let socket = socket
        .or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
        .unwrap_or_else(default_socket_path);
    let pid = std::process::id();

    let client = WorkerClient::connect(&socket, pid).await?;
    let host = ScriptHost::install(&client);
    // The handshake must be the first call the broker sees from us.
    client.register_client().await?;
    ScriptHost::announce(&client).await?;

    client.closed().await;
    info!(pid, "Broker connection closed, exiting");
    host.stop_all();
    Ok(())
}
