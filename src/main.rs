//! data-mesher daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

use data_mesher::config::Config;
use data_mesher::dns_server::run_dns_server;
use data_mesher::node::Node;
use data_mesher::server;
use data_mesher::sync::{HttpTransport, SyncEngine};

#[derive(Parser)]
#[command(version, about = "Gossiped, signed hostname directory")]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension).
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create genesis records for this node's hostnames in a new namespace.
    Init,
    /// Serve and gossip using the persisted state.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    info!("Starting data-mesher with config: {:?}", cfg);

    let node = Arc::new(Node::from_config(&cfg)?);

    match cli.command {
        Command::Init => {
            let report = node.initialize().await?;
            info!(
                "Initialized namespace {} with {} genesis records",
                cfg.namespace, report.applied
            );
            Ok(())
        }
        Command::Run => run(cfg, node).await,
    }
}

async fn run(cfg: Config, node: Arc<Node>) -> anyhow::Result<()> {
    node.advertise().await?;
    node.export().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Sync endpoint
    let listener = TcpListener::bind(cfg.listen_addr()).await?;
    let endpoint_node = Arc::clone(&node);
    let endpoint_rx = shutdown_rx.clone();
    let endpoint_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(endpoint_node, listener, endpoint_rx).await {
            error!("Sync endpoint failed: {}", e);
        }
    });

    // Sync engine
    let transport = Arc::new(HttpTransport::new(cfg.request_timeout())?);
    let engine = SyncEngine::new(
        Arc::clone(&node),
        transport,
        cfg.sync_interval(),
        cfg.request_timeout(),
    );
    let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));

    // DNS server
    let dns_handle = cfg.dns_bind.map(|dns_bind| {
        let dns_node = Arc::clone(&node);
        let dns_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_dns_server(dns_bind, dns_node, dns_rx).await {
                error!("DNS server failed: {}", e);
            }
        })
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = engine_handle.await;
    let _ = endpoint_handle.await;
    if let Some(handle) = dns_handle {
        let _ = handle.await;
    }

    info!("Shutdown complete.");
    Ok(())
}
