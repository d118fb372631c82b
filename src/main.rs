use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chain_relay::config::NetworkConfig;
use chain_relay::p2p::{Message, P2PNode, Peer, RouterService};

#[derive(Parser, Debug)]
#[command(name = "chain-relay", version, about = "Relay chain payloads between nodes over TCP")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept peers, answer their keepalives and log relayed chain messages
    Router {
        /// Listen address (overrides config)
        #[arg(long)]
        listen: Option<String>,

        /// Other routers to dial at startup
        #[arg(long = "connect")]
        connect: Vec<String>,
    },

    /// Link to a router and send one chain message per stdin line
    /// (`<dst> <payload>`)
    Peer {
        /// Peer id (overrides config; random when unset everywhere)
        #[arg(long)]
        id: Option<String>,

        /// Candidate routers in order (overrides config)
        #[arg(long = "router")]
        router: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = NetworkConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(config.log_path.as_deref())?;

    match cli.cmd {
        Commands::Router { listen, connect } => run_router(config, listen, connect).await,
        Commands::Peer { id, router } => run_peer(config, id, router).await,
    }
}

/// init tracing from CHAIN_RELAY_LOG or RUST_LOG
fn init_tracing(log_path: Option<&Path>) -> anyhow::Result<()> {
    let filter = std::env::var("CHAIN_RELAY_LOG")
        .unwrap_or_else(|_| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(env_filter).init(),
    }
    Ok(())
}

async fn run_router(config: NetworkConfig, listen: Option<String>, connect: Vec<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| config.listen_addr.clone());

    let service = Arc::new(RouterService::new(
        |src: &str, dst: &str, payload: &[u8], signature: &[u8]| -> anyhow::Result<()> {
            info!(
                src = %src,
                dst = %dst,
                bytes = payload.len(),
                signature = %hex::encode(signature),
                "[ROUTER] Chain message"
            );
            Ok(())
        },
    ));

    let node = Arc::new(P2PNode::new(listen, service.clone(), config.transport()));
    node.start().await.context("starting router")?;

    for addr in &connect {
        if node.connect(addr).await.is_none() {
            warn!(peer = %addr, "[ROUTER] Could not reach configured router");
        }
    }

    node.spawn_keepalive(Duration::from_secs(config.keepalive_interval_secs), Message::keepalive());
    info!("[ROUTER] {}", node);
    if let Ok(snapshot) = serde_json::to_string(&node.snapshot()) {
        info!(snapshot = %snapshot, "[ROUTER] Ready");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(peers = service.peer_count(), "[ROUTER] Shutting down");
    node.stop().await;
    Ok(())
}

async fn run_peer(config: NetworkConfig, id: Option<String>, router: Vec<String>) -> anyhow::Result<()> {
    let id = id
        .or_else(|| (!config.peer_id.is_empty()).then(|| config.peer_id.clone()))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let routers = if router.is_empty() {
        config.router_addrs.clone()
    } else {
        router
    };

    let peer = Peer::new(
        id,
        routers,
        |src: &str, dst: &str, payload: &[u8], _signature: &[u8]| -> anyhow::Result<()> {
            info!(src = %src, dst = %dst, payload = %String::from_utf8_lossy(payload), "[PEER] Chain message");
            Ok(())
        },
        config.peer(),
    );
    peer.start().await.context("starting peer")?;
    info!("[PEER] {}", peer);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                break;
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let (dst, payload) = line.split_once(' ').unwrap_or((line, ""));
                        if let Err(e) = peer.send(dst, payload.as_bytes().to_vec(), Vec::new()) {
                            warn!(dst = %dst, error = %e, "[PEER] Send failed");
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "[PEER] stdin closed");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    peer.stop().await;
    Ok(())
}
