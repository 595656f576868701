//! Gavel consensus node binary.
//!
//! Runs one cluster node: binds the peer protocol port, joins the
//! configured cluster and replicates submitted commands. The client-facing
//! request router and the auction back end attach through the library
//! interfaces; this binary runs the consensus core itself, with the
//! applier in disabled-backend mode.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use gavel_core::NodeId;
use gavel_runtime::{start_node, DisabledBackend, NodeConfig, NodeEvent};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// One peer in `id=host:port` form.
#[derive(Debug, Clone)]
struct PeerSpec {
    node_id: u64,
    addr: String,
}

fn parse_peer(value: &str) -> Result<PeerSpec, String> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got '{value}'"))?;
    let node_id = id
        .parse::<u64>()
        .map_err(|e| format!("bad peer id '{id}': {e}"))?;
    if addr.is_empty() {
        return Err(format!("empty address in '{value}'"));
    }
    Ok(PeerSpec {
        node_id,
        addr: addr.to_string(),
    })
}

/// Gavel consensus node.
#[derive(Parser, Debug)]
#[command(name = "gavel-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node ID for this server.
    #[arg(long)]
    node_id: u64,

    /// Address to bind for the peer protocol.
    #[arg(long, default_value = "127.0.0.1:7001")]
    protocol_addr: SocketAddr,

    /// Address the request router binds.
    #[arg(long, default_value = "127.0.0.1:8001")]
    router_addr: SocketAddr,

    /// Peer nodes, repeated, as `id=host:port`.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerSpec>,

    /// Opaque credentials passed through to the back end.
    #[arg(long)]
    backend_credentials: Option<String>,

    /// Run without a back end (the applier executes nothing).
    #[arg(long)]
    disabled_backend: bool,

    /// Enable verbose diagnostics.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = NodeConfig::new(NodeId::new(args.node_id), args.protocol_addr, args.router_addr);
    for peer in &args.peers {
        config = config.with_peer(NodeId::new(peer.node_id), peer.addr.clone());
    }
    config.backend_credentials = args.backend_credentials;
    config.disabled_backend = args.disabled_backend;
    config.debug = args.debug;

    info!(
        node_id = args.node_id,
        protocol_addr = %args.protocol_addr,
        router_addr = %args.router_addr,
        peers = args.peers.len(),
        "starting gavel node"
    );

    if !args.disabled_backend {
        // No store is linked into this binary; the library seam is where
        // one attaches.
        warn!("no back end linked, running with the applier disabled");
        config.disabled_backend = true;
    }

    let (handle, mut events) = start_node(&config, Arc::new(DisabledBackend)).await?;

    // Relay router notifications into the log until shutdown.
    let events_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::BecameLeader => info!("now leader"),
                NodeEvent::SteppedDown => info!("no longer leader"),
                NodeEvent::SessionsReset => info!("client sessions reset"),
                NodeEvent::Committed { index, kind } => {
                    info!(index = index.get(), kind = %kind, "committed");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await?;
    events_task.abort();

    Ok(())
}
