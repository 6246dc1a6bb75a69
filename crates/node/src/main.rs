//! PeerMesh node
//!
//! Runs either the signaling relay or a mesh peer driven from stdin.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use peermesh_core::{EndpointId, MeshConfig};
use peermesh_net::{Error, RelayServer, Result, DEFAULT_RELAY_PORT};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod command;
mod peer;

#[derive(Parser)]
#[command(name = "peermesh", version, about = "Peer-to-peer mesh node")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "PEERMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run a signaling relay
    Relay {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)))]
        listen: SocketAddr,
    },
    /// Join the mesh as a peer
    Peer {
        /// Relay address; falls back to `relay.addr` from the config
        #[arg(long)]
        relay: Option<String>,
        /// Endpoint id; random when omitted
        #[arg(long)]
        id: Option<String>,
        /// Peer to offer a first connection to
        #[arg(long)]
        connect: Option<String>,
        /// Address to accept peer sessions on
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], 0)))]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<MeshConfig> {
    let config = match path.or_else(MeshConfig::default_path) {
        Some(path) => MeshConfig::load(&path)?,
        None => MeshConfig::default(),
    };
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config)?;

    match cli.command {
        Mode::Relay { listen } => {
            let server = RelayServer::start(listen).await?;
            info!(addr = %server.addr(), "Relay running, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            server.shutdown();
            Ok(())
        }
        Mode::Peer {
            relay,
            id,
            connect,
            bind,
        } => {
            let relay = relay
                .or_else(|| config.relay.addr.clone())
                .ok_or_else(|| Error::InvalidState("no relay address given".into()))?;
            let options = peer::PeerOptions {
                relay,
                id: id.map(EndpointId::new).unwrap_or_else(EndpointId::generate),
                connect: connect.map(EndpointId::new),
                bind,
            };
            peer::run(options, config).await
        }
    }
}
