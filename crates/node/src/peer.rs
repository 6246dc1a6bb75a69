//! Peer runtime: joins the mesh through a relay and replicates one value

use std::net::SocketAddr;
use std::sync::Arc;

use peermesh_core::{EndpointId, MeshConfig};
use peermesh_net::{Hub, HubEvent, RelayClient, Replica, Result, TcpTransport};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::command::{self, Command};

/// Topic of the replicated value
const TOPIC: &str = "state";

pub struct PeerOptions {
    pub relay: String,
    pub id: EndpointId,
    pub connect: Option<EndpointId>,
    pub bind: SocketAddr,
}

pub async fn run(options: PeerOptions, config: MeshConfig) -> Result<()> {
    let local = options.id;
    info!(id = %local, relay = %options.relay, "Starting peer");

    let hub = Hub::new(
        local.clone(),
        Arc::new(TcpTransport::new(options.bind)),
        config.clone(),
    );
    let (relay, deliveries) = RelayClient::start(options.relay, local.clone(), &config.relay);
    hub.attach_relay(relay.clone(), deliveries)?;
    tokio::spawn(log_membership(hub.clone()));

    let replica = Replica::join(&hub, TOPIC, Value::Null);
    tokio::spawn(log_changes(replica.watch()));

    if let Some(target) = options.connect {
        relay.wait_online().await?;
        hub.connect_via_relay(target.clone()).await?;
        info!(peer = %target, "Offer sent through relay");
    }

    println!("peer {} ready; commands: set <json>, get, sync, peers, quit", local);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("error: {}", e);
                continue;
            }
        };

        match command {
            Command::Set(value) => match replica.set_data(value).await {
                Ok(()) => println!("ok (clock {})", replica.clock()),
                Err(e) => println!("error: {}", e),
            },
            Command::Get => println!("{} (clock {})", replica.get(), replica.clock()),
            Command::Sync => {
                println!("waiting for {} peer(s)", replica.members().len());
                match replica.wait_sync_point().await {
                    Ok(outcome) => println!(
                        "synced {} (clock {}) with [{}]",
                        outcome.data,
                        outcome.clock,
                        join_ids(&outcome.participants)
                    ),
                    Err(e) => println!("error: {}", e),
                }
            }
            Command::Peers => {
                for connection in hub.connections() {
                    let id = connection.remote_id().map(|id| id.to_string()).unwrap_or_default();
                    match connection.ping_delay() {
                        Some(delay) => println!("{} ({} ms)", id, delay.as_millis()),
                        None => println!("{}", id),
                    }
                }
            }
            Command::Quit => break,
        }
    }

    relay.shutdown();
    for connection in hub.connections() {
        connection.close();
    }
    info!("Peer stopped");
    Ok(())
}

fn join_ids(ids: &[EndpointId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

async fn log_membership(hub: Hub) {
    let mut events = hub.events();
    loop {
        match events.recv().await {
            Ok(HubEvent::PeerJoined { id, .. }) => info!(peer = %id, "Peer joined"),
            Ok(HubEvent::PeerLeft { id }) => info!(peer = %id, "Peer left"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed membership events"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_changes(mut values: tokio::sync::watch::Receiver<(u64, Value)>) {
    let mut last_clock = values.borrow().0;
    while values.changed().await.is_ok() {
        let (clock, value) = values.borrow_and_update().clone();
        if clock != last_clock {
            info!(clock, value = %value, "Shared value changed");
            last_clock = clock;
        }
    }
}
