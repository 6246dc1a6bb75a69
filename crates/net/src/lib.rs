//! PeerMesh Network Library
//!
//! Connections, channels, and the mesh built on top of them.
//!
//! # Architecture
//!
//! - **Transport**: negotiates a session from an opaque offer/answer pair
//!   ([`MemoryTransport`] in-process, [`TcpTransport`] across processes)
//! - **Connection**: one peer link carrying labeled channels, kept alive by
//!   the heartbeat channel
//! - **Hub**: joins connections into a full mesh through gossip and routed
//!   signaling
//! - **Relay**: a rendezvous server for bootstrapping the first connection
//! - **Replica**: a shared value replicated over every hub connection
//!
//! # Usage
//!
//! ```ignore
//! let hub = Hub::new(local_id, Arc::new(TcpTransport::default()), config);
//! let (relay, deliveries) = RelayClient::start(relay_addr, local_id, &config.relay);
//! hub.attach_relay(relay, deliveries)?;
//! hub.connect_via_relay(friend_id).await?;
//!
//! let board = Replica::join(&hub, "board", serde_json::Value::Null);
//! board.set_data(json!({"turn": 1})).await?;
//! ```

pub mod broadcast;
pub mod channel;
pub mod client;
mod codec;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod hub;
pub mod memory;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod tcp;
pub mod transport;

pub use broadcast::{BroadcastEvent, BroadcastGroup};
pub use channel::{Channel, ChannelHandler};
pub use client::{Delivery, RelayClient};
pub use connection::{Connection, ConnectionState, Role};
pub use error::{Error, Result};
pub use handshake::identify;
pub use hub::{Hub, HubEvent, HubMessage};
pub use memory::MemoryTransport;
pub use protocol::RelayMessage;
pub use replica::Replica;
pub use server::RelayServer;
pub use tcp::TcpTransport;
pub use transport::{PendingOffer, Session, Transport};

/// Default port for the signaling relay
pub const DEFAULT_RELAY_PORT: u16 = 7331;
