//! Mesh formation and routing
//!
//! The [`Hub`] keeps one `hub` channel to every directly connected peer and
//! works toward a full mesh:
//!
//! - When a peer's hub channel opens, the newcomer gets the full list of
//!   known peers and every other peer learns about the newcomer
//!   (`known-peers`).
//! - For each unknown id in a `known-peers` list, the side with the smaller
//!   id offers a connection, signaled through the peer that gossiped it.
//!   Signaling travels as `connection-offered` / `connection-answered`
//!   payloads inside `routed{src, dst, payload}` frames.
//! - A `routed` frame addressed elsewhere is forwarded verbatim to the
//!   destination if it is adjacent, and dropped with a warning otherwise.
//!
//! A negotiated connection sits in the pending map until its heartbeat
//! confirms it, then moves to the peer registry. An id is in at most one
//! of the two maps.
//!
//! Two groups merging can still have both sides offer the same pair; the
//! second offer is rejected with `DuplicateEndpoint`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use peermesh_core::{EndpointId, Error as CoreError, Frame, FrameHandler, MeshConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelHandler};
use crate::client::{Delivery, RelayClient};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handshake::identify;
use crate::transport::Transport;

pub const HUB_LABEL: &str = "hub";
pub const KNOWN_PEERS_FRAME: &str = "known-peers";
pub const ROUTED_FRAME: &str = "routed";
pub const CONNECTION_OFFERED_FRAME: &str = "connection-offered";
pub const CONNECTION_ANSWERED_FRAME: &str = "connection-answered";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Routed {
    src: EndpointId,
    dst: EndpointId,
    payload: Frame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionOffered {
    src_id: EndpointId,
    offer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionAnswered {
    src_id: EndpointId,
    answer: String,
}

/// Membership changes in the direct peer registry
#[derive(Debug, Clone)]
pub enum HubEvent {
    PeerJoined { id: EndpointId, connection: Connection },
    PeerLeft { id: EndpointId },
}

/// A non-hub frame handed to the application
#[derive(Debug, Clone, PartialEq)]
pub struct HubMessage {
    /// Original sender; differs from `via` for routed frames
    pub from: EndpointId,
    /// Neighbor the frame arrived from
    pub via: EndpointId,
    pub frame: Frame,
}

/// How to reach a peer we are negotiating with
#[derive(Debug, Clone)]
enum Signaling {
    Routed { via: EndpointId },
    Relay,
}

struct Peer {
    connection: Connection,
    channel: Option<Channel>,
}

#[derive(Default)]
struct Registry {
    peers: HashMap<EndpointId, Peer>,
    pending: HashMap<EndpointId, Connection>,
}

struct HubInner {
    local: EndpointId,
    transport: Arc<dyn Transport>,
    config: MeshConfig,
    registry: Mutex<Registry>,
    events: broadcast::Sender<HubEvent>,
    sink: Mutex<Option<mpsc::UnboundedSender<HubMessage>>>,
    relay: Mutex<Option<RelayClient>>,
}

/// Mesh membership, gossip, and routing
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(local: EndpointId, transport: Arc<dyn Transport>, config: MeshConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                local,
                transport,
                config,
                registry: Mutex::new(Registry::default()),
                events,
                sink: Mutex::new(None),
                relay: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<HubInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.inner.local
    }

    /// A fresh connection for out-of-band negotiation
    pub fn new_connection(&self) -> Connection {
        Connection::new(
            self.inner.local.clone(),
            self.inner.transport.clone(),
            &self.inner.config,
        )
    }

    /// Ids of directly connected peers, sorted
    pub fn peers_id(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.inner.registry.lock().peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .registry
            .lock()
            .peers
            .values()
            .map(|p| p.connection.clone())
            .collect()
    }

    pub fn is_pending(&self, id: &EndpointId) -> bool {
        self.inner.registry.lock().pending.contains_key(id)
    }

    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    /// Receive non-hub frames from every peer
    ///
    /// Until this is called, such frames are protocol errors on the hub
    /// channel. A later call replaces the earlier receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HubMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.sink.lock() = Some(tx);
        rx
    }

    /// Register an established, identified connection
    pub fn add_connection(&self, connection: Connection) -> Result<()> {
        let remote = connection
            .remote_id()
            .ok_or_else(|| Error::InvalidState("connection has no remote endpoint".into()))?;
        if remote == self.inner.local {
            return Err(Error::SelfConnection);
        }

        {
            let mut registry = self.inner.registry.lock();
            if registry.peers.contains_key(&remote) {
                return Err(Error::DuplicateEndpoint(remote));
            }
            registry.pending.remove(&remote);
            registry.peers.insert(
                remote.clone(),
                Peer {
                    connection: connection.clone(),
                    channel: None,
                },
            );
        }

        let handler = HubHandler::new(Arc::downgrade(&self.inner), remote.clone())?;
        if let Err(e) = connection.register_data_channel(HUB_LABEL, handler) {
            self.inner.registry.lock().peers.remove(&remote);
            return Err(e);
        }

        if let Some(channel) = connection.channel(HUB_LABEL) {
            if let Some(peer) = self.inner.registry.lock().peers.get_mut(&remote) {
                peer.channel.get_or_insert(channel);
            }
        }
        info!(peer = %remote, "Peer added to hub");
        Ok(())
    }

    /// Identify an out-of-band connection if needed, wait for it, and add it
    pub async fn adopt(&self, connection: Connection) -> Result<EndpointId> {
        let remote = match connection.remote_id() {
            Some(id) => id,
            None => identify(&connection).await?,
        };
        connection.wait_connected().await?;
        self.add_connection(connection)?;
        Ok(remote)
    }

    /// Send `frame` to every directly connected peer
    pub fn broadcast(&self, frame: &Frame) -> Result<usize> {
        let text = frame.serialize()?;
        let channels: Vec<_> = self
            .inner
            .registry
            .lock()
            .peers
            .iter()
            .filter_map(|(id, p)| p.channel.clone().map(|c| (id.clone(), c)))
            .collect();

        let mut sent = 0;
        for (id, channel) in channels {
            match channel.send(text.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %id, error = %e, "Hub broadcast send failed"),
            }
        }
        Ok(sent)
    }

    /// Send `frame` to an adjacent peer
    pub fn send_to(&self, id: &EndpointId, frame: &Frame) -> Result<()> {
        let channel = self
            .hub_channel(id)
            .ok_or_else(|| Error::Protocol(format!("{} is not a direct peer", id)))?;
        channel.send_frame(frame)
    }

    /// Send `frame` to `dst` through the adjacent peer `via`
    pub fn send_routed(&self, via: &EndpointId, dst: &EndpointId, frame: Frame) -> Result<()> {
        let routed = Frame::encode(
            ROUTED_FRAME,
            &Routed {
                src: self.inner.local.clone(),
                dst: dst.clone(),
                payload: frame,
            },
        )?;
        self.send_to(via, &routed)
    }

    fn hub_channel(&self, id: &EndpointId) -> Option<Channel> {
        self.inner
            .registry
            .lock()
            .peers
            .get(id)
            .and_then(|p| p.channel.clone())
    }

    /// Best-effort delivery of raw routed text toward `dst`
    fn forward(&self, dst: &EndpointId, raw: &str) {
        match self.hub_channel(dst) {
            Some(channel) => {
                if let Err(e) = channel.send(raw) {
                    warn!(dst = %dst, error = %e, "Failed to forward routed frame");
                }
            }
            None => warn!(dst = %dst, "No route for routed frame, dropping"),
        }
    }

    fn on_channel_open(&self, id: &EndpointId, channel: &Channel) {
        let (connection, known, others) = {
            let mut registry = self.inner.registry.lock();
            let Some(peer) = registry.peers.get_mut(id) else {
                debug!(peer = %id, "Hub channel opened for unregistered peer");
                return;
            };
            peer.channel = Some(channel.clone());
            let connection = peer.connection.clone();

            let mut known: Vec<_> = registry.peers.keys().filter(|k| *k != id).cloned().collect();
            known.sort();
            let others: Vec<_> = registry
                .peers
                .iter()
                .filter(|(k, _)| *k != id)
                .filter_map(|(_, p)| p.channel.clone())
                .collect();
            (connection, known, others)
        };

        match Frame::encode(KNOWN_PEERS_FRAME, &known) {
            Ok(frame) => {
                if let Err(e) = channel.send_frame(&frame) {
                    warn!(peer = %id, error = %e, "Failed to send known peers");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode known peers"),
        }

        if let Ok(frame) = Frame::encode(KNOWN_PEERS_FRAME, &[id]) {
            for other in others {
                let _ = other.send_frame(&frame);
            }
        }

        info!(peer = %id, known = known.len(), "Hub channel open");
        let _ = self.inner.events.send(HubEvent::PeerJoined {
            id: id.clone(),
            connection,
        });
    }

    fn on_channel_closed(&self, id: &EndpointId, channel: &Channel) {
        let removed = {
            let mut registry = self.inner.registry.lock();
            let owned = registry
                .peers
                .get(id)
                .and_then(|p| p.channel.as_ref())
                .is_some_and(|c| c.same_channel(channel));
            if owned {
                registry.peers.remove(id)
            } else {
                None
            }
        };

        if let Some(peer) = removed {
            peer.connection.close();
            info!(peer = %id, "Peer left hub");
            let _ = self.inner.events.send(HubEvent::PeerLeft { id: id.clone() });
        }
    }

    fn on_known_peers(&self, via: &EndpointId, ids: Vec<EndpointId>) {
        for id in ids {
            if id == self.inner.local {
                continue;
            }
            {
                let registry = self.inner.registry.lock();
                if registry.peers.contains_key(&id) || registry.pending.contains_key(&id) {
                    continue;
                }
            }

            if self.inner.local < id {
                if let Err(e) = self.offer_routed_connection(via, id.clone()) {
                    warn!(peer = %id, error = %e, "Could not offer routed connection");
                }
            } else {
                debug!(peer = %id, "Waiting for peer to offer a connection");
            }
        }
    }

    /// Create a pending connection to `id`, refusing ids already known
    fn reserve_pending(&self, id: EndpointId) -> Result<Connection> {
        if id == self.inner.local {
            return Err(Error::SelfConnection);
        }

        let mut registry = self.inner.registry.lock();
        if registry.peers.contains_key(&id) || registry.pending.contains_key(&id) {
            return Err(Error::DuplicateEndpoint(id));
        }
        let connection = Connection::with_remote(
            self.inner.local.clone(),
            id.clone(),
            self.inner.transport.clone(),
            &self.inner.config,
        )?;
        registry.pending.insert(id, connection.clone());
        Ok(connection)
    }

    fn abandon_pending(&self, id: &EndpointId, connection: &Connection) {
        {
            let mut registry = self.inner.registry.lock();
            if registry
                .pending
                .get(id)
                .is_some_and(|c| c.same_connection(connection))
            {
                registry.pending.remove(id);
            }
        }
        connection.close();
    }

    /// Offer a connection to `target`, signaled through the neighbor `via`
    pub fn offer_routed_connection(&self, via: &EndpointId, target: EndpointId) -> Result<()> {
        let connection = self.reserve_pending(target.clone())?;
        debug!(via = %via, target = %target, "Offering routed connection");

        let hub = self.clone();
        let path = Signaling::Routed { via: via.clone() };
        tokio::spawn(async move {
            if let Err(e) = hub.send_offer(&connection, &target, &path).await {
                warn!(target = %target, error = %e, "Routed offer failed");
                hub.abandon_pending(&target, &connection);
            }
        });
        Ok(())
    }

    async fn send_offer(
        &self,
        connection: &Connection,
        target: &EndpointId,
        path: &Signaling,
    ) -> Result<()> {
        let offer = connection.create_offer().await?;
        let frame = Frame::encode(
            CONNECTION_OFFERED_FRAME,
            &ConnectionOffered {
                src_id: self.inner.local.clone(),
                offer,
            },
        )?;
        self.signal(path, target, frame)
    }

    fn signal(&self, path: &Signaling, dst: &EndpointId, frame: Frame) -> Result<()> {
        match path {
            Signaling::Routed { via } if via == dst => self.send_to(dst, &frame),
            Signaling::Routed { via } => self.send_routed(via, dst, frame),
            Signaling::Relay => {
                let relay = self
                    .inner
                    .relay
                    .lock()
                    .clone()
                    .ok_or(Error::RelayUnavailable)?;
                relay.forward(dst, frame.serialize()?)
            }
        }
    }

    fn on_connection_offered(
        &self,
        src: EndpointId,
        offer: String,
        path: Signaling,
    ) -> Result<()> {
        let connection = self.reserve_pending(src.clone())?;
        debug!(peer = %src, path = ?path, "Answering connection offer");

        let hub = self.clone();
        tokio::spawn(async move {
            let answered = async {
                let answer = connection.consume_offer_and_get_answer(&offer).await?;
                let frame = Frame::encode(
                    CONNECTION_ANSWERED_FRAME,
                    &ConnectionAnswered {
                        src_id: hub.inner.local.clone(),
                        answer,
                    },
                )?;
                hub.signal(&path, &src, frame)?;
                Ok::<(), Error>(())
            };

            match answered.await {
                Ok(()) => hub.promote(src, connection).await,
                Err(e) => {
                    warn!(peer = %src, error = %e, "Failed to answer connection offer");
                    hub.abandon_pending(&src, &connection);
                }
            }
        });
        Ok(())
    }

    fn on_connection_answered(&self, src: EndpointId, answer: String) {
        let Some(connection) = self.inner.registry.lock().pending.get(&src).cloned() else {
            warn!(peer = %src, "Answer for unknown pending connection");
            return;
        };

        let hub = self.clone();
        tokio::spawn(async move {
            match connection.consume_answer(&answer).await {
                Ok(()) => hub.promote(src, connection).await,
                Err(e) => {
                    warn!(peer = %src, error = %e, "Failed to consume answer");
                    hub.abandon_pending(&src, &connection);
                }
            }
        });
    }

    /// Move a negotiated connection into the registry once it is live
    async fn promote(&self, id: EndpointId, connection: Connection) {
        let result = match connection.wait_connected().await {
            Ok(()) => self.add_connection(connection.clone()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(peer = %id, error = %e, "Failed to promote pending connection");
            self.abandon_pending(&id, &connection);
        }
    }

    /// Use `relay` for signaling, handling offers and answers it delivers
    pub fn attach_relay(
        &self,
        relay: RelayClient,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) -> Result<()> {
        let mut frames = relay_dispatcher()?;
        *self.inner.relay.lock() = Some(relay);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let Some(hub) = Hub::from_weak(&weak) else {
                    break;
                };
                let from = delivery.from.clone();
                let result = Frame::deserialize(&delivery.payload)
                    .map_err(Error::from)
                    .and_then(|frame| frames.handle_strict(&mut RelayDispatch { hub, from }, frame));
                if let Err(e) = result {
                    warn!(from = %delivery.from, error = %e, "Bad relay delivery");
                }
            }
            debug!("Relay delivery loop ended");
        });
        Ok(())
    }

    /// Offer a first connection to `target` through the relay
    pub async fn connect_via_relay(&self, target: EndpointId) -> Result<Connection> {
        let connection = self.reserve_pending(target.clone())?;
        if let Err(e) = self.send_offer(&connection, &target, &Signaling::Relay).await {
            self.abandon_pending(&target, &connection);
            return Err(e);
        }
        Ok(connection)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("local", &self.inner.local)
            .field("peers", &self.peers_id())
            .finish()
    }
}

struct RelayDispatch {
    hub: Hub,
    from: EndpointId,
}

/// Signaling payloads must name the peer they actually came from
fn check_sender(claimed: &EndpointId, sender: &EndpointId) -> Result<()> {
    if claimed != sender {
        return Err(Error::Protocol(format!(
            "sender {} claims to be {}",
            sender, claimed
        )));
    }
    Ok(())
}

fn relay_dispatcher() -> Result<FrameHandler<RelayDispatch, Error>> {
    let mut frames: FrameHandler<RelayDispatch, Error> = FrameHandler::new();

    frames.on(CONNECTION_OFFERED_FRAME, |ctx: &mut RelayDispatch, offered: ConnectionOffered| {
        check_sender(&offered.src_id, &ctx.from)?;
        ctx.hub
            .on_connection_offered(offered.src_id, offered.offer, Signaling::Relay)
    })?;

    frames.on(CONNECTION_ANSWERED_FRAME, |ctx: &mut RelayDispatch, answered: ConnectionAnswered| {
        check_sender(&answered.src_id, &ctx.from)?;
        ctx.hub.on_connection_answered(answered.src_id, answered.answer);
        Ok(())
    })?;

    Ok(frames)
}

/// Per-message dispatch state for the hub channel
struct HubDispatch {
    hub: Hub,
    via: EndpointId,
    origin: EndpointId,
    raw: String,
    unwrapped: Option<Frame>,
}

struct HubHandler {
    hub: Weak<HubInner>,
    peer: EndpointId,
    frames: FrameHandler<HubDispatch, Error>,
}

impl HubHandler {
    fn new(hub: Weak<HubInner>, peer: EndpointId) -> Result<Self> {
        let mut frames: FrameHandler<HubDispatch, Error> = FrameHandler::new();

        frames.on(KNOWN_PEERS_FRAME, |ctx: &mut HubDispatch, ids: Vec<EndpointId>| {
            ctx.hub.on_known_peers(&ctx.via, ids);
            Ok(())
        })?;

        frames.on(ROUTED_FRAME, |ctx: &mut HubDispatch, routed: Routed| {
            if routed.dst == ctx.hub.inner.local {
                ctx.origin = routed.src;
                ctx.unwrapped = Some(routed.payload);
            } else {
                ctx.hub.forward(&routed.dst, &ctx.raw);
            }
            Ok(())
        })?;

        frames.on(CONNECTION_OFFERED_FRAME, |ctx: &mut HubDispatch, offered: ConnectionOffered| {
            check_sender(&offered.src_id, &ctx.origin)?;
            let path = Signaling::Routed {
                via: ctx.via.clone(),
            };
            ctx.hub.on_connection_offered(offered.src_id, offered.offer, path)
        })?;

        frames.on(CONNECTION_ANSWERED_FRAME, |ctx: &mut HubDispatch, answered: ConnectionAnswered| {
            check_sender(&answered.src_id, &ctx.origin)?;
            ctx.hub.on_connection_answered(answered.src_id, answered.answer);
            Ok(())
        })?;

        frames.on_else(|ctx: &mut HubDispatch, frame: Frame| {
            let sink = ctx.hub.inner.sink.lock().clone();
            let Some(sink) = sink else {
                return Err(CoreError::UnhandledFrame(frame.frame_type).into());
            };
            let message = HubMessage {
                from: ctx.origin.clone(),
                via: ctx.via.clone(),
                frame,
            };
            if sink.send(message).is_err() {
                debug!("Hub subscriber dropped");
            }
            Ok(())
        })?;

        Ok(Self { hub, peer, frames })
    }
}

impl ChannelHandler for HubHandler {
    fn on_open(&mut self, channel: &Channel) -> Result<()> {
        if let Some(hub) = Hub::from_weak(&self.hub) {
            hub.on_channel_open(&self.peer, channel);
        }
        Ok(())
    }

    fn on_message(&mut self, _channel: &Channel, text: &str) -> Result<()> {
        let Some(hub) = Hub::from_weak(&self.hub) else {
            return Ok(());
        };

        let mut frame = Frame::deserialize(text)?;
        let mut ctx = HubDispatch {
            hub,
            via: self.peer.clone(),
            origin: self.peer.clone(),
            raw: text.to_string(),
            unwrapped: None,
        };

        loop {
            self.frames.handle_strict(&mut ctx, frame)?;
            match ctx.unwrapped.take() {
                Some(inner) => {
                    ctx.raw = inner.serialize()?;
                    frame = inner;
                }
                None => return Ok(()),
            }
        }
    }

    fn on_close(&mut self, channel: &Channel) {
        if let Some(hub) = Hub::from_weak(&self.hub) {
            hub.on_channel_closed(&self.peer, channel);
        }
    }
}
