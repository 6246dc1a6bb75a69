//! Peer connections
//!
//! A [`Connection`] is one negotiated session between the local endpoint and
//! one remote endpoint, carrying any number of labeled channels.
//!
//! # State machine
//!
//! `Uninitiated → Negotiating → Established → Closed`
//!
//! - initiator: [`Connection::create_offer`], then [`Connection::consume_answer`]
//! - responder: [`Connection::consume_offer_and_get_answer`]
//!
//! Negotiation reaching `Established` does not make the connection live.
//! [`Connection::is_connected`] flips only once the heartbeat channel has
//! seen its own probe echoed back.
//!
//! # Channels
//!
//! The initiator opens every registered channel; the responder binds each
//! incoming channel to the handler registered under the same label. Either
//! side may come first: an early handler waits for its channel, and an
//! early channel waits (one per label) for its handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peermesh_core::invariants::assert_endpoint_id_valid;
use peermesh_core::{Endpoint, EndpointId, Error as CoreError, MeshConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{run_channel, Channel, ChannelHandler};
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatHandler, HeartbeatState, HEARTBEAT_LABEL};
use crate::transport::{open_pipe, PendingOffer, Pipe, Session, Transport};

/// Negotiation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitiated,
    Negotiating,
    Established,
    Closed,
}

/// Which side of the offer/answer exchange this connection played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Default)]
struct Core {
    role: Option<Role>,
    pending_offer: Option<Box<dyn PendingOffer>>,
    opener: Option<mpsc::UnboundedSender<Pipe>>,
    channels: HashMap<String, Channel>,
    handlers: HashMap<String, Box<dyn ChannelHandler>>,
    unbound: HashMap<String, Pipe>,
}

pub(crate) struct ConnectionInner {
    id: Uuid,
    local: EndpointId,
    remote: Mutex<Option<EndpointId>>,
    transport: Arc<dyn Transport>,
    latency: Duration,
    state: watch::Sender<ConnectionState>,
    heartbeat: Arc<HeartbeatState>,
    core: Mutex<Core>,
}

impl ConnectionInner {
    /// Attach a pipe to its handler and start delivering
    fn bind(
        self: &Arc<Self>,
        core: &mut Core,
        label: String,
        pipe: Pipe,
        handler: Box<dyn ChannelHandler>,
    ) {
        let channel = Channel::new(label.clone(), pipe.tx, Arc::downgrade(self));
        core.channels.insert(label, channel.clone());
        tokio::spawn(run_channel(channel, pipe.rx, handler, self.latency));
    }

    fn on_incoming(self: &Arc<Self>, pipe: Pipe) {
        let mut core = self.core.lock();
        let label = pipe.label.clone();

        if let Some(handler) = core.handlers.remove(&label) {
            self.bind(&mut core, label, pipe, handler);
        } else if core.channels.contains_key(&label) || core.unbound.contains_key(&label) {
            warn!(connection = %self.id, label = %label, "Dropping duplicate incoming channel");
        } else {
            debug!(connection = %self.id, label = %label, "Channel arrived before its handler");
            core.unbound.insert(label, pipe);
        }
    }

    fn mark_closed(&self) {
        let channels: Vec<Channel> = {
            let mut core = self.core.lock();
            core.opener = None;
            core.pending_offer = None;
            core.handlers.clear();
            core.unbound.clear();
            core.channels.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.close();
        }
        self.heartbeat.disconnect();

        if self.state.send_replace(ConnectionState::Closed) != ConnectionState::Closed {
            info!(connection = %self.id, peer = ?self.remote.lock().clone(), "Connection closed");
        }
    }
}

/// Handle to a connection; clones share the same session
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(local: EndpointId, transport: Arc<dyn Transport>, config: &MeshConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitiated);
        let heartbeat = Arc::new(HeartbeatState::new());
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                local: local.clone(),
                remote: Mutex::new(None),
                transport,
                latency: config.channel_latency(),
                state,
                heartbeat: heartbeat.clone(),
                core: Mutex::new(Core::default()),
            }),
        };

        let handler = HeartbeatHandler::new(local, config.heartbeat_interval(), heartbeat);
        connection
            .inner
            .core
            .lock()
            .handlers
            .insert(HEARTBEAT_LABEL.to_string(), Box::new(handler));
        connection
    }

    /// A connection whose remote is known up front, as with routed signaling
    pub fn with_remote(
        local: EndpointId,
        remote: EndpointId,
        transport: Arc<dyn Transport>,
        config: &MeshConfig,
    ) -> Result<Self> {
        let connection = Self::new(local, transport, config);
        connection.set_remote_endpoint(remote)?;
        Ok(connection)
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.inner.local
    }

    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::Local(self.inner.local.clone())
    }

    pub fn remote_id(&self) -> Option<EndpointId> {
        self.inner.remote.lock().clone()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.remote_id().map(Endpoint::Remote)
    }

    /// Set the remote endpoint; allowed exactly once
    pub fn set_remote_endpoint(&self, id: EndpointId) -> Result<()> {
        assert_endpoint_id_valid(&id, "connection remote");
        if id == self.inner.local {
            return Err(Error::SelfConnection);
        }

        let mut remote = self.inner.remote.lock();
        if let Some(current) = remote.as_ref() {
            return Err(Error::RemoteAlreadySet {
                current: current.clone(),
                attempted: id,
            });
        }
        debug!(connection = %self.inner.id, peer = %id, "Remote endpoint set");
        *remote = Some(id);
        Ok(())
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.core.lock().role
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Start negotiating as the initiator; returns the offer blob
    pub async fn create_offer(&self) -> Result<String> {
        self.claim_role(Role::Initiator)?;

        match self.inner.transport.create_offer().await {
            Ok((offer, pending)) => {
                self.inner.core.lock().pending_offer = Some(pending);
                debug!(connection = %self.inner.id, "Offer created");
                Ok(offer)
            }
            Err(e) => {
                self.inner.mark_closed();
                Err(e)
            }
        }
    }

    /// Answer a peer's offer as the responder
    pub async fn consume_offer_and_get_answer(&self, offer: &str) -> Result<String> {
        self.claim_role(Role::Responder)?;

        match self.inner.transport.accept_offer(offer).await {
            Ok((answer, session)) => {
                self.attach(session);
                Ok(answer)
            }
            Err(e) => {
                self.inner.mark_closed();
                Err(e)
            }
        }
    }

    /// Complete negotiation with the peer's answer
    pub async fn consume_answer(&self, answer: &str) -> Result<()> {
        let pending = {
            let mut core = self.inner.core.lock();
            if core.role != Some(Role::Initiator) {
                return Err(Error::InvalidState("consume_answer without create_offer".into()));
            }
            core.pending_offer
                .take()
                .ok_or_else(|| Error::InvalidState("answer already consumed".into()))?
        };

        match pending.accept_answer(answer).await {
            Ok(session) => {
                self.attach(session);
                Ok(())
            }
            Err(e) => {
                self.inner.mark_closed();
                Err(e)
            }
        }
    }

    fn claim_role(&self, role: Role) -> Result<()> {
        let mut core = self.inner.core.lock();
        if let Some(existing) = core.role {
            warn!(connection = %self.inner.id, ?existing, requested = ?role, "Negotiation already started");
            return Err(Error::InvalidState(format!(
                "connection already negotiating as {:?}",
                existing
            )));
        }
        if self.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        core.role = Some(role);
        drop(core);

        self.inner.state.send_replace(ConnectionState::Negotiating);
        Ok(())
    }

    fn attach(&self, session: Session) {
        let (outgoing, incoming) = session.into_parts();
        {
            let mut core = self.inner.core.lock();
            if core.role == Some(Role::Initiator) {
                let handlers: Vec<_> = core.handlers.drain().collect();
                for (label, handler) in handlers {
                    match open_pipe(&outgoing, &label) {
                        Ok(pipe) => self.inner.bind(&mut core, label, pipe, handler),
                        Err(e) => warn!(label = %label, error = %e, "Failed to open channel"),
                    }
                }
            }
            core.opener = Some(outgoing);
        }

        self.inner.state.send_replace(ConnectionState::Established);
        info!(connection = %self.inner.id, role = ?self.role(), "Connection established");

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut incoming = incoming;
            while let Some(pipe) = incoming.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.on_incoming(pipe),
                    None => return,
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.mark_closed();
            }
        });
    }

    /// Bind `handler` to the channel named `label`
    pub fn register_data_channel(
        &self,
        label: &str,
        handler: impl ChannelHandler,
    ) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }

        let mut core = self.inner.core.lock();
        if core.channels.contains_key(label) || core.handlers.contains_key(label) {
            return Err(CoreError::DuplicateHandler(label.to_string()).into());
        }
        let handler: Box<dyn ChannelHandler> = Box::new(handler);

        if core.role == Some(Role::Initiator) {
            if let Some(opener) = core.opener.clone() {
                let pipe = open_pipe(&opener, label)?;
                self.inner.bind(&mut core, label.to_string(), pipe, handler);
                return Ok(());
            }
        } else if let Some(pipe) = core.unbound.remove(label) {
            self.inner.bind(&mut core, label.to_string(), pipe, handler);
            return Ok(());
        }

        core.handlers.insert(label.to_string(), handler);
        Ok(())
    }

    /// The open channel with this label, if any
    pub fn channel(&self, label: &str) -> Option<Channel> {
        self.inner.core.lock().channels.get(label).cloned()
    }

    pub(crate) fn forget_channel(&self, channel: &Channel) {
        let mut core = self.inner.core.lock();
        if core
            .channels
            .get(channel.label())
            .is_some_and(|c| c.same_channel(channel))
        {
            core.channels.remove(channel.label());
        }
    }

    /// Whether the heartbeat has confirmed the link
    pub fn is_connected(&self) -> bool {
        *self.inner.heartbeat.connected.borrow()
    }

    /// Last measured heartbeat round trip
    pub fn ping_delay(&self) -> Option<Duration> {
        self.inner.heartbeat.ping_delay_ms().map(Duration::from_millis)
    }

    /// Wait for the heartbeat to confirm the link
    pub async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.inner.heartbeat.connected.subscribe();
        let mut state = self.inner.state.subscribe();
        loop {
            if *connected.borrow_and_update() {
                return Ok(());
            }
            if *state.borrow_and_update() == ConnectionState::Closed {
                return Err(Error::ConnectionClosed);
            }
            tokio::select! {
                changed = connected.changed() => changed.map_err(|_| Error::ConnectionClosed)?,
                changed = state.changed() => changed.map_err(|_| Error::ConnectionClosed)?,
            }
        }
    }

    /// Close every channel and end the session
    pub fn close(&self) {
        self.inner.mark_closed();
    }

    pub fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local)
            .field("remote", &self.remote_id())
            .field("state", &self.state())
            .finish()
    }
}
