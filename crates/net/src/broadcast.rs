//! Broadcast channel groups
//!
//! A [`BroadcastGroup`] attaches one labeled channel to each peer
//! connection and fans frames out to all of them. Incoming frames of the
//! accepted types surface as [`BroadcastEvent`]s; anything else is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use peermesh_core::{EndpointId, Frame, FrameHandler};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelHandler};
use crate::connection::Connection;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    /// A member's channel opened
    Opened(EndpointId),
    /// A member sent an accepted frame
    Frame(EndpointId, Frame),
    /// A member's channel closed
    Closed(EndpointId),
}

struct GroupInner {
    label: String,
    accepted: Vec<String>,
    members: Mutex<HashMap<EndpointId, Channel>>,
    events: mpsc::UnboundedSender<BroadcastEvent>,
}

/// One labeled channel per peer, addressed as a group
#[derive(Clone)]
pub struct BroadcastGroup {
    inner: Arc<GroupInner>,
}

impl BroadcastGroup {
    pub fn new(
        label: impl Into<String>,
        accepted: &[&str],
    ) -> (Self, mpsc::UnboundedReceiver<BroadcastEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let group = Self {
            inner: Arc::new(GroupInner {
                label: label.into(),
                accepted: accepted.iter().map(|t| t.to_string()).collect(),
                members: Mutex::new(HashMap::new()),
                events,
            }),
        };
        (group, rx)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Join the group's channel on an identified connection
    pub fn attach(&self, connection: &Connection) -> Result<()> {
        let peer = connection
            .remote_id()
            .ok_or_else(|| Error::InvalidState("broadcast peer has no endpoint id".into()))?;

        let mut frames: FrameHandler<Member, Error> = FrameHandler::new();
        for frame_type in &self.inner.accepted {
            let name = frame_type.clone();
            frames.on(frame_type, move |ctx: &mut Member, data: Value| {
                let event = BroadcastEvent::Frame(ctx.peer.clone(), Frame::new(name.clone(), data));
                let _ = ctx.group.events.send(event);
                Ok(())
            })?;
        }

        let handler = BroadcastHandler {
            member: Member {
                peer,
                group: self.inner.clone(),
            },
            frames,
        };
        connection.register_data_channel(&self.inner.label, handler)
    }

    /// Send `frame` to every member; returns how many channels accepted it
    pub fn broadcast(&self, frame: &Frame) -> Result<usize> {
        let text = frame.serialize()?;
        let members = self.inner.members.lock();
        let mut sent = 0;
        for (peer, channel) in members.iter() {
            match channel.send(text.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(label = %self.inner.label, peer = %peer, error = %e, "Broadcast send failed"),
            }
        }
        Ok(sent)
    }

    pub fn members(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.inner.members.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct Member {
    peer: EndpointId,
    group: Arc<GroupInner>,
}

struct BroadcastHandler {
    member: Member,
    frames: FrameHandler<Member, Error>,
}

impl ChannelHandler for BroadcastHandler {
    fn on_open(&mut self, channel: &Channel) -> Result<()> {
        let peer = self.member.peer.clone();
        self.member
            .group
            .members
            .lock()
            .insert(peer.clone(), channel.clone());
        let _ = self.member.group.events.send(BroadcastEvent::Opened(peer));
        Ok(())
    }

    fn on_message(&mut self, _channel: &Channel, text: &str) -> Result<()> {
        let frame = Frame::deserialize(text)?;
        let frame_type = frame.frame_type.clone();
        if !self.frames.handle(&mut self.member, frame)? {
            trace!(label = %self.member.group.label, frame_type = %frame_type, "Ignoring frame");
        }
        Ok(())
    }

    fn on_close(&mut self, channel: &Channel) {
        let peer = self.member.peer.clone();
        {
            let mut members = self.member.group.members.lock();
            if members.get(&peer).is_some_and(|c| c.same_channel(channel)) {
                members.remove(&peer);
            }
        }
        let _ = self.member.group.events.send(BroadcastEvent::Closed(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::Transport;
    use peermesh_core::MeshConfig;
    use serde_json::json;
    use std::time::Duration;

    async fn pair() -> (Connection, Connection) {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let config = MeshConfig {
            channel_latency_ms: 1,
            ..MeshConfig::default()
        };
        let a = Connection::with_remote("a".into(), "b".into(), transport.clone(), &config).unwrap();
        let b = Connection::with_remote("b".into(), "a".into(), transport, &config).unwrap();
        let offer = a.create_offer().await.unwrap();
        let answer = b.consume_offer_and_get_answer(&offer).await.unwrap();
        a.consume_answer(&answer).await.unwrap();
        (a, b)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<BroadcastEvent>) -> BroadcastEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("group dropped")
    }

    #[tokio::test]
    async fn test_accepted_frames_surface_others_ignored() {
        let (a, b) = pair().await;
        let (group_a, mut events_a) = BroadcastGroup::new("chat", &["say"]);
        let (group_b, mut events_b) = BroadcastGroup::new("chat", &["say"]);
        group_a.attach(&a).unwrap();
        group_b.attach(&b).unwrap();

        assert_eq!(next(&mut events_a).await, BroadcastEvent::Opened("b".into()));
        assert_eq!(next(&mut events_b).await, BroadcastEvent::Opened("a".into()));
        assert_eq!(group_a.members(), vec![EndpointId::from("b")]);

        assert_eq!(group_a.broadcast(&Frame::new("shout", json!(1))).unwrap(), 1);
        group_a.broadcast(&Frame::new("say", json!("hi"))).unwrap();
        assert_eq!(
            next(&mut events_b).await,
            BroadcastEvent::Frame("a".into(), Frame::new("say", json!("hi")))
        );
    }

    #[tokio::test]
    async fn test_close_removes_member() {
        let (a, b) = pair().await;
        let (group_a, mut events_a) = BroadcastGroup::new("chat", &["say"]);
        let (group_b, _events_b) = BroadcastGroup::new("chat", &["say"]);
        group_a.attach(&a).unwrap();
        group_b.attach(&b).unwrap();
        assert_eq!(next(&mut events_a).await, BroadcastEvent::Opened("b".into()));

        b.close();
        assert_eq!(next(&mut events_a).await, BroadcastEvent::Closed("b".into()));
        assert!(group_a.members().is_empty());
    }

    #[tokio::test]
    async fn test_attach_requires_identified_peer() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let anonymous = Connection::new("a".into(), transport, &MeshConfig::default());
        let (group, _events) = BroadcastGroup::new("chat", &[]);
        assert!(matches!(group.attach(&anonymous), Err(Error::InvalidState(_))));
    }
}
