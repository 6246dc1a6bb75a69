//! Identity exchange for out-of-band connections
//!
//! A connection negotiated by copy/paste knows nothing about its peer.
//! Both sides send `hello{id}` on the handshake channel, and the received id
//! becomes the connection's remote endpoint.

use peermesh_core::{EndpointId, Frame, FrameHandler};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::{Channel, ChannelHandler};
use crate::connection::Connection;
use crate::error::{Error, Result};

pub const HANDSHAKE_LABEL: &str = "handshake";
pub const HELLO_FRAME: &str = "hello";

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    id: EndpointId,
}

struct Exchange {
    done: Option<oneshot::Sender<Result<EndpointId>>>,
    connection: Option<Connection>,
}

struct HandshakeHandler {
    local: EndpointId,
    frames: FrameHandler<Exchange, Error>,
    exchange: Exchange,
}

impl HandshakeHandler {
    fn new(local: EndpointId, done: oneshot::Sender<Result<EndpointId>>) -> Result<Self> {
        let mut frames: FrameHandler<Exchange, Error> = FrameHandler::new();
        frames.on(HELLO_FRAME, |exchange: &mut Exchange, hello: Hello| {
            let connection = exchange.connection.as_ref().ok_or(Error::ConnectionClosed)?;
            let outcome = adopt_identity(connection, hello.id);
            if let Some(done) = exchange.done.take() {
                let _ = done.send(outcome);
            }
            Ok(())
        })?;

        Ok(Self {
            local,
            frames,
            exchange: Exchange {
                done: Some(done),
                connection: None,
            },
        })
    }
}

/// Accept `id` as the remote, or confirm it matches the one already known
fn adopt_identity(connection: &Connection, id: EndpointId) -> Result<EndpointId> {
    match connection.remote_id() {
        Some(current) if current == id => Ok(id),
        _ => {
            connection.set_remote_endpoint(id.clone())?;
            debug!(peer = %id, "Handshake identified peer");
            Ok(id)
        }
    }
}

impl ChannelHandler for HandshakeHandler {
    fn on_open(&mut self, channel: &Channel) -> Result<()> {
        let hello = Frame::encode(
            HELLO_FRAME,
            &Hello {
                id: self.local.clone(),
            },
        )?;
        channel.send_frame(&hello)
    }

    fn on_message(&mut self, channel: &Channel, text: &str) -> Result<()> {
        let frame = Frame::deserialize(text)?;
        self.exchange.connection = channel.connection();
        let result = self.frames.handle_strict(&mut self.exchange, frame);
        self.exchange.connection = None;
        result
    }

    fn on_close(&mut self, _channel: &Channel) {
        if let Some(done) = self.exchange.done.take() {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
    }
}

/// Exchange ids over the handshake channel and return the remote id
pub async fn identify(connection: &Connection) -> Result<EndpointId> {
    let (done, rx) = oneshot::channel();
    connection.register_data_channel(
        HANDSHAKE_LABEL,
        HandshakeHandler::new(connection.local_id().clone(), done)?,
    )?;
    rx.await.map_err(|_| Error::ConnectionClosed)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::Transport;
    use peermesh_core::MeshConfig;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_both_sides_learn_ids() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let config = MeshConfig::default();
        let a = Connection::new("a".into(), transport.clone(), &config);
        let b = Connection::new("b".into(), transport, &config);

        let offer = a.create_offer().await.unwrap();
        let answer = b.consume_offer_and_get_answer(&offer).await.unwrap();
        a.consume_answer(&answer).await.unwrap();

        let (ida, idb) = tokio::join!(identify(&a), identify(&b));
        assert_eq!(ida.unwrap(), EndpointId::from("b"));
        assert_eq!(idb.unwrap(), EndpointId::from("a"));
        assert_eq!(a.remote_id(), Some("b".into()));
        assert_eq!(b.remote_id(), Some("a".into()));
    }

    #[tokio::test]
    async fn test_conflicting_id_rejected() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let config = MeshConfig::default();
        let a = Connection::with_remote("a".into(), "x".into(), transport.clone(), &config)
            .unwrap();
        let b = Connection::new("b".into(), transport, &config);

        let offer = a.create_offer().await.unwrap();
        let answer = b.consume_offer_and_get_answer(&offer).await.unwrap();
        a.consume_answer(&answer).await.unwrap();

        let (ida, _) = tokio::join!(identify(&a), identify(&b));
        assert!(matches!(ida, Err(Error::RemoteAlreadySet { .. })));
    }
}
