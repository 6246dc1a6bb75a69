//! Labeled sub-channels
//!
//! A [`Channel`] is one labeled, ordered stream inside a [`Connection`],
//! bound to exactly one [`ChannelHandler`]. Each channel has a single
//! delivery task that owns its handler, so callbacks for one channel never
//! overlap. Messages reach the handler no earlier than the configured
//! latency after the transport received them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use peermesh_core::{EndpointId, Frame};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionInner};
use crate::error::{Error, Result};
use crate::transport::Packet;

/// Callbacks for one channel
///
/// Errors from `on_open` and `on_message` fail only the event being
/// processed; they are passed to `on_error` and the channel keeps running.
pub trait ChannelHandler: Send + 'static {
    fn on_open(&mut self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    fn on_message(&mut self, channel: &Channel, text: &str) -> Result<()>;

    fn on_close(&mut self, _channel: &Channel) {}

    fn on_error(&mut self, channel: &Channel, error: Error) {
        warn!(label = %channel.label(), peer = ?channel.remote_id(), error = %error, "Channel handler error");
    }
}

struct ChannelInner {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    closed: watch::Sender<bool>,
    connection: Weak<ConnectionInner>,
}

/// Handle to an open channel; cheap to clone
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        label: String,
        tx: mpsc::UnboundedSender<Packet>,
        connection: Weak<ConnectionInner>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                label,
                tx: Mutex::new(Some(tx)),
                closed,
                connection,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Queue raw text for the remote side
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        let tx = self.inner.tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| Error::ChannelClosed(self.inner.label.clone()))?;
        tx.send(Packet::now(text.into()))
            .map_err(|_| Error::ChannelClosed(self.inner.label.clone()))
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(frame.serialize()?)
    }

    /// Stop sending and end the local delivery task
    pub fn close(&self) {
        if self.inner.tx.lock().take().is_some() {
            debug!(label = %self.inner.label, "Channel closed");
        }
        self.inner.closed.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    /// Owning connection, if it is still alive
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.upgrade().map(Connection::from_inner)
    }

    pub fn remote_id(&self) -> Option<EndpointId> {
        self.connection().and_then(|c| c.remote_id())
    }

    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.label)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Delivery task: runs the handler until either side closes the channel
pub(crate) async fn run_channel(
    channel: Channel,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    mut handler: Box<dyn ChannelHandler>,
    latency: Duration,
) {
    let mut closed = channel.inner.closed.subscribe();
    debug!(label = %channel.label(), "Channel open");
    if let Err(e) = handler.on_open(&channel) {
        handler.on_error(&channel, e);
    }

    loop {
        let packet = tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };

        tokio::time::sleep_until(packet.received_at + latency).await;
        if !channel.is_open() {
            break;
        }
        if let Err(e) = handler.on_message(&channel, &packet.payload) {
            handler.on_error(&channel, e);
        }
    }

    channel.close();
    handler.on_close(&channel);
    if let Some(connection) = channel.connection() {
        connection.forget_channel(&channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Pipe;
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Message(String),
        Error(String),
        Close,
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl ChannelHandler for Recorder {
        fn on_open(&mut self, _: &Channel) -> Result<()> {
            let _ = self.0.send(Event::Open);
            Ok(())
        }

        fn on_message(&mut self, _: &Channel, text: &str) -> Result<()> {
            if text == "bad" {
                return Err(Error::Protocol("bad".into()));
            }
            let _ = self.0.send(Event::Message(text.to_string()));
            Ok(())
        }

        fn on_close(&mut self, _: &Channel) {
            let _ = self.0.send(Event::Close);
        }

        fn on_error(&mut self, _: &Channel, error: Error) {
            let _ = self.0.send(Event::Error(error.to_string()));
        }
    }

    fn spawn(latency: Duration) -> (Channel, Pipe, mpsc::UnboundedReceiver<Event>) {
        let (local, far) = Pipe::pair("test");
        let channel = Channel::new("test".into(), local.tx, Weak::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(
            channel.clone(),
            local.rx,
            Box::new(Recorder(events_tx)),
            latency,
        ));
        (channel, far, events)
    }

    #[tokio::test]
    async fn test_ordered_delivery_and_errors_do_not_close() {
        let (_channel, far, mut events) = spawn(Duration::ZERO);
        for text in ["one", "bad", "two"] {
            far.tx.send(Packet::now(text.into())).unwrap();
        }

        assert_eq!(events.recv().await.unwrap(), Event::Open);
        assert_eq!(events.recv().await.unwrap(), Event::Message("one".into()));
        assert!(matches!(events.recv().await.unwrap(), Event::Error(_)));
        assert_eq!(events.recv().await.unwrap(), Event::Message("two".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let latency = Duration::from_millis(50);
        let (_channel, far, mut events) = spawn(latency);
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        let sent = Instant::now();
        far.tx.send(Packet::now("late".into())).unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Message("late".into()));
        assert!(sent.elapsed() >= latency);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (channel, mut far, mut events) = spawn(Duration::ZERO);
        channel.send("hi").unwrap();
        assert_eq!(far.rx.recv().await.unwrap().payload, "hi");

        channel.close();
        assert!(!channel.is_open());
        assert!(matches!(channel.send("again"), Err(Error::ChannelClosed(l)) if l == "test"));

        assert_eq!(events.recv().await.unwrap(), Event::Open);
        assert_eq!(events.recv().await.unwrap(), Event::Close);
        assert!(far.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_ends_channel() {
        let (channel, far, mut events) = spawn(Duration::ZERO);
        drop(far);

        assert_eq!(events.recv().await.unwrap(), Event::Open);
        assert_eq!(events.recv().await.unwrap(), Event::Close);
        assert!(!channel.is_open());
    }
}
