//! Liveness probing
//!
//! The heartbeat channel drives a connection's `is_connected` flag. Every
//! interval the local side sends a random probe; the remote echoes any
//! probe it did not originate. An echo matching the most recent probe marks
//! the connection live and records the round trip. A probe superseded
//! before its echo arrives is simply forgotten.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use peermesh_core::{EndpointId, Error as CoreError, Frame};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelHandler};
use crate::error::Result;

pub const HEARTBEAT_LABEL: &str = "heartbeat";
pub const PING_FRAME: &str = "ping";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Probe {
    probe: u64,
    origin: EndpointId,
    sent_at: i64,
}

/// Liveness shared between the heartbeat handler and its connection
pub(crate) struct HeartbeatState {
    pub(crate) connected: watch::Sender<bool>,
    ping_delay_ms: Mutex<Option<u64>>,
    last_probe: Mutex<Option<u64>>,
}

impl HeartbeatState {
    pub(crate) fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            connected,
            ping_delay_ms: Mutex::new(None),
            last_probe: Mutex::new(None),
        }
    }

    pub(crate) fn ping_delay_ms(&self) -> Option<u64> {
        *self.ping_delay_ms.lock()
    }

    pub(crate) fn disconnect(&self) {
        self.connected.send_replace(false);
    }
}

pub(crate) struct HeartbeatHandler {
    local: EndpointId,
    interval: Duration,
    state: Arc<HeartbeatState>,
    ticker: Option<JoinHandle<()>>,
}

impl HeartbeatHandler {
    pub(crate) fn new(local: EndpointId, interval: Duration, state: Arc<HeartbeatState>) -> Self {
        Self {
            local,
            interval,
            state,
            ticker: None,
        }
    }
}

impl ChannelHandler for HeartbeatHandler {
    fn on_open(&mut self, channel: &Channel) -> Result<()> {
        let channel = channel.clone();
        let local = self.local.clone();
        let state = self.state.clone();
        let mut interval = tokio::time::interval(self.interval);

        self.ticker = Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                let probe: u64 = rand::thread_rng().gen();
                *state.last_probe.lock() = Some(probe);

                let frame = match Frame::encode(
                    PING_FRAME,
                    &Probe {
                        probe,
                        origin: local.clone(),
                        sent_at: Utc::now().timestamp_millis(),
                    },
                ) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "Failed to encode probe");
                        break;
                    }
                };
                if channel.send_frame(&frame).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn on_message(&mut self, channel: &Channel, text: &str) -> Result<()> {
        let frame = Frame::deserialize(text)?;
        if frame.frame_type != PING_FRAME {
            return Err(CoreError::UnhandledFrame(frame.frame_type).into());
        }
        let probe: Probe = frame.decode()?;

        if probe.origin != self.local {
            return channel.send(text);
        }

        if *self.state.last_probe.lock() != Some(probe.probe) {
            trace!(probe = probe.probe, "Superseded probe echo");
            return Ok(());
        }

        let delay = (Utc::now().timestamp_millis() - probe.sent_at).max(0) as u64;
        *self.state.ping_delay_ms.lock() = Some(delay);
        if !self.state.connected.send_replace(true) {
            debug!(peer = ?channel.remote_id(), delay_ms = delay, "Heartbeat established");
        }
        Ok(())
    }

    fn on_close(&mut self, _channel: &Channel) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.state.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::run_channel;
    use crate::transport::{Packet, Pipe};
    use std::sync::Weak;

    fn start(local: &str, state: Arc<HeartbeatState>) -> (Channel, Pipe) {
        let (ours, far) = Pipe::pair(HEARTBEAT_LABEL);
        let channel = Channel::new(HEARTBEAT_LABEL.into(), ours.tx, Weak::new());
        let handler = HeartbeatHandler::new(local.into(), Duration::from_millis(20), state);
        tokio::spawn(run_channel(
            channel.clone(),
            ours.rx,
            Box::new(handler),
            Duration::ZERO,
        ));
        (channel, far)
    }

    /// Remote side that echoes everything back
    fn echo(mut far: Pipe) {
        tokio::spawn(async move {
            while let Some(packet) = far.rx.recv().await {
                if far.tx.send(Packet::now(packet.payload)).is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_echo_marks_connected() {
        let state = Arc::new(HeartbeatState::new());
        let (_channel, far) = start("a", state.clone());
        assert!(!*state.connected.borrow());
        echo(far);

        let mut connected = state.connected.subscribe();
        tokio::time::timeout(Duration::from_secs(5), connected.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();
        assert!(state.ping_delay_ms().is_some());
    }

    #[tokio::test]
    async fn test_foreign_probe_echoed_verbatim() {
        let state = Arc::new(HeartbeatState::new());
        let (_channel, mut far) = start("a", state.clone());

        let foreign = Frame::encode(
            PING_FRAME,
            &Probe {
                probe: 42,
                origin: "b".into(),
                sent_at: 0,
            },
        )
        .unwrap()
        .serialize()
        .unwrap();
        far.tx.send(Packet::now(foreign.clone())).unwrap();

        loop {
            let packet = far.rx.recv().await.unwrap();
            if packet.payload == foreign {
                break;
            }
        }
        assert!(!*state.connected.borrow());
    }

    #[tokio::test]
    async fn test_superseded_probe_ignored() {
        let state = Arc::new(HeartbeatState::new());
        let (_channel, mut far) = start("a", state.clone());

        let first = far.rx.recv().await.unwrap();
        let _second = far.rx.recv().await.unwrap();
        far.tx.send(Packet::now(first.payload)).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!*state.connected.borrow());
    }

    #[tokio::test]
    async fn test_close_clears_connected() {
        let state = Arc::new(HeartbeatState::new());
        let (channel, far) = start("a", state.clone());
        echo(far);
        let mut connected = state.connected.subscribe();
        connected.wait_for(|c| *c).await.unwrap();

        channel.close();
        connected.wait_for(|c| !*c).await.unwrap();
    }
}
