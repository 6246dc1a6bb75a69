//! Signaling relay client
//!
//! Keeps a registration with a relay alive, reconnecting with a randomized
//! backoff whenever the link drops. Deliveries from every connection
//! attempt flow into one receiver.

use std::sync::Arc;
use std::time::Duration;

use peermesh_core::{EndpointId, RelayConfig};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{read_message, write_message};
use crate::error::{Error, Result};
use crate::protocol::RelayMessage;

/// A payload another endpoint forwarded to us
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: EndpointId,
    pub payload: String,
}

struct Shared {
    local: EndpointId,
    online: watch::Sender<bool>,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<RelayMessage>>>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a relay registration
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
}

impl RelayClient {
    /// Register `local` with the relay at `addr` and keep the registration alive
    pub fn start(
        addr: String,
        local: EndpointId,
        config: &RelayConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (online, _) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            local,
            online,
            outbound: parking_lot::Mutex::new(None),
            shutdown,
        });

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let backoff = (config.min_backoff_ms, config.max_backoff_ms);
        tokio::spawn(reconnect_loop(
            addr,
            shared.clone(),
            delivery_tx,
            backoff,
            shutdown_rx,
        ));

        (RelayClient { shared }, delivery_rx)
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.shared.local
    }

    /// Ask the relay to deliver `payload` to `to`
    pub fn forward(&self, to: &EndpointId, payload: String) -> Result<()> {
        let outbound = self.shared.outbound.lock();
        let tx = outbound.as_ref().ok_or(Error::RelayUnavailable)?;
        tx.send(RelayMessage::Forward {
            to: to.clone(),
            payload,
        })
        .map_err(|_| Error::RelayUnavailable)
    }

    pub fn is_online(&self) -> bool {
        *self.shared.online.borrow()
    }

    /// Wait until the registration is live
    pub async fn wait_online(&self) -> Result<()> {
        let mut online = self.shared.online.subscribe();
        online
            .wait_for(|up| *up)
            .await
            .map(|_| ())
            .map_err(|_| Error::RelayUnavailable)
    }

    /// Drop the registration and stop reconnecting
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        self.shared.outbound.lock().take();
        self.shared.online.send_replace(false);
    }
}

async fn reconnect_loop(
    addr: String,
    shared: Arc<Shared>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    (min_backoff_ms, max_backoff_ms): (u64, u64),
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            result = run_session(&addr, &shared, &deliveries) => {
                if let Err(e) = result {
                    warn!(addr = %addr, error = %e, "Relay link lost");
                }
            }
            _ = shutdown_rx.changed() => break,
        }

        shared.outbound.lock().take();
        shared.online.send_replace(false);

        let delay = backoff_delay(min_backoff_ms, max_backoff_ms);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    shared.outbound.lock().take();
    shared.online.send_replace(false);
    debug!("Relay client stopped");
}

/// Uniform delay between the two bounds, in whichever order they come
fn backoff_delay(a: u64, b: u64) -> Duration {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

/// One connection to the relay, until it fails
async fn run_session(
    addr: &str,
    shared: &Shared,
    deliveries: &mpsc::UnboundedSender<Delivery>,
) -> Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    write_message(
        &mut writer,
        &RelayMessage::Register {
            id: shared.local.clone(),
        },
    )
    .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    *shared.outbound.lock() = Some(tx);
    shared.online.send_replace(true);
    info!(addr = %addr, id = %shared.local, "Registered with relay");

    loop {
        tokio::select! {
            msg = read_message::<RelayMessage, _>(&mut reader) => {
                match msg? {
                    RelayMessage::Deliver { from, payload } => {
                        if deliveries.send(Delivery { from, payload }).is_err() {
                            debug!("Delivery receiver dropped");
                        }
                    }
                    other => debug!(message = ?other, "Ignoring unexpected relay message"),
                }
            }
            Some(msg) = rx.recv() => {
                write_message(&mut writer, &msg).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RelayServer;

    fn fast() -> RelayConfig {
        RelayConfig {
            addr: None,
            min_backoff_ms: 10,
            max_backoff_ms: 20,
        }
    }

    async fn within<F: std::future::Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn test_clients_exchange_through_relay() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.addr().to_string();

        let (a, _a_rx) = RelayClient::start(addr.clone(), "a".into(), &fast());
        let (b, mut b_rx) = RelayClient::start(addr, "b".into(), &fast());
        within(a.wait_online()).await.unwrap();
        within(b.wait_online()).await.unwrap();
        while server.registered().await.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        a.forward(&"b".into(), "hello".into()).unwrap();
        let got = within(b_rx.recv()).await.unwrap();
        assert_eq!(
            got,
            Delivery {
                from: "a".into(),
                payload: "hello".into()
            }
        );

        a.shutdown();
        b.shutdown();
        server.shutdown();
    }

    #[test]
    fn test_backoff_stays_within_bounds() {
        for _ in 0..50 {
            let delay = backoff_delay(10, 20);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
            // inverted bounds are tolerated
            let delay = backoff_delay(30, 5);
            assert!(delay >= Duration::from_millis(5) && delay <= Duration::from_millis(30));
        }
        assert_eq!(backoff_delay(7, 7), Duration::from_millis(7));
    }

    #[tokio::test]
    async fn test_forward_offline_fails() {
        // Nothing listens on port 9 on loopback in the test environment
        let (client, _rx) = RelayClient::start("127.0.0.1:9".into(), "a".into(), &fast());
        assert!(!client.is_online());
        assert!(matches!(
            client.forward(&"b".into(), "x".into()),
            Err(Error::RelayUnavailable)
        ));
        client.shutdown();
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_restart() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.addr();

        let (client, _rx) = RelayClient::start(addr.to_string(), "a".into(), &fast());
        within(client.wait_online()).await.unwrap();

        server.shutdown();
        let mut online = client.shared.online.subscribe();
        within(online.wait_for(|up| !*up)).await.unwrap();

        let restarted = RelayServer::start(addr).await.unwrap();
        within(client.wait_online()).await.unwrap();
        while restarted.registered().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.shutdown();
        restarted.shutdown();
    }
}
