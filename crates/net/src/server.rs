//! Signaling relay server
//!
//! A minimal rendezvous service for exchanging connection offers and
//! answers between peers that have no direct path yet. Clients register an
//! endpoint id, then forward opaque payloads to other registered ids.
//! The relay never interprets payloads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use peermesh_core::EndpointId;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{read_message, write_message};
use crate::error::{Error, Result};
use crate::protocol::RelayMessage;

/// Registered client
struct Client {
    /// Distinguishes a re-registration from the connection it replaced
    session: Uuid,
    tx: mpsc::UnboundedSender<RelayMessage>,
}

/// Relay state shared across tasks
#[derive(Default)]
struct RelayState {
    clients: HashMap<EndpointId, Client>,
}

/// Relay server handle
pub struct RelayServer {
    addr: SocketAddr,
    state: Arc<RwLock<RelayState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Start a relay listening on `addr` (port 0 picks a free port)
    pub async fn start(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Relay started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(RwLock::new(RelayState::default()));

        let state_clone = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(accept_loop(listener, state_clone, shutdown_rx));

        Ok(RelayServer {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the relay's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Currently registered endpoint ids, sorted
    pub async fn registered(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.state.read().await.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop accepting and drop every client connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Relay shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<RelayState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New relay connection");
                        let state = state.clone();
                        let shutdown_rx = shutdown_rx.resubscribe();
                        tokio::spawn(handle_connection(stream, addr, state, shutdown_rx));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Relay accept loop shutting down");
                break;
            }
        }
    }
}

/// Serve one client until it disconnects or the relay shuts down
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<RelayState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);

    let (id, session, rx) = match handle_register(&mut reader, &state).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Registration failed");
            return;
        }
    };

    info!(addr = %addr, id = %id, "Relay client registered");
    let writer_handle = tokio::spawn(writer_task(writer, rx));

    loop {
        tokio::select! {
            result = read_message::<RelayMessage, _>(&mut reader) => {
                match result {
                    Ok(msg) => handle_message(msg, &id, &state).await,
                    Err(Error::ConnectionClosed) => {
                        debug!(id = %id, "Relay connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "Relay read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    writer_handle.abort();
    remove_client(&state, &id, session).await;
    info!(id = %id, "Relay client disconnected");
}

/// First message must be Register
async fn handle_register(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<RelayState>>,
) -> Result<(EndpointId, Uuid, mpsc::UnboundedReceiver<RelayMessage>)> {
    match read_message(reader).await? {
        RelayMessage::Register { id } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Uuid::new_v4();

            let mut s = state.write().await;
            if s.clients.insert(id.clone(), Client { session, tx }).is_some() {
                warn!(id = %id, "Endpoint re-registered, replacing previous connection");
            }
            Ok((id, session, rx))
        }
        _ => Err(Error::Protocol("Expected register".into())),
    }
}

/// Writer task - sends messages to the client
async fn writer_task(
    mut writer: WriteHalf<TcpStream>,
    mut rx: mpsc::UnboundedReceiver<RelayMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            debug!(error = %e, "Relay write failed");
            break;
        }
    }
}

/// Route one message from a registered client
async fn handle_message(msg: RelayMessage, sender: &EndpointId, state: &Arc<RwLock<RelayState>>) {
    match msg {
        RelayMessage::Forward { to, payload } => {
            let s = state.read().await;
            match s.clients.get(&to) {
                Some(client) => {
                    let deliver = RelayMessage::Deliver {
                        from: sender.clone(),
                        payload,
                    };
                    if client.tx.send(deliver).is_err() {
                        debug!(to = %to, "Failed to queue delivery");
                    }
                }
                None => warn!(from = %sender, to = %to, "Dropping payload for unregistered endpoint"),
            }
        }
        _ => {
            debug!(sender = %sender, "Ignoring unexpected relay message");
        }
    }
}

/// Remove a client unless a newer registration already replaced it
async fn remove_client(state: &Arc<RwLock<RelayState>>, id: &EndpointId, session: Uuid) {
    let mut s = state.write().await;
    if s.clients.get(id).is_some_and(|c| c.session == session) {
        s.clients.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn register(addr: SocketAddr, id: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &RelayMessage::Register { id: id.into() })
            .await
            .unwrap();
        stream
    }

    async fn wait_registered(server: &RelayServer, n: usize) {
        for _ in 0..100 {
            if server.registered().await.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never saw {} registrations", n);
    }

    #[tokio::test]
    async fn test_relay_start() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(server.addr().port() > 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_forward_delivers_with_sender() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut a = register(server.addr(), "a").await;
        let mut b = register(server.addr(), "b").await;
        wait_registered(&server, 2).await;
        assert_eq!(server.registered().await, vec![EndpointId::from("a"), EndpointId::from("b")]);

        write_message(
            &mut a,
            &RelayMessage::Forward {
                to: "b".into(),
                payload: "offer".into(),
            },
        )
        .await
        .unwrap();

        let got: RelayMessage = read_message(&mut b).await.unwrap();
        assert_eq!(
            got,
            RelayMessage::Deliver {
                from: "a".into(),
                payload: "offer".into()
            }
        );
        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let a = register(server.addr(), "a").await;
        wait_registered(&server, 1).await;

        drop(a);
        wait_registered(&server, 0).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_forward_required_after_register() {
        let server = RelayServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        write_message(
            &mut stream,
            &RelayMessage::Forward {
                to: "x".into(),
                payload: "p".into(),
            },
        )
        .await
        .unwrap();

        let result: Result<RelayMessage> = read_message(&mut stream).await;
        assert!(result.is_err());
        assert!(server.registered().await.is_empty());
        server.shutdown();
    }
}
