//! TCP transport
//!
//! The initiator listens on an ephemeral port and puts `{addr, token}` in
//! its offer; the responder dials that address and greets with the token.
//! All pipes of a session are multiplexed over the one stream as
//! length-prefixed [`MuxFrame`]s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec::{read_message, write_message};
use crate::error::{Error, Result};
use crate::transport::{
    decode_blob, encode_blob, Packet, PendingOffer, Pipe, Session, Transport,
};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Descriptor {
    Offer { addr: SocketAddr, token: Uuid },
    Answer { token: Uuid },
}

/// Frames multiplexed over one session stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum MuxFrame {
    Hello { token: Uuid },
    Open { label: String },
    Data { label: String, payload: String },
    Close { label: String },
}

/// Sessions over direct TCP streams
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind: SocketAddr,
}

impl TcpTransport {
    /// Listen for answers on `bind`; port 0 picks a fresh port per offer
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn create_offer(&self) -> Result<(String, Box<dyn PendingOffer>)> {
        let listener = TcpListener::bind(self.bind).await?;
        let addr = listener.local_addr()?;
        let token = Uuid::new_v4();

        let offer = encode_blob(&Descriptor::Offer { addr, token })?;
        debug!(addr = %addr, "TCP offer created");
        Ok((offer, Box::new(TcpOffer { listener, token })))
    }

    async fn accept_offer(&self, offer: &str) -> Result<(String, Session)> {
        let Descriptor::Offer { addr, token } = decode_blob::<Descriptor>(offer)? else {
            return Err(Error::Negotiation("expected an offer".into()));
        };

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Negotiation(format!("cannot reach {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        write_message(&mut stream, &MuxFrame::Hello { token }).await?;

        let answer = encode_blob(&Descriptor::Answer { token })?;
        debug!(addr = %addr, "TCP offer answered");
        Ok((answer, spawn_session(stream)))
    }
}

struct TcpOffer {
    listener: TcpListener,
    token: Uuid,
}

impl TcpOffer {
    async fn accept_greeted(&self) -> Result<TcpStream> {
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            match read_message::<MuxFrame, _>(&mut stream).await {
                Ok(MuxFrame::Hello { token }) if token == self.token => {
                    stream.set_nodelay(true)?;
                    debug!(peer = %peer, "TCP session accepted");
                    return Ok(stream);
                }
                Ok(other) => warn!(peer = %peer, frame = ?other, "Unexpected greeting, dropping"),
                Err(e) => warn!(peer = %peer, error = %e, "Bad greeting, dropping"),
            }
        }
    }
}

#[async_trait]
impl PendingOffer for TcpOffer {
    async fn accept_answer(self: Box<Self>, answer: &str) -> Result<Session> {
        match decode_blob::<Descriptor>(answer)? {
            Descriptor::Answer { token } if token == self.token => {}
            _ => return Err(Error::Negotiation("answer does not match offer".into())),
        }

        let stream = tokio::time::timeout(ACCEPT_TIMEOUT, self.accept_greeted())
            .await
            .map_err(|_| Error::Negotiation("peer never connected".into()))??;
        Ok(spawn_session(stream))
    }
}

/// Run the multiplexer for one stream and return its session
fn spawn_session(stream: TcpStream) -> Session {
    let (read_half, write_half) = stream.into_split();
    let (wire_out, wire_out_rx) = mpsc::unbounded_channel();
    let (wire_in_tx, wire_in) = mpsc::unbounded_channel();
    let (outgoing, opened) = mpsc::unbounded_channel();
    let (accepted, incoming) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_loop(read_half, wire_in_tx));
    let writer = tokio::spawn(write_loop(write_half, wire_out_rx));
    tokio::spawn(async move {
        Mux {
            routes: HashMap::new(),
            wire_out,
            accepted,
        }
        .run(opened, wire_in)
        .await;
        reader.abort();
        writer.abort();
    });

    Session::new(outgoing, incoming)
}

async fn read_loop(mut reader: OwnedReadHalf, frames: mpsc::UnboundedSender<MuxFrame>) {
    loop {
        match read_message::<MuxFrame, _>(&mut reader).await {
            Ok(frame) => {
                if frames.send(frame).is_err() {
                    break;
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!("TCP session closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "TCP session read failed");
                break;
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<MuxFrame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_message(&mut writer, &frame).await {
            warn!(error = %e, "TCP session write failed");
            break;
        }
    }
}

struct Mux {
    routes: HashMap<String, mpsc::UnboundedSender<Packet>>,
    wire_out: mpsc::UnboundedSender<MuxFrame>,
    accepted: mpsc::UnboundedSender<Pipe>,
}

impl Mux {
    async fn run(
        mut self,
        mut opened: mpsc::UnboundedReceiver<Pipe>,
        mut wire_in: mpsc::UnboundedReceiver<MuxFrame>,
    ) {
        loop {
            tokio::select! {
                pipe = opened.recv() => match pipe {
                    Some(pipe) => self.open_local(pipe),
                    None => break,
                },
                frame = wire_in.recv() => match frame {
                    Some(frame) => self.on_wire(frame),
                    None => break,
                },
            }
        }
        debug!(pipes = self.routes.len(), "TCP session ended");
    }

    /// A pipe opened on this side; `pipe` is the far end handed to us
    fn open_local(&mut self, pipe: Pipe) {
        if self
            .wire_out
            .send(MuxFrame::Open {
                label: pipe.label.clone(),
            })
            .is_err()
        {
            return;
        }
        self.route(pipe);
    }

    fn on_wire(&mut self, frame: MuxFrame) {
        match frame {
            MuxFrame::Open { label } => {
                let (app_end, mux_end) = Pipe::pair(&label);
                self.route(mux_end);
                if self.accepted.send(app_end).is_err() {
                    debug!(label = %label, "Session no longer accepting pipes");
                }
            }
            MuxFrame::Data { label, payload } => match self.routes.get(&label) {
                Some(tx) => {
                    let _ = tx.send(Packet::now(payload));
                }
                None => trace!(label = %label, "Data for unknown pipe"),
            },
            MuxFrame::Close { label } => {
                self.routes.remove(&label);
            }
            MuxFrame::Hello { .. } => warn!("Repeated greeting ignored"),
        }
    }

    /// Deliver wire data into `pipe` and ship what it sends onto the wire
    fn route(&mut self, pipe: Pipe) {
        let Pipe { label, tx, mut rx } = pipe;
        self.routes.insert(label.clone(), tx);

        let wire_out = self.wire_out.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let data = MuxFrame::Data {
                    label: label.clone(),
                    payload: packet.payload,
                };
                if wire_out.send(data).is_err() {
                    return;
                }
            }
            let _ = wire_out.send(MuxFrame::Close { label });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::open_pipe;

    async fn connected() -> (Session, Session) {
        let transport = TcpTransport::default();
        let (offer, pending) = transport.create_offer().await.unwrap();
        let (answer, responder) = transport.accept_offer(&offer).await.unwrap();
        let initiator = pending.accept_answer(&answer).await.unwrap();
        (initiator, responder)
    }

    #[test]
    fn test_mux_frame_wire_shape() {
        let frame = MuxFrame::Data {
            label: "hub".into(),
            payload: "{}".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["label"], "hub");
    }

    #[tokio::test]
    async fn test_pipe_over_tcp() {
        let (initiator, responder) = connected().await;
        let (out, _in) = initiator.into_parts();
        let (_out, mut accepted) = responder.into_parts();

        let mut local = open_pipe(&out, "chat").unwrap();
        let mut far = accepted.recv().await.unwrap();
        assert_eq!(far.label, "chat");

        local.tx.send(Packet::now("ping".into())).unwrap();
        assert_eq!(far.rx.recv().await.unwrap().payload, "ping");
        far.tx.send(Packet::now("pong".into())).unwrap();
        assert_eq!(local.rx.recv().await.unwrap().payload, "pong");
    }

    #[tokio::test]
    async fn test_dropping_session_ends_remote_accept() {
        let (initiator, responder) = connected().await;
        let (_out, mut accepted) = responder.into_parts();
        drop(initiator);

        let ended = tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .unwrap();
        assert!(ended.is_none());
    }

    #[tokio::test]
    async fn test_wrong_answer_rejected() {
        let transport = TcpTransport::default();
        let (_offer, pending) = transport.create_offer().await.unwrap();
        let bogus = encode_blob(&Descriptor::Answer {
            token: Uuid::new_v4(),
        })
        .unwrap();
        assert!(matches!(
            pending.accept_answer(&bogus).await,
            Err(Error::Negotiation(_))
        ));
    }
}
