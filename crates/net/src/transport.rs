//! Session negotiation seam
//!
//! A [`Transport`] turns the offer/answer exchange into a [`Session`]: a
//! link over which either side can open labeled, reliable, ordered
//! sub-channels ([`Pipe`]s). Offers and answers are opaque text blobs meant
//! to be copy/pasted or relayed through any side channel.
//!
//! The flow mirrors a browser peer connection:
//!
//! 1. initiator: [`Transport::create_offer`] → offer blob + [`PendingOffer`]
//! 2. responder: [`Transport::accept_offer`] → answer blob + [`Session`]
//! 3. initiator: [`PendingOffer::accept_answer`] → [`Session`]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// One message on a pipe, stamped when the transport took it
#[derive(Debug, Clone)]
pub struct Packet {
    pub received_at: Instant,
    pub payload: String,
}

impl Packet {
    pub fn now(payload: String) -> Self {
        Self {
            received_at: Instant::now(),
            payload,
        }
    }
}

/// One end of a labeled bidirectional sub-channel
#[derive(Debug)]
pub struct Pipe {
    pub label: String,
    pub tx: mpsc::UnboundedSender<Packet>,
    pub rx: mpsc::UnboundedReceiver<Packet>,
}

impl Pipe {
    /// Two crossed ends: what one sends, the other receives
    pub fn pair(label: &str) -> (Pipe, Pipe) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Pipe {
                label: label.to_string(),
                tx: a_tx,
                rx: a_rx,
            },
            Pipe {
                label: label.to_string(),
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

/// An established link between two peers
///
/// `open` hands the far end of a new pipe to the remote side, which sees it
/// on its `accept`. Dropping a session ends the remote's `accept` stream.
#[derive(Debug)]
pub struct Session {
    outgoing: mpsc::UnboundedSender<Pipe>,
    incoming: mpsc::UnboundedReceiver<Pipe>,
}

impl Session {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Pipe>,
        incoming: mpsc::UnboundedReceiver<Pipe>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    /// Two sessions wired directly to each other
    pub fn pair() -> (Session, Session) {
        let (a_out, b_in) = mpsc::unbounded_channel();
        let (b_out, a_in) = mpsc::unbounded_channel();
        (Session::new(a_out, a_in), Session::new(b_out, b_in))
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Pipe>,
        mpsc::UnboundedReceiver<Pipe>,
    ) {
        (self.outgoing, self.incoming)
    }
}

/// Open a new labeled pipe over a session's outgoing side
pub(crate) fn open_pipe(outgoing: &mpsc::UnboundedSender<Pipe>, label: &str) -> Result<Pipe> {
    let (local, far) = Pipe::pair(label);
    outgoing.send(far).map_err(|_| Error::ConnectionClosed)?;
    Ok(local)
}

/// Offer/answer negotiation backend
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start a session as initiator
    async fn create_offer(&self) -> Result<(String, Box<dyn PendingOffer>)>;

    /// Answer a peer's offer, completing the session on this side
    async fn accept_offer(&self, offer: &str) -> Result<(String, Session)>;
}

/// Initiator state between sending an offer and receiving the answer
#[async_trait]
pub trait PendingOffer: Send {
    async fn accept_answer(self: Box<Self>, answer: &str) -> Result<Session>;
}

/// Encode a negotiation descriptor as an opaque, paste-safe blob
pub fn encode_blob<T: Serialize>(descriptor: &T) -> Result<String> {
    let json = serde_json::to_vec(descriptor)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a blob produced by [`encode_blob`]
pub fn decode_blob<T: DeserializeOwned>(blob: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(blob.trim())
        .map_err(|e| Error::Negotiation(format!("blob is not base64: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Negotiation(format!("blob is not a descriptor: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Descriptor {
        kind: String,
        n: u32,
    }

    #[test]
    fn test_blob_roundtrip() {
        let d = Descriptor {
            kind: "offer".into(),
            n: 7,
        };
        let blob = encode_blob(&d).unwrap();
        assert!(blob.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(decode_blob::<Descriptor>(&blob).unwrap(), d);
    }

    #[test]
    fn test_garbage_blob_rejected() {
        assert!(matches!(
            decode_blob::<Descriptor>("%%%"),
            Err(Error::Negotiation(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"hello");
        assert!(matches!(
            decode_blob::<Descriptor>(&not_json),
            Err(Error::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_session_pair_delivers_pipes() {
        let (a, b) = Session::pair();
        let (a_out, _a_in) = a.into_parts();
        let (_b_out, mut b_in) = b.into_parts();

        let mut local = open_pipe(&a_out, "chat").unwrap();
        let mut far = b_in.recv().await.unwrap();
        assert_eq!(far.label, "chat");

        local.tx.send(Packet::now("ping".into())).unwrap();
        assert_eq!(far.rx.recv().await.unwrap().payload, "ping");
        far.tx.send(Packet::now("pong".into())).unwrap();
        assert_eq!(local.rx.recv().await.unwrap().payload, "pong");
    }
}
