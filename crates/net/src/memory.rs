//! In-process transport
//!
//! All peers sharing one [`MemoryTransport`] can negotiate sessions with each
//! other. Offers name a parked session half; answering an offer claims it.
//! Used for tests and for running many peers inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{decode_blob, encode_blob, PendingOffer, Session, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Kind {
    Offer,
    Answer,
}

#[derive(Debug, Serialize, Deserialize)]
struct Descriptor {
    kind: Kind,
    session: Uuid,
}

/// Shared switchboard of parked session halves
#[derive(Clone, Default)]
pub struct MemoryTransport {
    parked: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of offers not yet answered
    pub fn pending_offers(&self) -> usize {
        self.parked.lock().len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_offer(&self) -> Result<(String, Box<dyn PendingOffer>)> {
        let (ours, theirs) = Session::pair();
        let session = Uuid::new_v4();
        self.parked.lock().insert(session, theirs);

        let offer = encode_blob(&Descriptor {
            kind: Kind::Offer,
            session,
        })?;
        debug!(session = %session, "Memory offer created");
        Ok((offer, Box::new(MemoryOffer { session, ours })))
    }

    async fn accept_offer(&self, offer: &str) -> Result<(String, Session)> {
        let descriptor: Descriptor = decode_blob(offer)?;
        if descriptor.kind != Kind::Offer {
            return Err(Error::Negotiation("expected an offer".into()));
        }

        let theirs = self
            .parked
            .lock()
            .remove(&descriptor.session)
            .ok_or_else(|| Error::Negotiation("unknown or already answered offer".into()))?;

        let answer = encode_blob(&Descriptor {
            kind: Kind::Answer,
            session: descriptor.session,
        })?;
        debug!(session = %descriptor.session, "Memory offer answered");
        Ok((answer, theirs))
    }
}

struct MemoryOffer {
    session: Uuid,
    ours: Session,
}

#[async_trait]
impl PendingOffer for MemoryOffer {
    async fn accept_answer(self: Box<Self>, answer: &str) -> Result<Session> {
        let descriptor: Descriptor = decode_blob(answer)?;
        if descriptor.kind != Kind::Answer || descriptor.session != self.session {
            return Err(Error::Negotiation("answer does not match offer".into()));
        }
        Ok(self.ours)
    }
}
