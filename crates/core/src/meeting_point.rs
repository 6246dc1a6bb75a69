//! Dynamic-membership rendezvous barrier
//!
//! A [`MeetingPoint`] tracks the set of peers expected at the next
//! rendezvous and which of them have already checked in. A local
//! [`MeetingPoint::wait`] completes once every expected peer has sent its
//! meeting frame for the current round; completion clears the round.
//!
//! Peers may come and go while a wait is pending. Removing a peer re-evaluates
//! the barrier immediately, so a departure can release a stuck wait. A peer
//! that leaves without checking in must be removed with
//! [`MeetingPoint::delete_remote`], otherwise the round never completes.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::endpoint::EndpointId;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::invariants::assert_meeting_invariants;

/// Frame type of a meeting check-in
pub const MEETING_FRAME: &str = "meet";

/// Participation changes reported to an observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingEvent {
    /// A peer checked in and is waiting for the others
    Waiting(EndpointId),
    /// The round completed; this peer is no longer waiting
    Released(EndpointId),
}

enum Waiter {
    Idle,
    Armed(Option<oneshot::Sender<Vec<EndpointId>>>),
}

/// Rendezvous barrier with mutable membership
pub struct MeetingPoint {
    local_id: EndpointId,
    peer_set: BTreeSet<EndpointId>,
    joined: BTreeSet<EndpointId>,
    waiter: Waiter,
    observer: Option<Box<dyn FnMut(MeetingEvent) + Send>>,
}

impl MeetingPoint {
    pub fn new(local_id: EndpointId) -> Self {
        Self {
            local_id,
            peer_set: BTreeSet::new(),
            joined: BTreeSet::new(),
            waiter: Waiter::Idle,
            observer: None,
        }
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    /// Peers expected at the rendezvous
    pub fn peers(&self) -> impl Iterator<Item = &EndpointId> {
        self.peer_set.iter()
    }

    /// Peers that checked in during the current round
    pub fn joined(&self) -> impl Iterator<Item = &EndpointId> {
        self.joined.iter()
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.waiter, Waiter::Armed(_))
    }

    /// Install the participation observer, replacing any previous one
    pub fn observe<F>(&mut self, observer: F)
    where
        F: FnMut(MeetingEvent) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    /// The frame peers send to check in
    pub fn frame(&self) -> Frame {
        Frame::new(MEETING_FRAME, Value::Null)
    }

    /// Expect `id` at future rendezvous
    pub fn add_remote(&mut self, id: EndpointId) -> Result<()> {
        if id == self.local_id {
            return Err(Error::InvariantViolation(format!(
                "meeting point cannot expect its own id {}",
                id
            )));
        }
        if self.peer_set.contains(&id) {
            return Err(Error::InvariantViolation(format!(
                "peer {} already expected at meeting point",
                id
            )));
        }

        debug!(peer = %id, "Meeting point peer added");
        self.peer_set.insert(id);
        assert_meeting_invariants(&self.local_id, &self.peer_set, &self.joined);
        Ok(())
    }

    /// Stop expecting `id`. Returns the roster if this released a pending wait.
    pub fn delete_remote(&mut self, id: &EndpointId) -> Option<Vec<EndpointId>> {
        if !self.peer_set.remove(id) {
            debug!(peer = %id, "Meeting point delete for unknown peer");
            return None;
        }
        self.joined.remove(id);
        debug!(peer = %id, "Meeting point peer removed");
        assert_meeting_invariants(&self.local_id, &self.peer_set, &self.joined);

        self.try_release()
    }

    /// Wait until every expected peer has checked in
    pub fn wait(&mut self) -> Result<Rendezvous> {
        let (tx, rx) = oneshot::channel();
        if self.is_waiting() {
            return Err(Error::WaitPending);
        }
        self.waiter = Waiter::Armed(Some(tx));
        self.try_release();
        Ok(Rendezvous { rx })
    }

    /// Arm the barrier without a future; the release roster is returned by
    /// whichever call completes the round.
    pub(crate) fn begin_wait(&mut self) -> Result<Option<Vec<EndpointId>>> {
        if self.is_waiting() {
            return Err(Error::WaitPending);
        }
        self.waiter = Waiter::Armed(None);
        Ok(self.try_release())
    }

    /// Handle a meeting frame from `from`
    pub fn handle_frame(
        &mut self,
        from: &EndpointId,
        frame: &Frame,
    ) -> Result<Option<Vec<EndpointId>>> {
        if frame.frame_type != MEETING_FRAME {
            return Err(Error::UnhandledFrame(frame.frame_type.clone()));
        }
        Ok(self.on_frame(from))
    }

    /// Record that `from` checked in. Returns the roster if this released a pending wait.
    pub fn on_frame(&mut self, from: &EndpointId) -> Option<Vec<EndpointId>> {
        if !self.peer_set.contains(from) {
            warn!(peer = %from, "Meeting frame from peer outside the meeting set");
            return None;
        }

        if self.joined.insert(from.clone()) {
            self.notify(MeetingEvent::Waiting(from.clone()));
        }
        self.try_release()
    }

    fn try_release(&mut self) -> Option<Vec<EndpointId>> {
        if !self.is_waiting() || !self.peer_set.is_subset(&self.joined) {
            return None;
        }

        let roster: Vec<EndpointId> = std::mem::take(&mut self.joined).into_iter().collect();
        for id in &roster {
            self.notify(MeetingEvent::Released(id.clone()));
        }

        if let Waiter::Armed(Some(tx)) = std::mem::replace(&mut self.waiter, Waiter::Idle) {
            if tx.send(roster.clone()).is_err() {
                debug!("Meeting point waiter dropped before release");
            }
        }

        debug!(participants = roster.len(), "Meeting point released");
        Some(roster)
    }

    fn notify(&mut self, event: MeetingEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }
}

impl std::fmt::Debug for MeetingPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingPoint")
            .field("local_id", &self.local_id)
            .field("peer_set", &self.peer_set)
            .field("joined", &self.joined)
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

/// Future returned by [`MeetingPoint::wait`]; yields the participating peers
#[derive(Debug)]
pub struct Rendezvous {
    rx: oneshot::Receiver<Vec<EndpointId>>,
}

impl Future for Rendezvous {
    type Output = Result<Vec<EndpointId>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::Cancelled))
    }
}
