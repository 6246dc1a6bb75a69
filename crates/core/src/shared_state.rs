//! Eventually-consistent replicated value
//!
//! Each replica holds a copy of the value and a logical clock. A local
//! [`SharedState::set_data`] bumps the clock and broadcasts an `update`
//! frame; receivers keep the highest clock they have seen and, among
//! updates at that clock, the one from the smallest peer id. The winner is
//! a deterministic function of the updates seen, so replicas that see the
//! same updates end with the same `(clock, data)` regardless of delivery order.
//!
//! A sync point is a barrier-gated snapshot built on the embedded
//! [`MeetingPoint`]: every participant broadcasts its `(clock, data)` in a
//! `sync` frame, and once all expected peers have checked in each replica
//! resolves to the same winner (highest clock, then smallest id). The
//! snapshot is only yielded to the waiter; local `(clock, data)` keeps
//! following `update` frames.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::endpoint::EndpointId;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::invariants::assert_clock_monotonic;
use crate::meeting_point::MeetingPoint;

pub const UPDATE_FRAME: &str = "update";
pub const SYNC_FRAME: &str = "sync";

#[derive(Debug, Serialize, Deserialize)]
struct UpdatePayload<T> {
    clock: u64,
    data: T,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload<T> {
    clock: u64,
    data: T,
    meeting_point_frame: Frame,
}

#[derive(Debug, Clone)]
struct Candidate<T> {
    id: EndpointId,
    clock: u64,
    data: T,
}

impl<T> Candidate<T> {
    /// Higher clock wins; equal clocks go to the smaller id
    fn beats(&self, other: &Candidate<T>) -> bool {
        self.clock > other.clock || (self.clock == other.clock && self.id < other.id)
    }
}

/// Keep `incoming` if it beats the current best
fn register<T>(slot: &mut Option<Candidate<T>>, incoming: Candidate<T>) {
    if slot.as_ref().map_or(true, |best| incoming.beats(best)) {
        *slot = Some(incoming);
    }
}

/// Result of a completed sync point
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome<T> {
    /// Winning data across all participants
    pub data: T,
    /// Clock of the winning data
    pub clock: u64,
    /// Remote peers that took part in the round
    pub participants: Vec<EndpointId>,
}

type Observer<T> = Box<dyn FnMut(&T) + Send>;

/// Replicated value for one topic
pub struct SharedState<T> {
    topic: String,
    local_id: EndpointId,
    clock: u64,
    data: T,
    candidate: Option<Candidate<T>>,
    sync_candidate: Option<Candidate<T>>,
    sync_waiter: Option<oneshot::Sender<SyncOutcome<T>>>,
    meeting: MeetingPoint,
    observers: Vec<Observer<T>>,
}

impl<T> SharedState<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(topic: impl Into<String>, local_id: EndpointId, initial: T) -> Self {
        Self {
            topic: topic.into(),
            meeting: MeetingPoint::new(local_id.clone()),
            local_id,
            clock: 0,
            data: initial,
            candidate: None,
            sync_candidate: None,
            sync_waiter: None,
            observers: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn get_local_data(&self) -> &T {
        &self.data
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_waiter.is_some()
    }

    pub fn meeting_point(&self) -> &MeetingPoint {
        &self.meeting
    }

    /// Call `observer` with the new value after every local or remote change
    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Set a new value locally and broadcast it
    pub fn set_data<F>(&mut self, value: T, broadcast: F) -> Result<()>
    where
        F: FnOnce(Frame),
    {
        if self.is_syncing() {
            return Err(Error::SyncInProgress);
        }

        let clock = self.clock + 1;
        let frame = Frame::encode(UPDATE_FRAME, &UpdatePayload { clock, data: &value })?;

        self.clock = clock;
        self.candidate = Some(Candidate {
            id: self.local_id.clone(),
            clock,
            data: value.clone(),
        });
        self.data = value;
        debug!(topic = %self.topic, clock, "Local shared state update");

        broadcast(frame);
        self.notify();
        Ok(())
    }

    /// Handle an `update` or `sync` frame from `from`
    pub fn on_frame(&mut self, from: &EndpointId, frame: &Frame) -> Result<()> {
        match frame.frame_type.as_str() {
            UPDATE_FRAME => {
                let payload: UpdatePayload<T> = frame.decode()?;
                self.on_update(from, payload);
                Ok(())
            }
            SYNC_FRAME => {
                let payload: SyncPayload<T> = frame.decode()?;
                self.on_sync(from, payload)
            }
            other => Err(Error::UnhandledFrame(other.to_string())),
        }
    }

    fn on_update(&mut self, from: &EndpointId, payload: UpdatePayload<T>) {
        if payload.clock < self.clock {
            debug!(
                topic = %self.topic,
                peer = %from,
                clock = payload.clock,
                local_clock = self.clock,
                "Dropping stale update"
            );
            return;
        }

        self.apply(Candidate {
            id: from.clone(),
            clock: payload.clock,
            data: payload.data,
        });
    }

    /// Merge a candidate that is at least as recent as the local clock
    fn apply(&mut self, incoming: Candidate<T>) {
        register(&mut self.candidate, incoming);

        let Some(winner) = self.candidate.as_ref() else {
            return;
        };
        let next = self.clock.max(winner.clock);
        assert_clock_monotonic(self.clock, next, "shared state merge");
        self.clock = next;
        self.data = winner.data.clone();
        trace!(topic = %self.topic, clock = next, winner = %winner.id, "Shared state merged");

        self.notify();
    }

    /// Arrive at the sync point and wait for every expected peer
    pub fn wait_sync_point<F>(&mut self, broadcast: F) -> Result<SyncPoint<T>>
    where
        F: FnOnce(Frame),
    {
        if self.is_syncing() || self.meeting.is_waiting() {
            return Err(Error::WaitPending);
        }

        let frame = Frame::encode(
            SYNC_FRAME,
            &SyncPayload {
                clock: self.clock,
                data: &self.data,
                meeting_point_frame: self.meeting.frame(),
            },
        )?;

        let (tx, rx) = oneshot::channel();
        register(
            &mut self.sync_candidate,
            Candidate {
                id: self.local_id.clone(),
                clock: self.clock,
                data: self.data.clone(),
            },
        );
        self.sync_waiter = Some(tx);
        debug!(topic = %self.topic, clock = self.clock, "Waiting at sync point");

        broadcast(frame);
        if let Some(roster) = self.meeting.begin_wait()? {
            self.finish_sync(roster);
        }
        Ok(SyncPoint { rx })
    }

    fn on_sync(&mut self, from: &EndpointId, payload: SyncPayload<T>) -> Result<()> {
        let meeting_frame = payload.meeting_point_frame;
        register(
            &mut self.sync_candidate,
            Candidate {
                id: from.clone(),
                clock: payload.clock,
                data: payload.data,
            },
        );

        let released = self
            .meeting
            .handle_frame(from, &meeting_frame)
            .map_err(|_| {
                Error::MalformedFrame(format!(
                    "sync frame carries '{}' instead of a meeting frame",
                    meeting_frame.frame_type
                ))
            })?;
        if let Some(roster) = released {
            self.finish_sync(roster);
        }
        Ok(())
    }

    /// Start expecting `id` at sync points
    pub fn add_remote(&mut self, id: EndpointId) -> Result<()> {
        self.meeting.add_remote(id)
    }

    /// Stop expecting `id`; may complete a pending sync point
    pub fn delete_remote(&mut self, id: &EndpointId) {
        if let Some(roster) = self.meeting.delete_remote(id) {
            self.finish_sync(roster);
        }
    }

    fn finish_sync(&mut self, participants: Vec<EndpointId>) {
        let Some(waiter) = self.sync_waiter.take() else {
            return;
        };
        let winner = self.sync_candidate.take().unwrap_or_else(|| Candidate {
            id: self.local_id.clone(),
            clock: self.clock,
            data: self.data.clone(),
        });

        let outcome = SyncOutcome {
            data: winner.data.clone(),
            clock: winner.clock,
            participants,
        };
        debug!(
            topic = %self.topic,
            clock = winner.clock,
            winner = %winner.id,
            participants = outcome.participants.len(),
            "Sync point reached"
        );

        if waiter.send(outcome).is_err() {
            debug!(topic = %self.topic, "Sync point waiter dropped");
        }
    }

    fn notify(&mut self) {
        for observer in self.observers.iter_mut() {
            observer(&self.data);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SharedState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("topic", &self.topic)
            .field("local_id", &self.local_id)
            .field("clock", &self.clock)
            .field("data", &self.data)
            .field("syncing", &self.sync_waiter.is_some())
            .finish()
    }
}

/// Future returned by [`SharedState::wait_sync_point`]
#[derive(Debug)]
pub struct SyncPoint<T> {
    rx: oneshot::Receiver<SyncOutcome<T>>,
}

impl<T> Future for SyncPoint<T> {
    type Output = Result<SyncOutcome<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::Cancelled))
    }
}
