//! A [`SharedState`] running over the mesh
//!
//! The replica task owns the state and a broadcast group labeled
//! `state:<topic>`. The group is attached to every hub connection, present
//! and future; its membership drives who the sync barrier expects, and its
//! `update`/`sync` frames feed the merge.

use peermesh_core::{
    EndpointId, Error as CoreError, Frame, SharedState, SyncOutcome, SyncPoint, SYNC_FRAME,
    UPDATE_FRAME,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastEvent, BroadcastGroup};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::hub::{Hub, HubEvent};

enum Command<T> {
    Set(T, oneshot::Sender<Result<()>>),
    Sync(oneshot::Sender<Result<SyncPoint<T>>>),
}

/// Handle to a running replica; dropping every handle stops the task
pub struct Replica<T> {
    topic: String,
    group: BroadcastGroup,
    commands: mpsc::UnboundedSender<Command<T>>,
    values: watch::Receiver<(u64, T)>,
}

impl<T> Replica<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start replicating `topic` with every current and future hub peer
    pub fn join(hub: &Hub, topic: impl Into<String>, initial: T) -> Self {
        let topic = topic.into();
        let state = SharedState::new(topic.clone(), hub.local_id().clone(), initial.clone());
        let (group, group_events) =
            BroadcastGroup::new(format!("state:{}", topic), &[UPDATE_FRAME, SYNC_FRAME]);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (values_tx, values) = watch::channel((0, initial));

        let hub_events = hub.events();
        for connection in hub.connections() {
            attach(&group, &connection);
        }

        let task = ReplicaTask {
            hub: hub.clone(),
            state,
            group: group.clone(),
            values: values_tx,
        };
        tokio::spawn(task.run(command_rx, group_events, hub_events));
        info!(topic = %topic, "Replica joined");

        Self {
            topic,
            group,
            commands,
            values,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Peers whose replica channel is open
    pub fn members(&self) -> Vec<EndpointId> {
        self.group.members()
    }

    /// Current local value
    pub fn get(&self) -> T {
        self.values.borrow().1.clone()
    }

    pub fn clock(&self) -> u64 {
        self.values.borrow().0
    }

    /// Latest `(clock, value)`, updated after every local or remote change
    pub fn watch(&self) -> watch::Receiver<(u64, T)> {
        self.values.clone()
    }

    pub async fn set_data(&self, value: T) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Set(value, tx))
            .map_err(|_| Error::InvalidState("replica stopped".into()))?;
        rx.await.map_err(|_| Error::from(CoreError::Cancelled))?
    }

    /// Meet every current member and settle on a common value
    pub async fn wait_sync_point(&self) -> Result<SyncOutcome<T>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Sync(tx))
            .map_err(|_| Error::InvalidState("replica stopped".into()))?;
        let sync_point = rx.await.map_err(|_| Error::from(CoreError::Cancelled))??;
        Ok(sync_point.await?)
    }
}

fn attach(group: &BroadcastGroup, connection: &Connection) {
    match group.attach(connection) {
        Ok(()) => {}
        Err(Error::Core(CoreError::DuplicateHandler(_))) => {}
        Err(e) => warn!(label = %group.label(), error = %e, "Failed to attach replica channel"),
    }
}

struct ReplicaTask<T> {
    hub: Hub,
    state: SharedState<T>,
    group: BroadcastGroup,
    values: watch::Sender<(u64, T)>,
}

impl<T> ReplicaTask<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<T>>,
        mut group_events: mpsc::UnboundedReceiver<BroadcastEvent>,
        mut hub_events: broadcast::Receiver<HubEvent>,
    ) {
        let mut hub_open = true;
        loop {
            tokio::select! {
                biased;
                Some(event) = group_events.recv() => self.on_group_event(event),
                event = hub_events.recv(), if hub_open => match event {
                    Ok(HubEvent::PeerJoined { connection, .. }) => attach(&self.group, &connection),
                    Ok(HubEvent::PeerLeft { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Replica lagged behind hub events, re-attaching");
                        for connection in self.hub.connections() {
                            attach(&self.group, &connection);
                        }
                    }
                    Err(RecvError::Closed) => hub_open = false,
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        debug!(topic = %self.state.topic(), "Replica stopped");
    }

    fn on_command(&mut self, command: Command<T>) {
        let group = &self.group;
        let send = |frame: Frame| {
            if let Err(e) = group.broadcast(&frame) {
                warn!(error = %e, "Replica broadcast failed");
            }
        };

        match command {
            Command::Set(value, reply) => {
                let result = self.state.set_data(value, send).map_err(Error::from);
                let _ = reply.send(result);
            }
            Command::Sync(reply) => {
                let result = self.state.wait_sync_point(send).map_err(Error::from);
                let _ = reply.send(result);
            }
        }
        self.publish();
    }

    fn on_group_event(&mut self, event: BroadcastEvent) {
        match event {
            BroadcastEvent::Opened(id) => {
                if let Err(e) = self.state.add_remote(id.clone()) {
                    debug!(peer = %id, error = %e, "Replica member already known");
                }
            }
            BroadcastEvent::Closed(id) => self.remove_member(&id),
            BroadcastEvent::Frame(id, frame) => {
                if let Err(e) = self.state.on_frame(&id, &frame) {
                    warn!(peer = %id, error = %e, "Rejected replica frame");
                }
            }
        }
        self.publish();
    }

    fn remove_member(&mut self, id: &EndpointId) {
        if self.group.members().contains(id) {
            return;
        }
        self.state.delete_remote(id);
    }

    fn publish(&self) {
        self.values
            .send_replace((self.state.clock(), self.state.get_local_data().clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use peermesh_core::MeshConfig;
    use std::sync::Arc;
    use std::time::Duration;

    async fn within<F: std::future::Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .expect("timed out")
    }

    async fn linked_pair() -> (Hub, Hub) {
        let transport = MemoryTransport::new();
        let config = MeshConfig {
            heartbeat_interval_ms: 20,
            channel_latency_ms: 1,
            ..MeshConfig::default()
        };
        let a = Hub::new("a".into(), Arc::new(transport.clone()), config.clone());
        let b = Hub::new("b".into(), Arc::new(transport), config);

        let ca = a.new_connection();
        let cb = b.new_connection();
        let offer = ca.create_offer().await.unwrap();
        let answer = cb.consume_offer_and_get_answer(&offer).await.unwrap();
        ca.consume_answer(&answer).await.unwrap();
        let (ra, rb) = tokio::join!(a.adopt(ca), b.adopt(cb));
        ra.unwrap();
        rb.unwrap();
        (a, b)
    }

    async fn wait_members<T>(replica: &Replica<T>, count: usize)
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        within(async {
            while replica.members().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_update_reaches_peer() {
        let (a, b) = linked_pair().await;
        let ra = Replica::join(&a, "board", String::new());
        let rb = Replica::join(&b, "board", String::new());
        wait_members(&ra, 1).await;
        wait_members(&rb, 1).await;

        let (sa, sb) = within(async { tokio::join!(ra.wait_sync_point(), rb.wait_sync_point()) }).await;
        assert_eq!(sa.unwrap().participants, vec![EndpointId::from("b")]);
        assert_eq!(sb.unwrap().participants, vec![EndpointId::from("a")]);

        ra.set_data("hello".to_string()).await.unwrap();
        let mut values = rb.watch();
        within(values.wait_for(|(clock, value)| *clock == 1 && value == "hello"))
            .await
            .unwrap();
        assert_eq!(rb.get(), "hello");
        assert_eq!(rb.clock(), 1);
    }

    #[tokio::test]
    async fn test_sync_settles_on_higher_clock() {
        let (a, b) = linked_pair().await;
        let ra = Replica::join(&a, "board", 0u32);
        let rb = Replica::join(&b, "board", 0u32);
        wait_members(&ra, 1).await;
        wait_members(&rb, 1).await;
        let (first_a, first_b) =
            within(async { tokio::join!(ra.wait_sync_point(), rb.wait_sync_point()) }).await;
        first_a.unwrap();
        first_b.unwrap();

        ra.set_data(1).await.unwrap();
        ra.set_data(2).await.unwrap();

        let (sa, sb) = within(async { tokio::join!(ra.wait_sync_point(), rb.wait_sync_point()) }).await;
        let (sa, sb) = (sa.unwrap(), sb.unwrap());
        assert_eq!((sa.clock, sa.data), (2, 2));
        assert_eq!((sb.clock, sb.data), (2, 2));
        assert_eq!(rb.get(), 2);
    }

    #[tokio::test]
    async fn test_set_during_lonely_sync() {
        let transport = MemoryTransport::new();
        let hub = Hub::new("solo".into(), Arc::new(transport), MeshConfig::default());
        let replica = Replica::join(&hub, "board", 5u8);

        let outcome = within(replica.wait_sync_point()).await.unwrap();
        assert_eq!(outcome.data, 5);
        assert!(outcome.participants.is_empty());
        replica.set_data(6).await.unwrap();
        assert_eq!(replica.get(), 6);
    }
}
