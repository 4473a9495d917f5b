//! Broadcast hub.
//!
//! A single actor task owns the set of live viewers. Registration,
//! unregistration and broadcasts all travel over one command channel and are
//! applied one at a time, so every viewer sees broadcasts in submission order
//! and no broadcast interleaves with a change to the set.

mod connection;

pub use connection::*;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::db::{ExecutionRecord, Target};
use crate::metrics::DashboardSummary;

/// Default capacity of each viewer's outbound queue.
pub const DEFAULT_VIEWER_QUEUE: usize = 256;
/// Default capacity of the hub's command channel.
pub const DEFAULT_BROADCAST_QUEUE: usize = 256;

/// Identity of one registered viewer.
pub type ViewerId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("broadcast hub is not running")]
    Closed,
}

/// A message pushed to viewers, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    ExecutionCreated(ExecutionRecord),
    TargetUpdated(Target),
    SummaryUpdated(Box<DashboardSummary>),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ExecutionCreated(_) => "execution_created",
            Envelope::TargetUpdated(_) => "target_updated",
            Envelope::SummaryUpdated(_) => "summary_updated",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub viewer_queue: usize,
    pub broadcast_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            viewer_queue: DEFAULT_VIEWER_QUEUE,
            broadcast_queue: DEFAULT_BROADCAST_QUEUE,
        }
    }
}

/// A registered viewer's end of its outbound queue.
///
/// The queue closes when the hub drops the viewer, either because it was
/// unregistered, its queue overflowed, or the hub shut down.
#[derive(Debug)]
pub struct Subscription {
    pub id: ViewerId,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

enum Command {
    Register {
        capacity: usize,
        reply: oneshot::Sender<Subscription>,
    },
    Unregister {
        id: ViewerId,
    },
    Broadcast {
        payload: Arc<str>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Handle to the hub actor. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    viewer_queue: usize,
}

impl Hub {
    /// Start the hub actor on the current runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.broadcast_queue.max(1));
        tokio::spawn(run_hub(rx));
        Self {
            commands: tx,
            viewer_queue: config.viewer_queue.max(1),
        }
    }

    /// Add a viewer with the configured queue capacity.
    pub async fn register(&self) -> Result<Subscription, HubError> {
        self.register_with_capacity(self.viewer_queue).await
    }

    /// Add a viewer whose outbound queue holds `capacity` messages.
    pub async fn register_with_capacity(&self, capacity: usize) -> Result<Subscription, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Register {
                capacity: capacity.max(1),
                reply,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Remove a viewer. Removing an unknown or already removed viewer is a no-op.
    pub async fn unregister(&self, id: ViewerId) {
        let _ = self.commands.send(Command::Unregister { id }).await;
    }

    /// Queue an envelope for every live viewer.
    ///
    /// Never waits: if the hub's ingress is saturated the envelope is dropped
    /// and `false` is returned.
    pub fn broadcast(&self, envelope: &Envelope) -> bool {
        let payload = match serde_json::to_string(envelope) {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                tracing::error!(kind = envelope.kind(), "Failed to encode envelope: {}", e);
                return false;
            }
        };

        match self.commands.try_send(Command::Broadcast { payload }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(kind = envelope.kind(), "Broadcast queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(kind = envelope.kind(), "Hub stopped, dropping message");
                false
            }
        }
    }

    /// Number of live viewers, observed after every previously submitted command.
    pub async fn connection_count(&self) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Count { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Close every viewer and stop the actor.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

async fn run_hub(mut commands: mpsc::Receiver<Command>) {
    let mut viewers: BTreeMap<ViewerId, mpsc::Sender<Arc<str>>> = BTreeMap::new();
    let mut next_id: ViewerId = 1;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { capacity, reply } => {
                let id = next_id;
                next_id += 1;
                let (tx, rx) = mpsc::channel(capacity);
                if reply.send(Subscription { id, receiver: rx }).is_ok() {
                    viewers.insert(id, tx);
                    tracing::debug!(viewer = id, total = viewers.len(), "Viewer registered");
                }
            }
            Command::Unregister { id } => {
                if viewers.remove(&id).is_some() {
                    tracing::debug!(viewer = id, total = viewers.len(), "Viewer unregistered");
                }
            }
            Command::Broadcast { payload } => fan_out(&mut viewers, &payload),
            Command::Count { reply } => {
                let _ = reply.send(viewers.len());
            }
            Command::Shutdown => break,
        }
    }

    tracing::info!(count = viewers.len(), "Broadcast hub stopped, closing viewers");
}

/// Offer one payload to every viewer, dropping those that cannot take it.
fn fan_out(viewers: &mut BTreeMap<ViewerId, mpsc::Sender<Arc<str>>>, payload: &Arc<str>) {
    viewers.retain(|id, queue| match queue.try_send(Arc::clone(payload)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(viewer = id, "Viewer queue full, disconnecting");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(viewer = id, "Viewer gone, removing");
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeStatus;
    use chrono::Utc;
    use serde_json::Map;
    use tokio::sync::mpsc::error::TryRecvError;

    fn record(id: i64) -> ExecutionRecord {
        ExecutionRecord {
            id,
            target_id: 1,
            target_name: Some("web".to_string()),
            status: ProbeStatus::Success,
            response_time: 12,
            error: None,
            details: Map::new(),
            timestamp: Utc::now(),
        }
    }

    fn envelope_id(payload: &str) -> i64 {
        let value: serde_json::Value = serde_json::from_str(payload).unwrap();
        value["data"]["id"].as_i64().unwrap()
    }

    #[test]
    fn test_envelope_wire_shape() {
        let json = serde_json::to_value(Envelope::ExecutionCreated(record(7))).unwrap();
        assert_eq!(json["type"], "execution_created");
        assert_eq!(json["data"]["id"], 7);
        assert_eq!(json["data"]["job_name"], "web");

        let target = Envelope::TargetUpdated(Target::default());
        assert_eq!(serde_json::to_value(&target).unwrap()["type"], target.kind());
    }

    #[tokio::test]
    async fn test_viewer_receives_in_broadcast_order() {
        let hub = Hub::spawn(HubConfig::default());
        let mut viewer = hub.register().await.unwrap();

        for id in 0..20 {
            assert!(hub.broadcast(&Envelope::ExecutionCreated(record(id))));
        }

        for expected in 0..20 {
            let payload = viewer.receiver.recv().await.unwrap();
            assert_eq!(envelope_id(&payload), expected);
        }
    }

    #[tokio::test]
    async fn test_slow_viewer_is_dropped_others_get_everything() {
        let hub = Hub::spawn(HubConfig {
            viewer_queue: 64,
            broadcast_queue: 64,
        });
        let mut slow = hub.register_with_capacity(10).await.unwrap();
        let mut fast_a = hub.register().await.unwrap();
        let mut fast_b = hub.register().await.unwrap();
        assert_eq!(hub.connection_count().await.unwrap(), 3);

        for id in 0..50 {
            assert!(hub.broadcast(&Envelope::ExecutionCreated(record(id))));
        }
        assert_eq!(hub.connection_count().await.unwrap(), 2);

        // Exactly the ten queued before the overflow, then closed.
        for expected in 0..10 {
            let payload = slow.receiver.try_recv().unwrap();
            assert_eq!(envelope_id(&payload), expected);
        }
        assert_eq!(slow.receiver.try_recv(), Err(TryRecvError::Disconnected));

        for viewer in [&mut fast_a, &mut fast_b] {
            for expected in 0..50 {
                let payload = viewer.receiver.try_recv().unwrap();
                assert_eq!(envelope_id(&payload), expected);
            }
        }

        // Later broadcasts still go through.
        assert!(hub.broadcast(&Envelope::ExecutionCreated(record(50))));
        let payload = fast_a.receiver.recv().await.unwrap();
        assert_eq!(envelope_id(&payload), 50);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = Hub::spawn(HubConfig::default());
        let mut viewer = hub.register().await.unwrap();
        let other = hub.register().await.unwrap();

        hub.unregister(viewer.id).await;
        hub.unregister(viewer.id).await;
        hub.unregister(9999).await;

        assert_eq!(hub.connection_count().await.unwrap(), 1);
        assert!(viewer.receiver.recv().await.is_none());
        assert_ne!(viewer.id, other.id);
    }

    #[tokio::test]
    async fn test_saturated_ingress_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let hub = Hub {
            commands: tx,
            viewer_queue: 1,
        };
        assert!(hub.broadcast(&Envelope::ExecutionCreated(record(1))));
        assert!(!hub.broadcast(&Envelope::ExecutionCreated(record(2))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_viewers() {
        let hub = Hub::spawn(HubConfig::default());
        let mut viewer = hub.register().await.unwrap();

        hub.shutdown().await;
        assert!(viewer.receiver.recv().await.is_none());
        assert_eq!(hub.register().await.unwrap_err(), HubError::Closed);
        assert!(!hub.broadcast(&Envelope::ExecutionCreated(record(1))));
    }
}
