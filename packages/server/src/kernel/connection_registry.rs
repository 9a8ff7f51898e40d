//! Live notification sinks, keyed by owner.
//!
//! An owner may hold several connections at once (tabs, devices). Sinks are
//! written with non-blocking sends only, so a shard lock is never held across
//! an await or a slow client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::common::OwnerId;

/// One server-sent event, already serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub event: String,
    pub data: String,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: &serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data: data.to_string(),
        }
    }

    /// `event: <type>\ndata: <json>\n\n`
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,

    #[error("connection buffer full")]
    Backpressure,
}

/// Anything that can accept a frame without blocking.
pub trait EventSink: Send + Sync {
    fn try_deliver(&self, frame: &EventFrame) -> Result<(), DeliveryError>;
}

/// Sink backed by a bounded channel whose receiver feeds an SSE response.
pub struct ChannelSink {
    tx: mpsc::Sender<EventFrame>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EventFrame>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn try_deliver(&self, frame: &EventFrame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

struct Subscriber {
    connection_id: u64,
    sink: Arc<dyn EventSink>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    owners: DashMap<OwnerId, Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Thread-safe, cloneable map from owner to open sinks.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink for `owner`. The sink stays registered until the returned
    /// guard is dropped or a write to it fails.
    pub fn register(&self, owner: OwnerId, sink: Arc<dyn EventSink>) -> Registration {
        let connection_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let created_at = Utc::now();

        self.inner
            .owners
            .entry(owner)
            .or_default()
            .push(Subscriber {
                connection_id,
                sink,
                created_at,
            });

        tracing::debug!(owner_id = %owner, connection_id, "live connection registered");

        Registration {
            registry: self.clone(),
            owner,
            connection_id,
            created_at,
        }
    }

    fn deregister(&self, owner: OwnerId, connection_id: u64) {
        let now_empty = match self.inner.owners.get_mut(&owner) {
            Some(mut subscribers) => {
                subscribers.retain(|s| s.connection_id != connection_id);
                subscribers.is_empty()
            }
            None => return,
        };

        if now_empty {
            self.inner.owners.remove_if(&owner, |_, subs| subs.is_empty());
        }

        tracing::debug!(owner_id = %owner, connection_id, "live connection closed");
    }

    /// Write `frame` to every sink registered under `owner`. Sinks that fail
    /// are dropped; the rest still receive the frame. Returns how many sinks
    /// accepted it.
    pub fn deliver(&self, owner: OwnerId, frame: &EventFrame) -> usize {
        let (delivered, now_empty) = match self.inner.owners.get_mut(&owner) {
            Some(mut subscribers) => {
                let delivered = deliver_to(owner, &mut subscribers, frame);
                (delivered, subscribers.is_empty())
            }
            None => return 0,
        };

        if now_empty {
            self.inner.owners.remove_if(&owner, |_, subs| subs.is_empty());
        }
        delivered
    }

    /// Write `frame` to every registered sink of every owner.
    pub fn deliver_all(&self, frame: &EventFrame) -> usize {
        let mut delivered = 0;
        for mut entry in self.inner.owners.iter_mut() {
            let owner = *entry.key();
            delivered += deliver_to(owner, entry.value_mut(), frame);
        }
        self.inner.owners.retain(|_, subs| !subs.is_empty());
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.inner.owners.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn owner_connection_count(&self, owner: OwnerId) -> usize {
        self.inner
            .owners
            .get(&owner)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn owner_count(&self) -> usize {
        self.inner.owners.len()
    }
}

fn deliver_to(owner: OwnerId, subscribers: &mut Vec<Subscriber>, frame: &EventFrame) -> usize {
    let mut delivered = 0;
    subscribers.retain(|subscriber| match subscriber.sink.try_deliver(frame) {
        Ok(()) => {
            delivered += 1;
            true
        }
        Err(e) => {
            tracing::warn!(
                owner_id = %owner,
                connection_id = subscriber.connection_id,
                connected_for_secs = (Utc::now() - subscriber.created_at).num_seconds(),
                event = %frame.event,
                error = %e,
                "dropping live connection after failed write"
            );
            false
        }
    });
    delivered
}

/// Keeps a sink registered. Dropping it removes the sink.
pub struct Registration {
    registry: ConnectionRegistry,
    owner: OwnerId,
    connection_id: u64,
    created_at: DateTime<Utc>,
}

impl Registration {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.owner, self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<EventFrame>>,
    }

    impl EventSink for RecordingSink {
        fn try_deliver(&self, frame: &EventFrame) -> Result<(), DeliveryError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    impl RecordingSink {
        fn len(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    struct BrokenSink;

    impl EventSink for BrokenSink {
        fn try_deliver(&self, _frame: &EventFrame) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }
    }

    fn frame() -> EventFrame {
        EventFrame::new("analysis_started", &json!({"type": "analysis_started"}))
    }

    #[test]
    fn wire_format() {
        let frame = EventFrame::new("heartbeat", &json!({"type": "heartbeat"}));
        assert_eq!(
            frame.to_wire(),
            "event: heartbeat\ndata: {\"type\":\"heartbeat\"}\n\n"
        );
    }

    #[test]
    fn delivers_only_to_the_target_owner() {
        let registry = ConnectionRegistry::new();
        let (alice, bob) = (OwnerId::new(), OwnerId::new());
        let alice_tab = Arc::new(RecordingSink::default());
        let alice_phone = Arc::new(RecordingSink::default());
        let bob_tab = Arc::new(RecordingSink::default());

        let _a1 = registry.register(alice, alice_tab.clone());
        let _a2 = registry.register(alice, alice_phone.clone());
        let _b1 = registry.register(bob, bob_tab.clone());

        assert_eq!(registry.deliver(alice, &frame()), 2);
        assert_eq!(alice_tab.len(), 1);
        assert_eq!(alice_phone.len(), 1);
        assert_eq!(bob_tab.len(), 0);
    }

    #[test]
    fn failed_sink_is_removed_without_blocking_the_others() {
        let registry = ConnectionRegistry::new();
        let owner = OwnerId::new();
        let healthy = Arc::new(RecordingSink::default());

        let _broken = registry.register(owner, Arc::new(BrokenSink));
        let _healthy = registry.register(owner, healthy.clone());

        assert_eq!(registry.deliver(owner, &frame()), 1);
        assert_eq!(healthy.len(), 1);
        assert_eq!(registry.owner_connection_count(owner), 1);

        assert_eq!(registry.deliver(owner, &frame()), 1);
        assert_eq!(healthy.len(), 2);
    }

    #[test]
    fn dropping_the_registration_removes_the_entry() {
        let registry = ConnectionRegistry::new();
        let owner = OwnerId::new();

        let registration = registry.register(owner, Arc::new(RecordingSink::default()));
        assert_eq!(registry.connection_count(), 1);

        drop(registration);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.owner_count(), 0);
        assert_eq!(registry.deliver(owner, &frame()), 0);
    }

    #[test]
    fn broken_sink_then_guard_drop_is_harmless() {
        let registry = ConnectionRegistry::new();
        let owner = OwnerId::new();

        let registration = registry.register(owner, Arc::new(BrokenSink));
        assert_eq!(registry.deliver(owner, &frame()), 0);
        assert_eq!(registry.owner_count(), 0);

        drop(registration);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn deliver_all_reaches_every_owner() {
        let registry = ConnectionRegistry::new();
        let sinks: Vec<_> = (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        let _guards: Vec<_> = sinks
            .iter()
            .map(|sink| registry.register(OwnerId::new(), sink.clone()))
            .collect();
        let _dead = registry.register(OwnerId::new(), Arc::new(BrokenSink));

        assert_eq!(registry.deliver_all(&frame()), 3);
        assert!(sinks.iter().all(|sink| sink.len() == 1));
        assert_eq!(registry.owner_count(), 3);
    }

    #[tokio::test]
    async fn full_channel_counts_as_a_failed_write() {
        let registry = ConnectionRegistry::new();
        let owner = OwnerId::new();
        let (tx, mut rx) = mpsc::channel(1);
        let _registration = registry.register(owner, Arc::new(ChannelSink::new(tx)));

        assert_eq!(registry.deliver(owner, &frame()), 1);
        assert_eq!(registry.deliver(owner, &frame()), 0);
        assert_eq!(registry.connection_count(), 0);

        assert_eq!(rx.recv().await, Some(frame()));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn concurrent_registration_is_safe() {
        let registry = ConnectionRegistry::new();
        let owner = OwnerId::new();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let registry = registry.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        let guard = registry.register(owner, Arc::new(RecordingSink::default()));
                        registry.deliver(owner, &frame());
                        drop(guard);
                    }
                });
            }
        });

        assert_eq!(registry.connection_count(), 0);
    }
}
