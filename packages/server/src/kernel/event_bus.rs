//! Best-effort fan-out of live events to an owner's open connections.
//!
//! There is no queue and no replay: a connection that is not open when an
//! event is published misses it and re-reads the record after reconnecting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection_registry::{ChannelSink, ConnectionRegistry, EventFrame};
use super::sse::LiveEventStream;
use crate::common::OwnerId;

pub const HEARTBEAT_EVENT: &str = "heartbeat";

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub heartbeat_interval: Duration,
    /// Frames buffered per connection before it counts as stalled.
    pub sink_buffer: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            sink_buffer: 64,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: ConnectionRegistry,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Send one event to every connection `owner` has open. Returns the
    /// number of connections that accepted it.
    pub fn publish(&self, owner: OwnerId, event_type: &str, payload: &Value) -> usize {
        let frame = EventFrame::new(event_type, payload);
        let delivered = self.registry.deliver(owner, &frame);
        tracing::debug!(owner_id = %owner, event = event_type, delivered, "published live event");
        delivered
    }

    /// Open a live connection for `owner`.
    pub fn subscribe(&self, owner: OwnerId) -> LiveEventStream {
        let (tx, rx) = mpsc::channel(self.config.sink_buffer.max(1));
        let registration = self.registry.register(owner, Arc::new(ChannelSink::new(tx)));
        LiveEventStream::new(rx, registration)
    }

    /// Emit one liveness pulse to every open connection.
    pub fn pulse(&self) -> usize {
        let frame = EventFrame::new(
            HEARTBEAT_EVENT,
            &json!({ "type": HEARTBEAT_EVENT, "timestamp": Utc::now().to_rfc3339() }),
        );
        self.registry.deliver_all(&frame)
    }

    /// Run `pulse` on a fixed interval until `shutdown` fires.
    pub fn spawn_heartbeat(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let bus = self.clone();
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reached = bus.pulse();
                        tracing::trace!(reached, "heartbeat sent");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_reaches_every_subscription_of_the_owner() {
        let bus = EventBus::default();
        let owner = OwnerId::new();
        let mut first = bus.subscribe(owner);
        let mut second = bus.subscribe(owner);
        let mut stranger = bus.subscribe(OwnerId::new());

        let delivered = bus.publish(owner, "analysis_started", &json!({"type": "analysis_started"}));
        assert_eq!(delivered, 2);

        assert_eq!(first.next().await.unwrap().event, "analysis_started");
        assert_eq!(second.next().await.unwrap().event, "analysis_started");

        bus.pulse();
        assert_eq!(stranger.next().await.unwrap().event, HEARTBEAT_EVENT);
    }

    #[tokio::test]
    async fn dropped_stream_unregisters() {
        let bus = EventBus::default();
        let owner = OwnerId::new();

        let stream = bus.subscribe(owner);
        assert_eq!(bus.registry().owner_connection_count(owner), 1);

        drop(stream);
        assert_eq!(bus.registry().owner_connection_count(owner), 0);
        assert_eq!(bus.publish(owner, "error", &json!({})), 0);
    }

    #[tokio::test]
    async fn stalled_connection_is_dropped() {
        let bus = EventBus::new(EventBusConfig {
            sink_buffer: 2,
            ..EventBusConfig::default()
        });
        let owner = OwnerId::new();
        let _stalled = bus.subscribe(owner);

        assert_eq!(bus.pulse(), 1);
        assert_eq!(bus.pulse(), 1);
        assert_eq!(bus.pulse(), 0);
        assert_eq!(bus.registry().connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ticks_until_cancelled() {
        let bus = EventBus::new(EventBusConfig {
            heartbeat_interval: Duration::from_secs(5),
            sink_buffer: 16,
        });
        let mut stream = bus.subscribe(OwnerId::new());
        let shutdown = CancellationToken::new();
        let handle = bus.spawn_heartbeat(shutdown.clone());

        let frame = stream.next().await.unwrap();
        assert_eq!(frame.event, HEARTBEAT_EVENT);
        let data: Value = serde_json::from_str(&frame.data).unwrap();
        assert!(data["timestamp"].is_string());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
