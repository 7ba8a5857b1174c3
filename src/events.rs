//! Live-update fan-out to browser clients.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

pub const TELEMETRY_UPDATE: &str = "telemetry_update";
pub const STATUS_UPDATE: &str = "status_update";
pub const CONTROL_RESPONSE: &str = "control_response";
pub const MQTT_MESSAGE: &str = "mqtt_message";

/// Fire-and-forget event publication. Delivery guarantees are the sink's concern.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &str, payload: serde_json::Value);
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Broadcast-channel sink. Each subscriber (one per SSE client) gets every
/// event published after it subscribed; slow subscribers lag and skip.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<LiveEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: &str, payload: serde_json::Value) {
        let live = LiveEvent {
            event: event.to_string(),
            payload,
        };
        // No receivers is not an error: nobody is watching the dashboard.
        if self.sender.send(live).is_err() {
            trace!(event, "No live-update subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();

        sink.publish(TELEMETRY_UPDATE, json!({"device_id": "dev1"})).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, TELEMETRY_UPDATE);
        assert_eq!(received.payload["device_id"], "dev1");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::new(8);
        sink.publish(STATUS_UPDATE, json!({})).await;
    }
}
