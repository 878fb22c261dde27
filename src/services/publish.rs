use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const EVENT_MESSAGE_CREATED: &str = "message.created";
pub const EVENT_MESSAGE_UPDATED: &str = "message.updated";

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    pub tenant_id: String,
    pub event: String,
    pub payload: Value,
    pub ts: i64,
}

impl RealtimeEvent {
    pub fn new(tenant_id: &str, event: &str, payload: Value, ts: i64) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            event: event.to_string(),
            payload,
            ts,
        }
    }
}

/// Fire-and-forget notification towards connected UI clients.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RealtimeEvent);
}

#[derive(Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: RealtimeEvent) {
        // No subscribers is the normal idle state.
        let _ = self.sender.send(event);
    }
}
