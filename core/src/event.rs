use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Simulation event
///
/// Events carry both the virtual clock reading at emission (`at_ms`) and a
/// wall-clock stamp for log correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    /// Event key (e.g., "vm.running", "pool.dropped")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Virtual time at emission (milliseconds)
    pub at_ms: SimTime,

    /// Wall-clock timestamp at emission
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SimEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, at_ms: SimTime, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            at_ms,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>, at_ms: SimTime) -> Self {
        Self::new(key, at_ms, EventPayload::Empty)
    }

    /// Create an event with a string payload
    pub fn with_string(key: impl Into<String>, at_ms: SimTime, message: impl Into<String>) -> Self {
        Self::new(key, at_ms, EventPayload::String(message.into()))
    }

    /// Create an event with a map payload
    pub fn with_map(
        key: impl Into<String>,
        at_ms: SimTime,
        map: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(key, at_ms, EventPayload::Map(map))
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<SimEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event
    pub fn emit(&self, event: SimEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SimEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events with a filter
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&SimEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter: Arc::new(filter),
        }
    }
}

/// Event stream with filtering
pub struct EventStream {
    receiver: broadcast::Receiver<SimEvent>,
    filter: Arc<dyn Fn(&SimEvent) -> bool + Send + Sync>,
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<SimEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(_) => return None,
            }
        }
    }
}

/// Event catalog - predefined event keys for simulation events.
pub mod events {
    // VM lifecycle
    pub const VM_REQUESTED: &str = "vm.requested";
    pub const VM_RUNNING: &str = "vm.running";
    pub const VM_DESTROYED: &str = "vm.destroyed";

    // Infrastructure
    pub const KIND_REGISTERED: &str = "kind.registered";
    pub const POOL_DROPPED: &str = "pool.dropped";
    pub const APPLIANCE_EVICTED: &str = "appliance.evicted";

    // Dispatch
    pub const JOB_DISPATCHED: &str = "job.dispatched";
    pub const JOB_QUEUED: &str = "job.queued";
    pub const QUEUE_DRAINED: &str = "queue.drained";

    // Trace progress
    pub const TRACE_DISPATCHED: &str = "trace.dispatched";
    pub const TRACE_FINISHED: &str = "trace.finished";
}
