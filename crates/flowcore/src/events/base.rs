use crate::runtime::FlowStatus;
use crate::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type RuntimeId = String;

/// Events emitted while a session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    FlowStarted {
        runtime_id: RuntimeId,
        flow_code: String,
        resumed: bool,
        timestamp: DateTime<Utc>,
    },
    FlowCompleted {
        runtime_id: RuntimeId,
        status: FlowStatus,
        is_error: bool,
        elapsed_ms: i64,
        timestamp: DateTime<Utc>,
    },
    FlowTimedOut {
        runtime_id: RuntimeId,
        timestamp: DateTime<Utc>,
    },
    ActionStarted {
        runtime_id: RuntimeId,
        action_id: String,
        action_name: String,
        pre_action_id: String,
        timestamp: DateTime<Utc>,
    },
    ActionCompleted {
        runtime_id: RuntimeId,
        action_id: String,
        outcome: Outcome,
        elapsed_ms: i64,
        timestamp: DateTime<Utc>,
    },
    ActionFailed {
        runtime_id: RuntimeId,
        action_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    LinkCompleted {
        runtime_id: RuntimeId,
        source_id: String,
        target_id: String,
        outcome: Outcome,
        timestamp: DateTime<Utc>,
    },
    LinkFailed {
        runtime_id: RuntimeId,
        source_id: String,
        target_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn runtime_id(&self) -> &str {
        match self {
            ExecutionEvent::FlowStarted { runtime_id, .. }
            | ExecutionEvent::FlowCompleted { runtime_id, .. }
            | ExecutionEvent::FlowTimedOut { runtime_id, .. }
            | ExecutionEvent::ActionStarted { runtime_id, .. }
            | ExecutionEvent::ActionCompleted { runtime_id, .. }
            | ExecutionEvent::ActionFailed { runtime_id, .. }
            | ExecutionEvent::LinkCompleted { runtime_id, .. }
            | ExecutionEvent::LinkFailed { runtime_id, .. } => runtime_id,
        }
    }
}

/// Global event bus
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Send to current subscribers; dropped when nobody listens.
    pub fn emit(&self, event: ExecutionEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(runtime_id = %event.runtime_id(), "event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(ExecutionEvent::FlowTimedOut {
            runtime_id: "rt".into(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.runtime_id(), "rt");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "FlowTimedOut");
    }
}
