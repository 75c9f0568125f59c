//! Domain events published while a reply runs.
//!
//! Every event carries the conversation's feature name so subscribers can
//! meter usage per feature. There is no metrics backend here; subscribers
//! decide what to do with them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::provider::ToolChoice;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A completion request is about to be issued
    CompletionRequested {
        feature_name: String,
        conversation_id: String,
        completion: u32,
        tool_choice: ToolChoice,
        timestamp: DateTime<Utc>,
    },

    /// A tool finished (successfully or with an error payload)
    ToolExecuted {
        feature_name: String,
        tool_name: String,
        call_id: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A finalized tool call was not executed
    ToolDropped {
        feature_name: String,
        tool_name: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A reply ended
    ReplyFinished {
        feature_name: String,
        conversation_id: String,
        completions: u32,
        tools_executed: u32,
        cancelled: bool,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn feature_name(&self) -> &str {
        match self {
            DomainEvent::CompletionRequested { feature_name, .. }
            | DomainEvent::ToolExecuted { feature_name, .. }
            | DomainEvent::ToolDropped { feature_name, .. }
            | DomainEvent::ReplyFinished { feature_name, .. } => feature_name,
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            feature_name: "bot".into(),
            tool_name: "search".into(),
            call_id: "c1".into(),
            success: true,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.feature_name(), "bot");
        match event.as_ref() {
            DomainEvent::ToolExecuted {
                tool_name, success, ..
            } => {
                assert_eq!(tool_name, "search");
                assert!(success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ToolDropped {
            feature_name: "bot".into(),
            tool_name: "ghost".into(),
            reason: "unknown tool".into(),
            timestamp: Utc::now(),
        });
    }
}
