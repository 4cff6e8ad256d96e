//! Broadcast bus for orchestration progress events.
//!
//! Gives outer layers a decoupled way to observe record updates and token
//! usage without reaching into the agents themselves.

use tokio::sync::broadcast;

use troupe_core::{MessageRecord, RecordSink, Usage};

/// Events emitted while an orchestration run progresses.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// The shared turn record changed. Carries the full snapshot so
    /// subscribers can re-render without a store read.
    RecordUpdated { record: MessageRecord },
    /// A completed model call reported nonzero token usage.
    TokenUsage {
        conversation_id: String,
        message_id: String,
        usage: Usage,
        timestamp: i64,
    },
}

/// Clone this to share across agents. Each clone shares the same underlying
/// broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers. Send errors mean nobody is
    /// listening and are ignored.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl RecordSink for EventBus {
    fn publish(&self, record: &MessageRecord) {
        let _ = self.tx.send(OrchestratorEvent::RecordUpdated {
            record: record.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use troupe_core::{MessageStatus, Role};

    fn record() -> MessageRecord {
        MessageRecord {
            id: "msg-1".to_string(),
            conversation_id: "conv-1".to_string(),
            content: String::new(),
            role: Role::Assistant,
            status: MessageStatus::Pending,
            role_label: "Test".to_string(),
            task: None,
            block: None,
        }
    }

    #[test]
    fn test_sink_updates_reach_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        RecordSink::publish(&bus, &record());

        match rx.try_recv().unwrap() {
            OrchestratorEvent::RecordUpdated { record } => {
                assert_eq!(record.id, "msg-1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.publish(OrchestratorEvent::TokenUsage {
            conversation_id: "conv-1".to_string(),
            message_id: "msg-1".to_string(),
            usage: Usage::new(10, 20),
            timestamp: 0,
        });
    }
}
