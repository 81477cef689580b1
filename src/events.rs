//! Engine event stream.
//!
//! Every state-changing engine operation publishes a typed event after the
//! write commits. Consumers (UIs, log sinks, schedulers) subscribe through
//! [`EventHub`]; delivery is best-effort broadcast, and a consumer that
//! lags simply misses events rather than backpressuring the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{
    CostRecord, Pulse, ReviewCard, Session, StageArtifact, Subtask, Turn, Workflow,
};

/// Default broadcast buffer. Slow subscribers lag past this many events.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    WorkflowCreated {
        workflow: Workflow,
    },
    WorkflowStageChanged {
        workflow: Workflow,
    },
    WorkflowAwaitingApproval {
        workflow: Workflow,
    },
    WorkflowArchived {
        workflow_id: String,
    },
    WorkflowDeleted {
        workflow_id: String,
    },

    PulsesPlanned {
        workflow_id: String,
        pulse_ids: Vec<String>,
    },
    PulseStarted {
        pulse: Pulse,
    },
    PulseCompleted {
        pulse: Pulse,
    },
    PulseFailed {
        pulse: Pulse,
        reason: String,
    },
    PulseStopped {
        pulse: Pulse,
    },

    PreflightCompleted {
        workflow_id: String,
    },
    PreflightFailed {
        workflow_id: String,
        error: String,
    },

    SessionCreated {
        session: Session,
    },
    SessionCompleted {
        session: Session,
    },
    TurnCompleted {
        turn: Turn,
    },

    SubtaskStarted {
        subtask: Subtask,
    },
    SubtaskCompleted {
        subtask: Subtask,
    },
    SubtaskFailed {
        subtask: Subtask,
    },

    ArtifactSaved {
        artifact: StageArtifact,
    },
    ReviewCompleted {
        card: ReviewCard,
    },
    CostRecorded {
        record: CostRecord,
    },
}

/// Fan-out hub over a tokio broadcast channel. Cheap to clone; all clones
/// share the same channel.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers. Having no subscribers is normal
    /// and not an error, so the send result is ignored.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = EngineEvent::WorkflowDeleted {
            workflow_id: "workflow_abc".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"WorkflowDeleted\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"workflow_id\":\"workflow_abc\""));
    }

    #[test]
    fn test_event_roundtrip() {
        let event = EngineEvent::PulsesPlanned {
            workflow_id: "workflow_abc".to_string(),
            pulse_ids: vec!["pulse_1".to_string(), "pulse_2".to_string()],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        match back {
            EngineEvent::PulsesPlanned { workflow_id, pulse_ids } => {
                assert_eq!(workflow_id, "workflow_abc");
                assert_eq!(pulse_ids.len(), 2);
            }
            _ => panic!("Expected PulsesPlanned"),
        }
    }

    #[tokio::test]
    async fn test_hub_delivers_to_all_subscribers() {
        let hub = EventHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.publish(EngineEvent::WorkflowArchived {
            workflow_id: "workflow_a".to_string(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                EngineEvent::WorkflowArchived { workflow_id } => {
                    assert_eq!(workflow_id, "workflow_a");
                }
                other => panic!("Unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let hub = EventHub::new();
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(EngineEvent::WorkflowDeleted {
            workflow_id: "workflow_a".to_string(),
        });
    }
}
