use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::submission::SubmissionErrorKind;
use crate::models::task::ResolutionStatus;

/// Typed lifecycle events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        task_id: Uuid,
        ticket_number: String,
        workflow: String,
        step: String,
    },
    WorkStarted {
        task_id: Uuid,
        user: String,
    },
    TransitionApplied {
        task_id: Uuid,
        from_step: String,
        to_step: Option<String>,
        actor: String,
        bypassed: bool,
    },
    TaskEscalated {
        task_id: Uuid,
        from_user: String,
        to_user: String,
        from_role: String,
        to_role: String,
        reason: String,
    },
    TaskCompleted {
        task_id: Uuid,
        ticket_number: String,
        resolution: Option<ResolutionStatus>,
        awaiting_external: bool,
    },
    SubmissionAttempted {
        task_id: Uuid,
        success: bool,
        used_fallback_fiscal_year: bool,
        used_fallback_accounts: bool,
    },
    SubmissionFailed {
        task_id: Uuid,
        kind: SubmissionErrorKind,
        retry_count: u32,
        terminal: bool,
    },
    SubmissionRecovered {
        task_id: Uuid,
        external_id: Option<String>,
        retry_count: u32,
    },
}

/// Event that has been published.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event: DomainEvent,
    pub published_at: DateTime<Utc>,
}

/// Broadcast publisher for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error; the engine
    /// publishes regardless of who is listening.
    pub fn publish(&self, event: DomainEvent) {
        let published = PublishedEvent {
            event,
            published_at: Utc::now(),
        };
        let _ = self.sender.send(published);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let publisher = EventPublisher::default();
        publisher.publish(DomainEvent::WorkStarted {
            task_id: Uuid::new_v4(),
            user: "agent".to_string(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let publisher = EventPublisher::default();
        let mut rx = publisher.subscribe();
        let task_id = Uuid::new_v4();
        publisher.publish(DomainEvent::WorkStarted {
            task_id,
            user: "agent".to_string(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(
            received.event,
            DomainEvent::WorkStarted {
                task_id,
                user: "agent".to_string()
            }
        );
    }
}
