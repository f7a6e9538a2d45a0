use std::sync::Arc;
use tracing::{error, info};

use crate::models::audit::AuditEvent;
use crate::store::AuditStore;

/// Best-effort audit sink. A failed append is logged and swallowed: audit is
/// a logging concern, not a transactional participant, and must never fail
/// the primary operation.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, event: AuditEvent) {
        info!(
            action = %event.action,
            target_type = %event.target_type,
            target_id = %event.target_id,
            actor = %event.actor.name,
            "audit event"
        );
        if let Err(err) = self.store.append(event).await {
            error!(error = %err, "audit append failed; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::models::audit::{AuditAction, AuditActor};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;

    struct FailingAuditStore;

    #[async_trait]
    impl AuditStore for FailingAuditStore {
        async fn append(&self, _event: AuditEvent) -> Result<()> {
            Err(EngineError::Database {
                message: "audit table unavailable".to_string(),
            })
        }

        async fn events_for(&self, _target_type: &str, _target_id: &str) -> Result<Vec<AuditEvent>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn recorded_events_are_queryable_by_target() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = AuditRecorder::new(store.clone());

        let event = AuditEvent::new(
            AuditActor::system("sweep"),
            AuditAction::TaskEscalated,
            "task",
            "t-1",
            "escalated for timeout",
        )
        .with_change("assignee", "alice", "bob");
        recorder.record(event).await;

        let events = crate::store::AuditStore::events_for(store.as_ref(), "task", "t-1")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::TaskEscalated);
        assert!(events[0].changes.contains_key("assignee"));
    }

    #[tokio::test]
    async fn failed_append_never_surfaces_to_the_caller() {
        let recorder = AuditRecorder::new(Arc::new(FailingAuditStore));
        // record() has no error path; a broken sink must not panic either
        recorder
            .record(AuditEvent::new(
                AuditActor::system("sweep"),
                AuditAction::TaskEscalated,
                "task",
                "t-2",
                "escalated for timeout",
            ))
            .await;
    }
}
