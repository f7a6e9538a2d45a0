//! # Audit Event Model
//!
//! Append-only structured change events. Every state-changing operation in
//! the engine produces exactly one of these; recording is best-effort and
//! never blocks the primary operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Who performed the change. Sweeps and system-initiated changes use
/// [`AuditActor::system`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditActor {
    pub id: Option<Uuid>,
    pub name: String,
}

impl AuditActor {
    pub fn user(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
        }
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TaskCreated,
    WorkStarted,
    TransitionApplied,
    TransitionBypassed,
    TaskEscalated,
    TaskCompleted,
    ExternalResolved,
    SubmissionAttempted,
    SubmissionFailed,
    SubmissionRecovered,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCreated => "task_created",
            Self::WorkStarted => "work_started",
            Self::TransitionApplied => "transition_applied",
            Self::TransitionBypassed => "transition_bypassed",
            Self::TaskEscalated => "task_escalated",
            Self::TaskCompleted => "task_completed",
            Self::ExternalResolved => "external_resolved",
            Self::SubmissionAttempted => "submission_attempted",
            Self::SubmissionFailed => "submission_failed",
            Self::SubmissionRecovered => "submission_recovered",
        };
        write!(f, "{s}")
    }
}

/// Old/new pair for one changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor: AuditActor,
    pub action: AuditAction,
    pub target_type: String,
    pub target_id: String,
    pub changes: HashMap<String, FieldChange>,
    pub description: String,
    pub request_metadata: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: AuditActor,
        action: AuditAction,
        target_type: impl Into<String>,
        target_id: impl fmt::Display,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor,
            action,
            target_type: target_type.into(),
            target_id: target_id.to_string(),
            changes: HashMap::new(),
            description: description.into(),
            request_metadata: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_change(
        mut self,
        field: impl Into<String>,
        old: impl Into<Value>,
        new: impl Into<Value>,
    ) -> Self {
        self.changes.insert(
            field.into(),
            FieldChange {
                old: old.into(),
                new: new.into(),
            },
        );
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.request_metadata = Some(metadata);
        self
    }
}
