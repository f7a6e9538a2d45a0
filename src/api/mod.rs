//! # External Gateway
//!
//! Typed service surface for the collaborators around the engine: the
//! transition endpoint semantics, the pending-work feed for external
//! systems, the resolve callback, and the status probe. HTTP routing is the
//! embedder's concern; this module supplies the request/response types, the
//! operations, and the error → status-code mapping.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{Caller, Capability};
use crate::engine::{TaskEngine, TransitionOutcome};
use crate::error::{EngineError, Result};
use crate::events::{AuditRecorder, DomainEvent, EventPublisher};
use crate::models::audit::{AuditAction, AuditActor, AuditEvent};
use crate::models::task::{ResolutionStatus, Task, TaskStatus};
use crate::models::workflow::EndLogic;
use crate::store::EngineStore;

/// Body of the transition endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub task_id: Uuid,
    pub transition_id: Uuid,
    pub notes: String,
}

/// Updated task and assignment detail returned from a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionResponse {
    pub task_id: Uuid,
    pub ticket_number: String,
    pub status: TaskStatus,
    pub current_step: Option<Uuid>,
    pub assigned_to: Option<String>,
    pub target_resolution: Option<chrono::DateTime<Utc>>,
}

impl From<TransitionOutcome> for TransitionResponse {
    fn from(outcome: TransitionOutcome) -> Self {
        Self {
            task_id: outcome.task.id,
            ticket_number: outcome.task.ticket_number.clone(),
            status: outcome.task.status,
            current_step: outcome.task.current_step,
            assigned_to: outcome.assigned.as_ref().map(|i| i.role_user_name.clone()),
            target_resolution: outcome.assigned.as_ref().map(|i| i.target_resolution),
        }
    }
}

/// One row of the pending-work feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTicket {
    pub task_id: Uuid,
    pub ticket_number: String,
    pub priority: String,
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

/// Body of the resolve callback. The ticket may be identified by its
/// upstream number or by the task id; `ticket_id` wins when both are given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub ticket_number: Option<String>,
    pub ticket_id: Option<Uuid>,
    /// External status string; `REJECTED` maps to a rejected resolution,
    /// anything else resolves the ticket.
    pub status: Option<String>,
    pub comment: Option<String>,
    pub reviewed_by: Option<String>,
}

/// Response of the status probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStatus {
    pub ticket_number: String,
    pub status: TaskStatus,
    pub is_resolved: bool,
    pub resolution_status: Option<ResolutionStatus>,
}

pub struct ExternalGateway<S: EngineStore> {
    store: Arc<S>,
    engine: Arc<TaskEngine<S>>,
    publisher: EventPublisher,
    audit: AuditRecorder,
}

impl<S: EngineStore> ExternalGateway<S> {
    pub fn new(store: Arc<S>, engine: Arc<TaskEngine<S>>, publisher: EventPublisher) -> Self {
        let audit = AuditRecorder::new(store.clone());
        Self {
            store,
            engine,
            publisher,
            audit,
        }
    }

    /// Apply a user-driven transition and shape the response.
    pub async fn transition(
        &self,
        request: &TransitionRequest,
        acting: &Caller,
    ) -> Result<TransitionResponse> {
        let outcome = self
            .engine
            .apply_transition(request.task_id, request.transition_id, acting, &request.notes)
            .await?;
        Ok(outcome.into())
    }

    /// Flat list of tasks parked for the given external system.
    pub async fn pending_tickets(&self, system: EndLogic) -> Result<Vec<PendingTicket>> {
        let tasks = self.store.tasks_pending_external(system).await?;
        Ok(tasks
            .into_iter()
            .map(|task| PendingTicket {
                task_id: task.id,
                ticket_number: task.ticket_number,
                priority: task.priority.to_string(),
                completed_at: task.resolution_time,
            })
            .collect())
    }

    /// Resolve callback from an external system. The caller needs the
    /// `ResolveExternal` grant. Idempotent against an already-resolved task:
    /// a second call fails rather than completing twice.
    pub async fn resolve(&self, request: &ResolveRequest, acting: &Caller) -> Result<Task> {
        acting.authorize(Capability::ResolveExternal)?;
        let mut task = match (request.ticket_id, request.ticket_number.as_deref()) {
            (Some(task_id), _) => {
                self.store
                    .task(task_id)
                    .await?
                    .ok_or_else(|| EngineError::TaskNotFound {
                        reference: task_id.to_string(),
                    })?
            }
            (None, Some(number)) => self
                .store
                .task_by_ticket_number(number)
                .await?
                .ok_or_else(|| EngineError::TaskNotFound {
                    reference: number.to_string(),
                })?,
            (None, None) => {
                return Err(EngineError::Validation {
                    message: "resolve requires ticket_number or ticket_id".to_string(),
                })
            }
        };

        if task.resolution_status.is_some() || task.status == TaskStatus::Completed {
            return Err(EngineError::AlreadyResolved {
                ticket_number: task.ticket_number.clone(),
            });
        }
        if task.status != TaskStatus::PendingExternal {
            return Err(EngineError::NotAwaitingExternal {
                ticket_number: task.ticket_number.clone(),
            });
        }

        let resolution = match request.status.as_deref() {
            Some(status) if status.eq_ignore_ascii_case("rejected") => ResolutionStatus::Rejected,
            _ => ResolutionStatus::Resolved,
        };
        task.status = TaskStatus::Completed;
        task.resolution_status = Some(resolution);
        task.resolution_time = Some(Utc::now());
        task.updated_at = Utc::now();
        self.store.update_task(&task).await?;

        let actor = AuditActor::system(
            request
                .reviewed_by
                .clone()
                .unwrap_or_else(|| "external-system".to_string()),
        );
        info!(
            ticket_number = %task.ticket_number,
            resolution = %resolution,
            "ticket resolved by external system"
        );
        let mut event = AuditEvent::new(
            actor,
            AuditAction::ExternalResolved,
            "task",
            task.id,
            format!(
                "ticket {} closed externally as {resolution}",
                task.ticket_number
            ),
        )
        .with_change("status", "pending_external", "completed");
        if let Some(comment) = &request.comment {
            event = event.with_metadata(serde_json::json!({ "comment": comment }));
        }
        self.audit.record(event).await;
        self.publisher.publish(DomainEvent::TaskCompleted {
            task_id: task.id,
            ticket_number: task.ticket_number.clone(),
            resolution: Some(resolution),
            awaiting_external: false,
        });
        Ok(task)
    }

    /// Status probe by ticket number.
    pub async fn status(&self, ticket_number: &str) -> Result<TicketStatus> {
        let task = self
            .store
            .task_by_ticket_number(ticket_number)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound {
                reference: ticket_number.to_string(),
            })?;
        Ok(TicketStatus {
            ticket_number: task.ticket_number.clone(),
            is_resolved: task.status.is_resolved(),
            status: task.status,
            resolution_status: task.resolution_status,
        })
    }
}

/// HTTP status equivalent for an engine error, for embedders that expose
/// these operations over the wire.
pub fn status_code(err: &EngineError) -> u16 {
    match err {
        EngineError::NotesRequired
        | EngineError::InvalidTransition { .. }
        | EngineError::AlreadyResolved { .. }
        | EngineError::NotAwaitingExternal { .. }
        | EngineError::InvalidRole { .. }
        | EngineError::Validation { .. } => 400,
        EngineError::UserNotAssigned { .. } | EngineError::CapabilityDenied { .. } => 403,
        EngineError::TransitionNotFound { .. }
        | EngineError::TaskNotFound { .. }
        | EngineError::NoMatchingWorkflow { .. } => 404,
        EngineError::NoEligibleMember { .. }
        | EngineError::NoSlaConfigured { .. }
        | EngineError::NoEscalationPath { .. }
        | EngineError::NoActiveAssignment { .. }
        | EngineError::ItemStatusRegression { .. }
        | EngineError::WorkflowNotDeployed { .. }
        | EngineError::WorkflowMismatch { .. }
        | EngineError::InvalidWorkflow { .. } => 422,
        _ => 500,
    }
}
