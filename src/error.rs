//! # Engine Error Types
//!
//! Structured error taxonomy for the routing engine using thiserror
//! instead of `Box<dyn Error>` patterns.
//!
//! The taxonomy follows the operational split the engine cares about:
//! validation errors surface synchronously and are never retried, resource
//! errors block the operation and must reach an operator, and transient
//! infrastructure errors feed the submission retry machinery.

use thiserror::Error;
use uuid::Uuid;

/// Crate-wide error type for routing, assignment, and submission operations.
#[derive(Error, Debug)]
pub enum EngineError {
    // --- resource errors: hard failures, visible to operators ---
    #[error("no eligible member for role {role}")]
    NoEligibleMember { role: String },

    #[error("no SLA configured for priority {priority} on workflow {workflow}")]
    NoSlaConfigured { workflow: String, priority: String },

    #[error("no escalation path from step {step} for task {task_id}")]
    NoEscalationPath { task_id: Uuid, step: String },

    #[error("task {task_id} has no active assignment")]
    NoActiveAssignment { task_id: Uuid },

    // --- validation errors: 4xx-equivalent, never retried ---
    #[error("notes are required for a transition")]
    NotesRequired,

    #[error("user {user} holds no active assignment on task {task_id}")]
    UserNotAssigned { task_id: Uuid, user: String },

    #[error("transition not found: {transition_id}")]
    TransitionNotFound { transition_id: Uuid },

    #[error("invalid transition for task {task_id}: {reason}")]
    InvalidTransition { task_id: Uuid, reason: String },

    #[error("task item {item_id} cannot move from {from} back to {to}")]
    ItemStatusRegression {
        item_id: Uuid,
        from: String,
        to: String,
    },

    #[error("task not found: {reference}")]
    TaskNotFound { reference: String },

    #[error("ticket {ticket_number} is already resolved")]
    AlreadyResolved { ticket_number: String },

    #[error("ticket {ticket_number} is not awaiting external resolution")]
    NotAwaitingExternal { ticket_number: String },

    #[error("invalid role tag {tag}: {reason}")]
    InvalidRole { tag: String, reason: String },

    #[error("caller lacks capability {required}")]
    CapabilityDenied { required: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    // --- workflow definition errors ---
    #[error("no workflow matches department {department} / category {category}")]
    NoMatchingWorkflow {
        department: String,
        category: String,
    },

    #[error("workflow {workflow} is not deployed")]
    WorkflowNotDeployed { workflow: String },

    #[error("workflow {workflow} does not match department {department} / category {category}")]
    WorkflowMismatch {
        workflow: String,
        department: String,
        category: String,
    },

    #[error("workflow {workflow} is invalid: {reason}")]
    InvalidWorkflow { workflow: String, reason: String },

    // --- infrastructure ---
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("operation {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("database error: {message}")]
    Database { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {message}")]
    Queue { message: String },

    #[error("submission error: {message}")]
    Submission { message: String },
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
