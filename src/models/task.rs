//! # Task Model
//!
//! One live routing instance of a workflow bound to one ticket. The task
//! carries the single active step pointer, the unweighted task-level SLA
//! deadline, and the persistent ticket owner assigned once at creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Task lifecycle states. `PendingExternal` is terminal from the engine's
/// point of view but awaits the external resolve callback before truly
/// closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    PendingExternal,
}

impl TaskStatus {
    /// No further user-driven transitions are accepted in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PendingExternal)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::PendingExternal => write!(f, "pending_external"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "pending_external" => Ok(Self::PendingExternal),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Final outcome recorded when a task closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Rejected,
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for ResolutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "resolved" => Ok(Self::Resolved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid resolution status: {s}")),
        }
    }
}

/// One live routing instance of a workflow bound to one ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub ticket_number: String,
    pub workflow_id: Uuid,
    /// `None` once the task has traversed a terminal transition.
    pub current_step: Option<Uuid>,
    pub status: TaskStatus,
    /// Coordinator role-user assigned once at creation, never reassigned.
    pub ticket_owner: Uuid,
    pub priority: crate::models::ticket::Priority,
    /// Unweighted task-level SLA deadline, stamped at creation.
    pub target_resolution: DateTime<Utc>,
    pub resolution_time: Option<DateTime<Utc>>,
    pub resolution_status: Option<ResolutionStatus>,
    /// Whether the task has progressed past its start step. Gates the
    /// legality of start transitions (`from_step = None`).
    pub progressed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::PendingExternal.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(TaskStatus::PendingExternal.to_string(), "pending_external");
        assert_eq!(
            "pending_external".parse::<TaskStatus>().unwrap(),
            TaskStatus::PendingExternal
        );
        assert!("paused".parse::<TaskStatus>().is_err());
    }
}
