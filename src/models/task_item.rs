//! # Task Item Models
//!
//! One assignment of one role member to one task at one step, plus its
//! append-only status ledger. Items are never repurposed: advancing a task
//! creates a fresh item for the next step, and escalation creates a fresh
//! item for the backup role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::role::RoleRef;

/// How the assignment came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrigin {
    System,
    Escalation,
}

impl fmt::Display for ItemOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Escalation => write!(f, "escalation"),
        }
    }
}

impl FromStr for ItemOrigin {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "escalation" => Ok(Self::Escalation),
            _ => Err(format!("Invalid item origin: {s}")),
        }
    }
}

/// Ledger statuses for a task item. Statuses only move forward; a resolved
/// or escalated item is never resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    New,
    InProgress,
    Resolved,
    Escalated,
}

impl ItemStatus {
    /// An item whose latest ledger row is active still awaits its owner.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::New | Self::InProgress)
    }

    /// Monotonic rank used to enforce forward-only ledger movement.
    /// Resolution and escalation are both terminal, at the same rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::InProgress => 1,
            Self::Resolved | Self::Escalated => 2,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "escalated" => Ok(Self::Escalated),
            _ => Err(format!("Invalid item status: {s}")),
        }
    }
}

/// One assignment of one role member to one task at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: Uuid,
    pub task_id: Uuid,
    pub role_user: Uuid,
    pub role_user_name: String,
    pub role: RoleRef,
    pub origin: ItemOrigin,
    pub assigned_on_step: Uuid,
    /// Weighted step deadline. Escalated items inherit the superseded item's
    /// deadline unchanged.
    pub target_resolution: DateTime<Utc>,
    pub acted_on: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only status ledger row. The latest row defines an item's current
/// status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItemHistory {
    pub id: Uuid,
    pub task_item_id: Uuid,
    pub status: ItemStatus,
    pub changed_by: Option<Uuid>,
    pub changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses() {
        assert!(ItemStatus::New.is_active());
        assert!(ItemStatus::InProgress.is_active());
        assert!(!ItemStatus::Resolved.is_active());
        assert!(!ItemStatus::Escalated.is_active());
    }

    #[test]
    fn rank_is_monotonic_along_the_ledger() {
        assert!(ItemStatus::New.rank() < ItemStatus::InProgress.rank());
        assert!(ItemStatus::InProgress.rank() < ItemStatus::Resolved.rank());
        assert_eq!(ItemStatus::Resolved.rank(), ItemStatus::Escalated.rank());
    }
}
