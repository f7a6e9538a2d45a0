//! Ticket ingestion records.
//!
//! Ticket content persistence belongs to the upstream ticketing system; the
//! engine only consumes the routing-relevant projection defined here. The
//! optional `submitted_at` timestamp carries the historical submission time
//! for replay/import scenarios and is threaded explicitly into SLA math,
//! never read from global state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Ticket priority. `Critical` maps to the workflow's urgent SLA slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    /// Case-insensitive; the upstream system emits both "critical" and
    /// "urgent" for the top slot.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" | "urgent" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {s}")),
        }
    }
}

/// The employee who raised the ticket, as reported by the upstream system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: Uuid,
    pub name: String,
    pub department: String,
}

/// One cost line on a ticket. `amount` is kept as raw JSON because upstream
/// exports deliver both numbers and thousands-separated strings; coercion
/// happens once, in the submission payload builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketLineItem {
    pub description: Option<String>,
    pub amount: serde_json::Value,
    pub account_id: Option<String>,
}

/// The routing-relevant projection of an upstream ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub ticket_number: String,
    pub department: String,
    pub category: String,
    pub sub_category: Option<String>,
    pub priority: Priority,
    pub employee: Employee,
    pub description: Option<String>,
    #[serde(default)]
    pub line_items: Vec<TicketLineItem>,
    /// Recorded submission time for backdated imports; `None` means "now".
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// The clock to use for this ticket's SLA computations at creation time.
    pub fn effective_created_at(&self) -> DateTime<Utc> {
        self.submitted_at.unwrap_or_else(Utc::now)
    }
}
