//! # Failed Submission Model
//!
//! One record per external submission that could not complete on the first
//! try. Records are kept through their terminal state for audit; only
//! explicit operator deletion removes one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Retrying => write!(f, "retrying"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid submission status: {s}")),
        }
    }
}

/// Classification of the failure that created or last touched the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionErrorKind {
    Validation,
    Timeout,
    ServiceUnavailable,
    Unknown,
}

impl SubmissionErrorKind {
    /// Validation failures need data correction, not time; only transient
    /// classes enter the retry schedule.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ServiceUnavailable | Self::Unknown)
    }
}

impl fmt::Display for SubmissionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Timeout => write!(f, "timeout"),
            Self::ServiceUnavailable => write!(f, "service_unavailable"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for SubmissionErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "timeout" => Ok(Self::Timeout),
            "service_unavailable" => Ok(Self::ServiceUnavailable),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid submission error kind: {s}")),
        }
    }
}

/// Persistent record of an external submission that needed more than one
/// attempt. `payload` is the exact snapshot re-posted on retry; `source`
/// preserves the pre-transform data for manual remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSubmission {
    pub id: Uuid,
    pub task_id: Uuid,
    pub ticket_number: String,
    pub payload: serde_json::Value,
    pub source: serde_json::Value,
    pub status: SubmissionStatus,
    pub error_kind: SubmissionErrorKind,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Fallback audit flags: which substitutions the one-shot fallback pass
    /// applied before this record reached its current state.
    pub used_fallback_fiscal_year: bool,
    pub used_fallback_accounts: bool,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailedSubmission {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}
