//! # Workflow Graph Models
//!
//! Definitions for the read-mostly workflow graph: the workflow itself, its
//! ordered weighted steps, and the legal transitions between them. A deployed
//! workflow is immutable; changes ship as a new version.

use crate::error::{EngineError, Result};
use crate::models::role::RoleRef;
use crate::models::ticket::Priority;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Workflow lifecycle status. Only deployed workflows accept tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Initialized,
    Deployed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Initialized => write!(f, "initialized"),
            Self::Deployed => write!(f, "deployed"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "initialized" => Ok(Self::Initialized),
            "deployed" => Ok(Self::Deployed),
            _ => Err(format!("Invalid workflow status: {s}")),
        }
    }
}

/// What happens when a task traverses a terminal transition: the workflow
/// either closes internally or parks the task for a downstream system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndLogic {
    Internal,
    /// Asset-management hand-off (external system A).
    Asset,
    /// Budget-management hand-off (external system B).
    Budget,
}

impl EndLogic {
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Internal)
    }
}

impl fmt::Display for EndLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::Asset => write!(f, "asset"),
            Self::Budget => write!(f, "budget"),
        }
    }
}

impl FromStr for EndLogic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Self::Internal),
            "asset" => Ok(Self::Asset),
            "budget" => Ok(Self::Budget),
            _ => Err(format!("Invalid end logic: {s}")),
        }
    }
}

/// Per-priority SLA durations, stored in seconds. A missing slot is a hard
/// failure at computation time, never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SlaPolicy {
    pub low_seconds: Option<i64>,
    pub medium_seconds: Option<i64>,
    pub high_seconds: Option<i64>,
    /// The urgent slot; `Priority::Critical` resolves here.
    pub urgent_seconds: Option<i64>,
}

impl SlaPolicy {
    pub fn duration_for(&self, priority: Priority) -> Option<Duration> {
        let seconds = match priority {
            Priority::Low => self.low_seconds,
            Priority::Medium => self.medium_seconds,
            Priority::High => self.high_seconds,
            Priority::Critical => self.urgent_seconds,
        };
        seconds.map(Duration::seconds)
    }
}

/// The ticket attributes a workflow is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchKey {
    pub department: String,
    pub category: String,
    pub sub_category: Option<String>,
}

/// A versioned routing definition for one (department, category) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub key: MatchKey,
    pub sla: SlaPolicy,
    pub end_logic: EndLogic,
    pub published: bool,
    pub status: WorkflowStatus,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn is_deployed(&self) -> bool {
        self.published && self.status == WorkflowStatus::Deployed
    }

    /// Whether this workflow's key matches the given ticket attributes.
    /// A workflow without a sub-category key matches any sub-category.
    pub fn matches(&self, department: &str, category: &str, sub_category: Option<&str>) -> bool {
        if !self.key.department.eq_ignore_ascii_case(department)
            || !self.key.category.eq_ignore_ascii_case(category)
        {
            return false;
        }
        match (&self.key.sub_category, sub_category) {
            (None, _) => true,
            (Some(want), Some(got)) => want.eq_ignore_ascii_case(got),
            (Some(_), None) => false,
        }
    }
}

/// One stage of a workflow, owned by a role, carrying a relative time weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    /// Strictly increasing within a workflow.
    pub order: i32,
    pub role: RoleRef,
    /// Positive, relative to sibling steps; normalized at computation time.
    pub weight: f64,
    pub escalate_to: Option<RoleRef>,
    pub is_start: bool,
    pub is_end: bool,
}

/// Sum of step weights, the normalization denominator for weighted deadlines.
pub fn total_weight(steps: &[Step]) -> f64 {
    steps.iter().map(|s| s.weight).sum()
}

/// A legal edge between two steps of one workflow. `from_step = None` marks
/// a start transition; `to_step = None` marks a terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Transition {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub from_step: Option<Uuid>,
    pub to_step: Option<Uuid>,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        self.to_step.is_none()
    }
}

/// Validate a workflow graph before deployment: a single start step,
/// positive weights, strictly increasing order.
pub fn validate_graph(workflow: &Workflow, steps: &[Step]) -> Result<()> {
    let starts = steps.iter().filter(|s| s.is_start).count();
    if starts != 1 {
        return Err(EngineError::InvalidWorkflow {
            workflow: workflow.name.clone(),
            reason: format!("expected exactly one start step, found {starts}"),
        });
    }
    if steps.iter().any(|s| s.weight <= 0.0) {
        return Err(EngineError::InvalidWorkflow {
            workflow: workflow.name.clone(),
            reason: "step weights must be positive".to_string(),
        });
    }
    let mut orders: Vec<i32> = steps.iter().map(|s| s.order).collect();
    orders.sort_unstable();
    if orders.windows(2).any(|w| w[0] >= w[1]) {
        return Err(EngineError::InvalidWorkflow {
            workflow: workflow.name.clone(),
            reason: "step order must be strictly increasing".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{step, workflow};

    #[test]
    fn critical_priority_resolves_to_urgent_slot() {
        let sla = SlaPolicy {
            urgent_seconds: Some(3600),
            ..Default::default()
        };
        assert_eq!(
            sla.duration_for(Priority::Critical),
            Some(Duration::seconds(3600))
        );
        assert_eq!(sla.duration_for(Priority::High), None);
    }

    #[test]
    fn match_is_case_insensitive_and_sub_category_aware() {
        let mut wf = workflow("it-hardware", EndLogic::Internal);
        wf.key.sub_category = Some("Laptop".to_string());
        assert!(wf.matches("it", "hardware", Some("laptop")));
        assert!(!wf.matches("it", "hardware", None));
        assert!(!wf.matches("hr", "hardware", Some("laptop")));
    }

    #[test]
    fn graph_validation_rejects_bad_shapes() {
        let wf = workflow("wf", EndLogic::Internal);
        let mut a = step(wf.id, "triage", 1, 1.0, "helpdesk:agent");
        a.is_start = true;
        let mut b = step(wf.id, "resolve", 1, 3.0, "helpdesk:senior");
        b.is_end = true;

        // duplicate order
        assert!(validate_graph(&wf, &[a.clone(), b.clone()]).is_err());
        b.order = 2;
        assert!(validate_graph(&wf, &[a.clone(), b.clone()]).is_ok());

        // non-positive weight
        b.weight = 0.0;
        assert!(validate_graph(&wf, &[a, b]).is_err());
    }
}
