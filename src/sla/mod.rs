//! # SLA Calculator
//!
//! Pure deadline math. Two related computations share one SLA lookup:
//!
//! - the task-level deadline uses the full configured duration, once, at
//!   creation;
//! - the step-level deadline scales the same duration by the step's weight
//!   over the workflow's total step weight, once per assignment.
//!
//! `now` is always an explicit argument so historical backdating (a ticket
//! imported with its original submission time) is a caller decision, never
//! implicit global state. A missing SLA slot is a hard failure: an undefined
//! deadline would corrupt SLA reporting downstream.

use chrono::{DateTime, Duration, Utc};

use crate::error::{EngineError, Result};
use crate::models::ticket::Priority;
use crate::models::workflow::{total_weight, Step, Workflow};

/// Full, unweighted deadline: `now + SLA[priority]`.
pub fn task_deadline(
    now: DateTime<Utc>,
    priority: Priority,
    workflow: &Workflow,
) -> Result<DateTime<Utc>> {
    Ok(now + sla_duration(priority, workflow)?)
}

/// Weighted step deadline:
/// `now + SLA[priority] * (step.weight / total step weight)`.
pub fn step_deadline(
    now: DateTime<Utc>,
    priority: Priority,
    step: &Step,
    steps: &[Step],
    workflow: &Workflow,
) -> Result<DateTime<Utc>> {
    let total = total_weight(steps);
    if total <= 0.0 {
        return Err(EngineError::InvalidWorkflow {
            workflow: workflow.name.clone(),
            reason: "total step weight must be positive".to_string(),
        });
    }
    let sla = sla_duration(priority, workflow)?;
    let seconds = sla.num_seconds() as f64 * (step.weight / total);
    Ok(now + Duration::seconds(seconds.round() as i64))
}

fn sla_duration(priority: Priority, workflow: &Workflow) -> Result<Duration> {
    workflow
        .sla
        .duration_for(priority)
        .ok_or_else(|| EngineError::NoSlaConfigured {
            workflow: workflow.name.clone(),
            priority: priority.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::EndLogic;
    use crate::test_support::{step, workflow_with_sla};

    fn fixed_now() -> DateTime<Utc> {
        "2026-03-01T09:00:00Z".parse().unwrap()
    }

    #[test]
    fn task_deadline_is_flat_regardless_of_steps() {
        let wf = workflow_with_sla("wf", EndLogic::Internal, Priority::High, 10 * 3600);
        let deadline = task_deadline(fixed_now(), Priority::High, &wf).unwrap();
        assert_eq!(deadline, fixed_now() + Duration::hours(10));
    }

    #[test]
    fn step_deadlines_split_the_sla_by_weight() {
        // weights [2, 3, 5] over a 10h SLA give 2h, 3h, 5h offsets
        let wf = workflow_with_sla("wf", EndLogic::Internal, Priority::High, 10 * 3600);
        let steps = vec![
            step(wf.id, "a", 1, 2.0, "helpdesk:agent"),
            step(wf.id, "b", 2, 3.0, "helpdesk:agent"),
            step(wf.id, "c", 3, 5.0, "helpdesk:agent"),
        ];
        let offsets: Vec<i64> = steps
            .iter()
            .map(|s| {
                let deadline = step_deadline(fixed_now(), Priority::High, s, &steps, &wf).unwrap();
                (deadline - fixed_now()).num_hours()
            })
            .collect();
        assert_eq!(offsets, vec![2, 3, 5]);
    }

    #[test]
    fn critical_uses_the_urgent_slot() {
        let wf = workflow_with_sla("wf", EndLogic::Internal, Priority::Critical, 4 * 3600);
        let deadline = task_deadline(fixed_now(), Priority::Critical, &wf).unwrap();
        assert_eq!(deadline, fixed_now() + Duration::hours(4));
    }

    #[test]
    fn missing_sla_slot_is_a_hard_failure() {
        let wf = workflow_with_sla("wf", EndLogic::Internal, Priority::High, 3600);
        let err = task_deadline(fixed_now(), Priority::Low, &wf).unwrap_err();
        assert!(matches!(err, EngineError::NoSlaConfigured { .. }));
    }

    #[test]
    fn zero_total_weight_is_rejected() {
        let wf = workflow_with_sla("wf", EndLogic::Internal, Priority::High, 3600);
        let mut s = step(wf.id, "a", 1, 0.0, "helpdesk:agent");
        s.weight = 0.0;
        let err = step_deadline(fixed_now(), Priority::High, &s, &[s.clone()], &wf).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow { .. }));
    }

    #[test]
    fn backdated_now_shifts_the_deadline() {
        let wf = workflow_with_sla("wf", EndLogic::Internal, Priority::High, 3600);
        let backdated: DateTime<Utc> = "2025-11-20T00:00:00Z".parse().unwrap();
        let deadline = task_deadline(backdated, Priority::High, &wf).unwrap();
        assert_eq!(deadline, backdated + Duration::hours(1));
    }
}
