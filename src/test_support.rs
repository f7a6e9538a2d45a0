//! Shared fixtures for unit and integration tests. Not part of the public
//! API surface.

use chrono::Utc;
use uuid::Uuid;

use crate::models::role::{RoleMember, RoleRef};
use crate::models::ticket::Priority;
use crate::models::workflow::{
    EndLogic, MatchKey, SlaPolicy, Step, Transition, Workflow, WorkflowStatus,
};

/// A deployed workflow keyed on IT/Hardware with no SLA configured.
pub fn workflow(name: &str, end_logic: EndLogic) -> Workflow {
    let now = Utc::now();
    Workflow {
        id: Uuid::new_v4(),
        name: name.to_string(),
        key: MatchKey {
            department: "IT".to_string(),
            category: "Hardware".to_string(),
            sub_category: None,
        },
        sla: SlaPolicy::default(),
        end_logic,
        published: true,
        status: WorkflowStatus::Deployed,
        version: 1,
        created_at: now,
        updated_at: now,
    }
}

/// Like [`workflow`], with one SLA slot populated.
pub fn workflow_with_sla(
    name: &str,
    end_logic: EndLogic,
    priority: Priority,
    seconds: i64,
) -> Workflow {
    let mut wf = workflow(name, end_logic);
    match priority {
        Priority::Low => wf.sla.low_seconds = Some(seconds),
        Priority::Medium => wf.sla.medium_seconds = Some(seconds),
        Priority::High => wf.sla.high_seconds = Some(seconds),
        Priority::Critical => wf.sla.urgent_seconds = Some(seconds),
    }
    wf
}

/// A plain step; callers flip `is_start`/`is_end`/`escalate_to` as needed.
pub fn step(workflow_id: Uuid, name: &str, order: i32, weight: f64, role_tag: &str) -> Step {
    Step {
        id: Uuid::new_v4(),
        workflow_id,
        name: name.to_string(),
        order,
        role: RoleRef::parse(role_tag).unwrap(),
        weight,
        escalate_to: None,
        is_start: false,
        is_end: false,
    }
}

/// An edge between two steps; `None` on either side marks the workflow
/// boundary.
pub fn transition(
    workflow_id: Uuid,
    name: &str,
    from_step: Option<Uuid>,
    to_step: Option<Uuid>,
) -> Transition {
    Transition {
        id: Uuid::new_v4(),
        workflow_id,
        name: name.to_string(),
        from_step,
        to_step,
    }
}

/// An active member of the given role.
pub fn member(role: &RoleRef, username: &str) -> RoleMember {
    RoleMember {
        id: Uuid::new_v4(),
        username: username.to_string(),
        role: role.clone(),
        active: true,
    }
}
