//! End-to-end routing scenarios over the in-memory backend: creation at the
//! start step, weighted deadlines, transition validation, escalation, the
//! administrative bypass, and the external resolve callback.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use ticketflow_core::api::{ExternalGateway, ResolveRequest};
use ticketflow_core::auth::{Caller, Capability};
use ticketflow_core::config::{EngineConfig, SweepConfig};
use ticketflow_core::engine::{EscalationEngine, OverdueSweep, TaskEngine};
use ticketflow_core::error::EngineError;
use ticketflow_core::events::EventPublisher;
use ticketflow_core::models::audit::AuditActor;
use ticketflow_core::models::task::{ResolutionStatus, TaskStatus};
use ticketflow_core::models::task_item::{ItemOrigin, TaskItem};
use ticketflow_core::models::role::RoleRef;
use ticketflow_core::models::ticket::{Employee, Priority, Ticket};
use ticketflow_core::models::workflow::{EndLogic, Step, Transition};
use ticketflow_core::queue::InMemoryQueue;
use ticketflow_core::store::{InMemoryStore, RoleDirectory, TaskStore, WorkflowStore};
use ticketflow_core::test_support;

struct Fixture {
    store: Arc<InMemoryStore>,
    engine: Arc<TaskEngine<InMemoryStore>>,
    publisher: EventPublisher,
    queue: Arc<InMemoryQueue>,
    triage: Step,
    resolve: Step,
    advance: Transition,
    finish: Transition,
}

/// Two-step IT/Hardware workflow: Triage (weight 1, agents, escalates to
/// seniors) then Resolve (weight 3, seniors), High SLA of 8 hours.
async fn fixture(end_logic: EndLogic) -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let wf = test_support::workflow_with_sla("it-hardware", end_logic, Priority::High, 8 * 3600);

    let mut triage = test_support::step(wf.id, "Triage", 1, 1.0, "helpdesk:agent");
    triage.is_start = true;
    triage.escalate_to = Some(role("helpdesk:senior"));
    let mut resolve = test_support::step(wf.id, "Resolve", 2, 3.0, "helpdesk:senior");
    resolve.is_end = true;

    let advance = test_support::transition(wf.id, "triage-done", Some(triage.id), Some(resolve.id));
    let finish = test_support::transition(wf.id, "resolved", Some(resolve.id), None);
    store
        .insert_graph(&wf, &[triage.clone(), resolve.clone()], &[advance.clone(), finish.clone()])
        .await
        .unwrap();

    for (tag, name) in [
        ("helpdesk:coordinator", "casey"),
        ("helpdesk:agent", "alice"),
        ("helpdesk:senior", "sam"),
    ] {
        store.add_member(test_support::member(&role(tag), name));
    }

    let publisher = EventPublisher::default();
    let queue = Arc::new(InMemoryQueue::new());
    let engine = Arc::new(
        TaskEngine::new(
            store.clone(),
            &EngineConfig::default(),
            publisher.clone(),
            queue.clone(),
        )
        .unwrap(),
    );
    Fixture {
        store,
        engine,
        publisher,
        queue,
        triage,
        resolve,
        advance,
        finish,
    }
}

fn role(tag: &str) -> RoleRef {
    RoleRef::parse(tag).unwrap()
}

fn high_priority_ticket() -> Ticket {
    Ticket {
        id: Uuid::new_v4(),
        ticket_number: format!("TKT-{}", &Uuid::new_v4().simple().to_string()[..8]),
        department: "IT".to_string(),
        category: "Hardware".to_string(),
        sub_category: None,
        priority: Priority::High,
        employee: Employee {
            id: Uuid::new_v4(),
            name: "Morgan Hale".to_string(),
            department: "IT".to_string(),
        },
        description: Some("laptop will not boot".to_string()),
        line_items: Vec::new(),
        submitted_at: None,
    }
}

fn caller_for(item: &TaskItem) -> Caller {
    Caller::new(item.role_user, item.role_user_name.clone())
}

async fn active_items(store: &InMemoryStore, task_id: Uuid) -> Vec<TaskItem> {
    let mut active = Vec::new();
    for item in store.items_for_task(task_id).await.unwrap() {
        let status = store.item_status(item.id).await.unwrap().unwrap();
        if status.is_active() {
            active.push(item);
        }
    }
    active
}

fn minutes_from_now(deadline: chrono::DateTime<Utc>) -> i64 {
    (deadline - Utc::now()).num_minutes()
}

#[tokio::test]
async fn high_priority_ticket_runs_the_full_workflow() {
    let fx = fixture(EndLogic::Internal).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.current_step, Some(fx.triage.id));
    assert!(!task.progressed);
    // flat 8h task deadline
    assert!((475..=480).contains(&minutes_from_now(task.target_resolution)));

    // Triage carries 1/4 of the 8h SLA
    let items = active_items(&fx.store, task.id).await;
    assert_eq!(items.len(), 1);
    assert!((115..=120).contains(&minutes_from_now(items[0].target_resolution)));

    // agent finishes triage
    let agent = caller_for(&items[0]);
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "swapped the battery")
        .await
        .unwrap();
    assert_eq!(outcome.task.current_step, Some(fx.resolve.id));
    assert!(outcome.task.progressed);

    // Resolve carries the remaining 3/4
    let senior_item = outcome.assigned.unwrap();
    assert!((355..=360).contains(&minutes_from_now(senior_item.target_resolution)));
    assert_eq!(senior_item.role.qualified(), "helpdesk:senior");

    // senior applies the terminal transition
    let senior = caller_for(&senior_item);
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.finish.id, &senior, "replaced the device")
        .await
        .unwrap();
    assert_eq!(outcome.task.status, TaskStatus::Completed);
    assert_eq!(outcome.task.resolution_status, Some(ResolutionStatus::Resolved));
    assert!(outcome.task.current_step.is_none());
    assert!(outcome.assigned.is_none());
    assert!(active_items(&fx.store, task.id).await.is_empty());
}

#[tokio::test]
async fn step_skipping_is_rejected() {
    let fx = fixture(EndLogic::Internal).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let items = active_items(&fx.store, task.id).await;
    let agent = caller_for(&items[0]);

    // the terminal transition departs Resolve, but the task is at Triage
    let err = fx
        .engine
        .apply_transition(task.id, fx.finish.id, &agent, "shortcut attempt")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    // the legal transition still works afterwards
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap();
    assert_eq!(outcome.task.current_step, Some(fx.resolve.id));
}

#[tokio::test]
async fn transitions_require_notes_and_an_assignment() {
    let fx = fixture(EndLogic::Internal).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let items = active_items(&fx.store, task.id).await;
    let agent = caller_for(&items[0]);

    let err = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotesRequired));

    let stranger = Caller::new(Uuid::new_v4(), "intruder");
    let err = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &stranger, "let me through")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UserNotAssigned { .. }));

    let err = fx
        .engine
        .apply_transition(task.id, Uuid::new_v4(), &agent, "which door")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TransitionNotFound { .. }));
}

#[tokio::test]
async fn escalation_reassigns_without_granting_extra_time() {
    let fx = fixture(EndLogic::Internal).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let original = active_items(&fx.store, task.id).await.remove(0);

    let escalation = EscalationEngine::new(
        fx.store.clone(),
        fx.engine.allocator().clone(),
        fx.publisher.clone(),
        fx.queue.clone(),
    );
    let escalated = escalation
        .escalate(task.id, "no response from triage", &AuditActor::system("overdue-sweep"))
        .await
        .unwrap();

    assert_eq!(escalated.origin, ItemOrigin::Escalation);
    assert_eq!(escalated.role.qualified(), "helpdesk:senior");
    assert_eq!(escalated.target_resolution, original.target_resolution);

    // exactly one active owner, and the ledger distinguishes escalation
    let active = active_items(&fx.store, task.id).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, escalated.id);
    let history = fx.store.item_history(original.id).await.unwrap();
    assert_eq!(
        history.last().unwrap().status,
        ticketflow_core::models::task_item::ItemStatus::Escalated
    );

    // the escalated assignee can drive the same transition
    let senior = caller_for(&escalated);
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &senior, "took over triage")
        .await
        .unwrap();
    assert_eq!(active_items(&fx.store, task.id).await.len(), 1);
    assert_eq!(outcome.task.current_step, Some(fx.resolve.id));
}

#[tokio::test]
async fn escalation_fails_without_a_path() {
    let fx = fixture(EndLogic::Internal).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let items = active_items(&fx.store, task.id).await;
    let agent = caller_for(&items[0]);
    fx.engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap();

    // Resolve has no escalate_to
    let escalation = EscalationEngine::new(
        fx.store.clone(),
        fx.engine.allocator().clone(),
        fx.publisher.clone(),
        fx.queue.clone(),
    );
    let err = escalation
        .escalate(task.id, "still overdue", &AuditActor::system("overdue-sweep"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoEscalationPath { .. }));
}

#[tokio::test]
async fn bypass_needs_the_capability_and_closes_the_dangling_item() {
    let fx = fixture(EndLogic::Internal).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();

    let plain = Caller::new(Uuid::new_v4(), "ops");
    let err = fx
        .engine
        .bypass_transition(task.id, fx.advance.id, &plain, "stuck assignment")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapabilityDenied { .. }));

    let admin = plain.with_capability(Capability::BypassTransition);
    let outcome = fx
        .engine
        .bypass_transition(task.id, fx.advance.id, &admin, "stuck assignment")
        .await
        .unwrap();
    assert_eq!(outcome.task.current_step, Some(fx.resolve.id));

    // the bypass still respects from_step: it cannot repeat the same edge
    let err = fx
        .engine
        .bypass_transition(task.id, fx.advance.id, &admin, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    // exactly one active owner on the new step
    assert_eq!(active_items(&fx.store, task.id).await.len(), 1);
}

#[tokio::test]
async fn budget_completion_parks_the_task_and_enqueues_the_handoff() {
    let fx = fixture(EndLogic::Budget).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let items = active_items(&fx.store, task.id).await;
    let agent = caller_for(&items[0]);
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap();
    let senior = caller_for(&outcome.assigned.unwrap());
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.finish.id, &senior, "approved")
        .await
        .unwrap();

    assert_eq!(outcome.task.status, TaskStatus::PendingExternal);
    assert!(outcome.task.resolution_status.is_none());
    let handoffs = fx.queue.drain("external_submissions");
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0]["ticket_number"], serde_json::json!(task.ticket_number));

    // no further user-driven transitions
    let err = fx
        .engine
        .apply_transition(task.id, fx.finish.id, &senior, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn resolve_callback_closes_once_and_only_once() {
    let fx = fixture(EndLogic::Budget).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let items = active_items(&fx.store, task.id).await;
    let agent = caller_for(&items[0]);
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap();
    let senior = caller_for(&outcome.assigned.unwrap());
    fx.engine
        .apply_transition(task.id, fx.finish.id, &senior, "approved")
        .await
        .unwrap();

    let gateway = ExternalGateway::new(fx.store.clone(), fx.engine.clone(), fx.publisher.clone());

    let pending = gateway.pending_tickets(EndLogic::Budget).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].ticket_number, task.ticket_number);

    let request = ResolveRequest {
        ticket_number: Some(task.ticket_number.clone()),
        ticket_id: None,
        status: Some("APPROVED".to_string()),
        comment: Some("booked".to_string()),
        reviewed_by: Some("bms".to_string()),
    };
    let unauthorized = Caller::new(Uuid::new_v4(), "bms");
    let err = gateway.resolve(&request, &unauthorized).await.unwrap_err();
    assert!(matches!(err, EngineError::CapabilityDenied { .. }));

    let reviewer = unauthorized.with_capability(Capability::ResolveExternal);
    let resolved = gateway.resolve(&request, &reviewer).await.unwrap();
    assert_eq!(resolved.status, TaskStatus::Completed);
    assert_eq!(resolved.resolution_status, Some(ResolutionStatus::Resolved));

    let err = gateway
        .resolve(
            &ResolveRequest {
                ticket_number: Some(task.ticket_number.clone()),
                ticket_id: None,
                status: None,
                comment: None,
                reviewed_by: None,
            },
            &reviewer,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyResolved { .. }));

    let status = gateway.status(&task.ticket_number).await.unwrap();
    assert!(status.is_resolved);
}

#[tokio::test]
async fn rejected_external_status_records_a_rejection() {
    let fx = fixture(EndLogic::Budget).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let items = active_items(&fx.store, task.id).await;
    let agent = caller_for(&items[0]);
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap();
    let senior = caller_for(&outcome.assigned.unwrap());
    fx.engine
        .apply_transition(task.id, fx.finish.id, &senior, "approved")
        .await
        .unwrap();

    let gateway = ExternalGateway::new(fx.store.clone(), fx.engine.clone(), fx.publisher.clone());
    let reviewer = Caller::new(Uuid::new_v4(), "bms").with_capability(Capability::ResolveExternal);
    let resolved = gateway
        .resolve(
            &ResolveRequest {
                ticket_number: Some(task.ticket_number.clone()),
                ticket_id: None,
                status: Some("REJECTED".to_string()),
                comment: None,
                reviewed_by: None,
            },
            &reviewer,
        )
        .await
        .unwrap();
    assert_eq!(resolved.resolution_status, Some(ResolutionStatus::Rejected));
}

#[tokio::test]
async fn resolve_accepts_the_task_id_identifier() {
    let fx = fixture(EndLogic::Budget).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let items = active_items(&fx.store, task.id).await;
    let agent = caller_for(&items[0]);
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap();
    let senior = caller_for(&outcome.assigned.unwrap());
    fx.engine
        .apply_transition(task.id, fx.finish.id, &senior, "approved")
        .await
        .unwrap();

    let gateway = ExternalGateway::new(fx.store.clone(), fx.engine.clone(), fx.publisher.clone());
    let reviewer = Caller::new(Uuid::new_v4(), "bms").with_capability(Capability::ResolveExternal);
    let resolved = gateway
        .resolve(
            &ResolveRequest {
                ticket_number: None,
                ticket_id: Some(task.id),
                status: Some("APPROVED".to_string()),
                comment: None,
                reviewed_by: None,
            },
            &reviewer,
        )
        .await
        .unwrap();
    assert_eq!(resolved.id, task.id);
    assert_eq!(resolved.status, TaskStatus::Completed);

    // a body naming neither identifier is malformed
    let err = gateway
        .resolve(
            &ResolveRequest {
                ticket_number: None,
                ticket_id: None,
                status: None,
                comment: None,
                reviewed_by: None,
            },
            &reviewer,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
}

#[tokio::test]
async fn backdated_ticket_computes_deadlines_from_its_submission_time() {
    let fx = fixture(EndLogic::Internal).await;
    let submitted_at = Utc::now() - Duration::hours(6);
    let mut ticket = high_priority_ticket();
    ticket.submitted_at = Some(submitted_at);

    let task = fx.engine.route_ticket(&ticket).await.unwrap();
    assert_eq!(task.target_resolution, submitted_at + Duration::hours(8));
    // 1/4 of 8h from the historical clock: already in the past
    let items = fx.store.items_for_task(task.id).await.unwrap();
    assert_eq!(items[0].target_resolution, submitted_at + Duration::hours(2));
}

#[tokio::test]
async fn overdue_sweep_escalates_each_breach_at_most_once() {
    let fx = fixture(EndLogic::Internal).await;
    let mut ticket = high_priority_ticket();
    // triage deadline (2h after submission) is already four hours gone
    ticket.submitted_at = Some(Utc::now() - Duration::hours(6));
    let task = fx.engine.route_ticket(&ticket).await.unwrap();

    let escalation = EscalationEngine::new(
        fx.store.clone(),
        fx.engine.allocator().clone(),
        fx.publisher.clone(),
        fx.queue.clone(),
    );
    let sweep = OverdueSweep::new(fx.store.clone(), escalation, &SweepConfig::default());

    let outcome = sweep.run_once().await.unwrap();
    assert_eq!(outcome.escalated, 1);
    let active = active_items(&fx.store, task.id).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].origin, ItemOrigin::Escalation);

    // still overdue, but already escalated: the sweep leaves it alone
    let outcome = sweep.run_once().await.unwrap();
    assert_eq!(outcome.escalated, 0);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(active_items(&fx.store, task.id).await.len(), 1);
}

#[tokio::test]
async fn failed_next_step_assignment_leaves_the_task_in_place() {
    let fx = fixture(EndLogic::Internal).await;
    let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
    let agent = caller_for(&active_items(&fx.store, task.id).await[0]);

    // the only senior leaves before triage finishes
    let seniors = fx.store.active_members(&role("helpdesk:senior")).await.unwrap();
    fx.store.deactivate_member(seniors[0].id);

    let err = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoEligibleMember { .. }));

    // nothing moved: same step, same single active owner
    let after = fx.store.task(task.id).await.unwrap().unwrap();
    assert_eq!(after.current_step, Some(fx.triage.id));
    assert_eq!(after.status, TaskStatus::Pending);
    assert!(!after.progressed);
    let active = active_items(&fx.store, task.id).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].role_user, agent.id);

    // once the role is staffed again the same transition goes through
    fx.store.add_member(test_support::member(&role("helpdesk:senior"), "sana"));
    let outcome = fx
        .engine
        .apply_transition(task.id, fx.advance.id, &agent, "triaged")
        .await
        .unwrap();
    assert_eq!(outcome.task.current_step, Some(fx.resolve.id));
}

#[tokio::test]
async fn failed_start_assignment_persists_no_task() {
    let fx = fixture(EndLogic::Internal).await;
    let agents = fx.store.active_members(&role("helpdesk:agent")).await.unwrap();
    fx.store.deactivate_member(agents[0].id);

    let ticket = high_priority_ticket();
    let err = fx.engine.route_ticket(&ticket).await.unwrap_err();
    assert!(matches!(err, EngineError::NoEligibleMember { .. }));
    assert!(fx
        .store
        .task_by_ticket_number(&ticket.ticket_number)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unmatched_tickets_are_refused() {
    let fx = fixture(EndLogic::Internal).await;
    let mut ticket = high_priority_ticket();
    ticket.department = "Facilities".to_string();
    let err = fx.engine.route_ticket(&ticket).await.unwrap_err();
    assert!(matches!(err, EngineError::NoMatchingWorkflow { .. }));
}

#[tokio::test]
async fn round_robin_spreads_tasks_across_agents() {
    let fx = fixture(EndLogic::Internal).await;
    let agents = role("helpdesk:agent");
    fx.store.add_member(test_support::member(&agents, "ben"));
    fx.store.add_member(test_support::member(&agents, "cleo"));
    let members = fx.store.active_members(&agents).await.unwrap();
    assert_eq!(members.len(), 3);

    let mut counts = std::collections::HashMap::new();
    for _ in 0..9 {
        let task = fx.engine.route_ticket(&high_priority_ticket()).await.unwrap();
        let item = fx.store.latest_item(task.id).await.unwrap().unwrap();
        *counts.entry(item.role_user).or_insert(0usize) += 1;
    }
    // 9 tasks over 3 agents: each gets exactly 3
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 3));
}
