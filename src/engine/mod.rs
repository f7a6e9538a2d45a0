//! # Task State Machine
//!
//! The engine that routes a ticket through its workflow: task creation at
//! the start step, transition validation and application, and the
//! administrative bypass path. Escalation lives in [`escalation`].
//!
//! Validation order in [`TaskEngine::apply_transition`] is part of the
//! contract: notes, then assignment, then transition lookup, then from-step
//! match. Step skipping is rejected by the from-step check.

pub mod escalation;

pub use escalation::{EscalationEngine, OverdueSweep, SweepOutcome};

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator::RoundRobinAllocator;
use crate::auth::{Caller, Capability};
use crate::config::EngineConfig;
use crate::constants::{EXTERNAL_SUBMISSIONS_QUEUE, NOTIFICATIONS_QUEUE};
use crate::error::{EngineError, Result};
use crate::events::{AuditRecorder, DomainEvent, EventPublisher};
use crate::models::audit::{AuditAction, AuditActor, AuditEvent};
use crate::models::role::RoleRef;
use crate::models::task::{ResolutionStatus, Task, TaskStatus};
use crate::models::task_item::{ItemOrigin, ItemStatus, TaskItem};
use crate::models::ticket::Ticket;
use crate::models::workflow::{Step, Transition, Workflow};
use crate::queue::TaskQueueClient;
use crate::sla;
use crate::store::EngineStore;

/// Result of a transition: the updated task and, when the task advanced to
/// another step, the fresh assignment.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub task: Task,
    pub assigned: Option<TaskItem>,
}

/// Everything fallible about a transition, resolved before any record is
/// written. A staged transition either commits whole or leaves the task as
/// it was.
struct StagedTransition {
    workflow: Workflow,
    from_step_name: String,
    advance: Option<(Step, TaskItem)>,
}

/// The routing engine. All operations execute synchronously within the
/// caller's unit of work; only the external submission client blocks on
/// network I/O.
pub struct TaskEngine<S: EngineStore> {
    store: Arc<S>,
    allocator: RoundRobinAllocator<S>,
    publisher: EventPublisher,
    audit: AuditRecorder,
    queue: Arc<dyn TaskQueueClient>,
    coordinator_role: RoleRef,
}

impl<S: EngineStore> TaskEngine<S> {
    pub fn new(
        store: Arc<S>,
        config: &EngineConfig,
        publisher: EventPublisher,
        queue: Arc<dyn TaskQueueClient>,
    ) -> Result<Self> {
        let coordinator_role = config.coordinator_role()?;
        let allocator =
            RoundRobinAllocator::new(store.clone(), config.submission.role_lookup_timeout());
        let audit = AuditRecorder::new(store.clone());
        Ok(Self {
            store,
            allocator,
            publisher,
            audit,
            queue,
            coordinator_role,
        })
    }

    pub fn allocator(&self) -> &RoundRobinAllocator<S> {
        &self.allocator
    }

    /// Route an incoming ticket: find the deployed workflow for its
    /// department/category key and create the task there.
    pub async fn route_ticket(&self, ticket: &Ticket) -> Result<Task> {
        let workflow = self
            .store
            .find_matching(
                &ticket.department,
                &ticket.category,
                ticket.sub_category.as_deref(),
            )
            .await?
            .ok_or_else(|| EngineError::NoMatchingWorkflow {
                department: ticket.department.clone(),
                category: ticket.category.clone(),
            })?;
        self.create_task_in(ticket, workflow).await
    }

    /// Create a task on an explicitly chosen workflow, validating that the
    /// workflow is deployed and matches the ticket's key.
    pub async fn create_task(&self, ticket: &Ticket, workflow_id: Uuid) -> Result<Task> {
        let workflow = self
            .store
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NoMatchingWorkflow {
                department: ticket.department.clone(),
                category: ticket.category.clone(),
            })?;
        if !workflow.is_deployed() {
            return Err(EngineError::WorkflowNotDeployed {
                workflow: workflow.name.clone(),
            });
        }
        if !workflow.matches(
            &ticket.department,
            &ticket.category,
            ticket.sub_category.as_deref(),
        ) {
            return Err(EngineError::WorkflowMismatch {
                workflow: workflow.name.clone(),
                department: ticket.department.clone(),
                category: ticket.category.clone(),
            });
        }
        self.create_task_in(ticket, workflow).await
    }

    async fn create_task_in(&self, ticket: &Ticket, workflow: Workflow) -> Result<Task> {
        let steps = self.store.steps(workflow.id).await?;
        let start = steps
            .iter()
            .find(|s| s.is_start)
            .cloned()
            .ok_or_else(|| EngineError::InvalidWorkflow {
                workflow: workflow.name.clone(),
                reason: "workflow has no start step".to_string(),
            })?;

        // backdated imports compute deadlines from the recorded submission
        // time, passed explicitly
        let now = ticket.effective_created_at();
        let target_resolution = sla::task_deadline(now, ticket.priority, &workflow)?;
        let owner = self.allocator.assign(&self.coordinator_role).await?;

        let task = Task {
            id: Uuid::new_v4(),
            ticket_id: ticket.id,
            ticket_number: ticket.ticket_number.clone(),
            workflow_id: workflow.id,
            current_step: Some(start.id),
            status: TaskStatus::Pending,
            ticket_owner: owner.id,
            priority: ticket.priority,
            target_resolution,
            resolution_time: None,
            resolution_status: None,
            progressed: false,
            created_at: now,
            updated_at: now,
        };
        // stage the start assignment before the task row exists: a role with
        // no eligible member must not leave an ownerless task behind
        let item = self
            .prepare_item(&task, &start, &steps, &workflow, ItemOrigin::System, now)
            .await?;
        self.store.insert_task(&task).await?;
        self.commit_item(&item, &task, &start).await?;

        info!(
            task_id = %task.id,
            ticket_number = %task.ticket_number,
            workflow = %workflow.name,
            step = %start.name,
            assignee = %item.role_user_name,
            "task created"
        );
        self.audit
            .record(
                AuditEvent::new(
                    AuditActor::system("ingestion"),
                    AuditAction::TaskCreated,
                    "task",
                    task.id,
                    format!(
                        "ticket {} routed to workflow {} at step {}",
                        task.ticket_number, workflow.name, start.name
                    ),
                )
                .with_change("status", serde_json::Value::Null, "pending")
                .with_change("current_step", serde_json::Value::Null, start.name.clone()),
            )
            .await;
        self.publisher.publish(DomainEvent::TaskCreated {
            task_id: task.id,
            ticket_number: task.ticket_number.clone(),
            workflow: workflow.name.clone(),
            step: start.name.clone(),
        });
        Ok(task)
    }

    /// Mark the caller's assignment in progress (the task moves with it).
    pub async fn begin_work(&self, task_id: Uuid, user: &Caller) -> Result<Task> {
        let mut task = self.require_open_task(task_id).await?;
        let item = self
            .store
            .active_item_for_user(task_id, user.id)
            .await?
            .ok_or_else(|| EngineError::UserNotAssigned {
                task_id,
                user: user.name.clone(),
            })?;

        self.store
            .append_item_history(item.id, ItemStatus::InProgress, Some(user.id))
            .await?;
        let previous = task.status;
        task.status = TaskStatus::InProgress;
        self.store.update_task(&task).await?;

        self.audit
            .record(
                AuditEvent::new(
                    AuditActor::user(user.id, user.name.clone()),
                    AuditAction::WorkStarted,
                    "task",
                    task.id,
                    format!("{} started working on ticket {}", user.name, task.ticket_number),
                )
                .with_change("status", previous.to_string(), task.status.to_string()),
            )
            .await;
        self.publisher.publish(DomainEvent::WorkStarted {
            task_id,
            user: user.name.clone(),
        });
        Ok(task)
    }

    /// Apply a user-driven transition. See the module docs for the
    /// validation order.
    pub async fn apply_transition(
        &self,
        task_id: Uuid,
        transition_id: Uuid,
        acting: &Caller,
        notes: &str,
    ) -> Result<TransitionOutcome> {
        if notes.trim().is_empty() {
            return Err(EngineError::NotesRequired);
        }
        let task = self.require_open_task(task_id).await?;

        let mut item = self
            .store
            .active_item_for_user(task_id, acting.id)
            .await?
            .ok_or_else(|| EngineError::UserNotAssigned {
                task_id,
                user: acting.name.clone(),
            })?;

        let transition = self.load_transition(&task, transition_id).await?;
        self.validate_from_step(&task, &transition)?;
        let staged = self.stage_transition(&task, &transition).await?;

        self.store
            .append_item_history(item.id, ItemStatus::Resolved, Some(acting.id))
            .await?;
        item.acted_on = Some(Utc::now());
        item.notes = Some(notes.to_string());
        self.store.update_item(&item).await?;

        let actor = AuditActor::user(acting.id, acting.name.clone());
        self.commit_transition(task, staged, actor, false).await
    }

    /// Administrative override: identical transition-validity checks, no
    /// assignment requirement. Strictly for operational recovery; logged and
    /// audited distinctly from user-driven transitions.
    pub async fn bypass_transition(
        &self,
        task_id: Uuid,
        transition_id: Uuid,
        admin: &Caller,
        notes: &str,
    ) -> Result<TransitionOutcome> {
        admin.authorize(Capability::BypassTransition)?;
        if notes.trim().is_empty() {
            return Err(EngineError::NotesRequired);
        }
        let task = self.require_open_task(task_id).await?;
        let transition = self.load_transition(&task, transition_id).await?;
        self.validate_from_step(&task, &transition)?;
        let staged = self.stage_transition(&task, &transition).await?;

        // close the dangling active assignment so exactly one owner remains
        if let Some(mut item) = self.store.latest_item(task_id).await? {
            let active = self
                .store
                .item_status(item.id)
                .await?
                .map(|s| s.is_active())
                .unwrap_or(false);
            if active {
                self.store
                    .append_item_history(item.id, ItemStatus::Resolved, Some(admin.id))
                    .await?;
                item.acted_on = Some(Utc::now());
                item.notes = Some(format!("administrative bypass: {notes}"));
                self.store.update_item(&item).await?;
            }
        }

        warn!(
            task_id = %task_id,
            transition_id = %transition_id,
            admin = %admin.name,
            "transition bypassed administratively"
        );
        let actor = AuditActor::user(admin.id, admin.name.clone());
        self.commit_transition(task, staged, actor, true).await
    }

    async fn require_open_task(&self, task_id: Uuid) -> Result<Task> {
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound {
                reference: task_id.to_string(),
            })?;
        if task.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                task_id,
                reason: format!("task is {} and accepts no further transitions", task.status),
            });
        }
        Ok(task)
    }

    async fn load_transition(&self, task: &Task, transition_id: Uuid) -> Result<Transition> {
        let transition = self
            .store
            .transition(transition_id)
            .await?
            .ok_or(EngineError::TransitionNotFound { transition_id })?;
        if transition.workflow_id != task.workflow_id {
            return Err(EngineError::InvalidTransition {
                task_id: task.id,
                reason: "transition belongs to a different workflow".to_string(),
            });
        }
        Ok(transition)
    }

    /// A task may only traverse a transition whose `from_step` equals its
    /// current step; a start transition (`from_step = None`) is legal only
    /// while the task has never progressed past its start step.
    fn validate_from_step(&self, task: &Task, transition: &Transition) -> Result<()> {
        match transition.from_step {
            Some(from) if task.current_step == Some(from) => Ok(()),
            Some(from) => Err(EngineError::InvalidTransition {
                task_id: task.id,
                reason: format!(
                    "transition departs step {from} but task is at {} (step skipping is not allowed)",
                    task.current_step
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "no step".to_string()),
                ),
            }),
            None if !task.progressed => Ok(()),
            None => Err(EngineError::InvalidTransition {
                task_id: task.id,
                reason: "start transition is illegal once the task has progressed".to_string(),
            }),
        }
    }

    /// Resolve everything about the transition that can fail before any
    /// record is written: the workflow graph, the target step, and for an
    /// advance the allocated member and weighted deadline.
    async fn stage_transition(
        &self,
        task: &Task,
        transition: &Transition,
    ) -> Result<StagedTransition> {
        let workflow = self
            .store
            .workflow(task.workflow_id)
            .await?
            .ok_or_else(|| EngineError::InvalidWorkflow {
                workflow: task.workflow_id.to_string(),
                reason: "workflow record missing".to_string(),
            })?;
        let from_step_name = match task.current_step {
            Some(id) => self
                .store
                .step(id)
                .await?
                .map(|s| s.name)
                .unwrap_or_else(|| id.to_string()),
            None => "start".to_string(),
        };
        let advance = match transition.to_step {
            Some(next_id) => {
                let steps = self.store.steps(workflow.id).await?;
                let next = steps
                    .iter()
                    .find(|s| s.id == next_id)
                    .cloned()
                    .ok_or_else(|| EngineError::InvalidWorkflow {
                        workflow: workflow.name.clone(),
                        reason: format!("transition targets unknown step {next_id}"),
                    })?;
                let item = self
                    .prepare_item(task, &next, &steps, &workflow, ItemOrigin::System, Utc::now())
                    .await?;
                Some((next, item))
            }
            None => None,
        };
        Ok(StagedTransition {
            workflow,
            from_step_name,
            advance,
        })
    }

    async fn commit_transition(
        &self,
        mut task: Task,
        staged: StagedTransition,
        actor: AuditActor,
        bypassed: bool,
    ) -> Result<TransitionOutcome> {
        let StagedTransition {
            workflow,
            from_step_name,
            advance,
        } = staged;
        let previous_status = task.status;

        let outcome = match advance {
            Some((next, item)) => {
                task.current_step = Some(next.id);
                task.status = TaskStatus::Pending;
                task.progressed = true;
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;

                self.commit_item(&item, &task, &next).await?;
                self.emit_transition(
                    &task,
                    &from_step_name,
                    Some(next.name.clone()),
                    previous_status,
                    &actor,
                    bypassed,
                )
                .await;
                TransitionOutcome {
                    task,
                    assigned: Some(item),
                }
            }
            None => {
                task.current_step = None;
                task.progressed = true;
                task.resolution_time = Some(Utc::now());
                task.status = if workflow.end_logic.is_external() {
                    TaskStatus::PendingExternal
                } else {
                    task.resolution_status = Some(ResolutionStatus::Resolved);
                    TaskStatus::Completed
                };
                task.updated_at = Utc::now();
                self.store.update_task(&task).await?;

                if workflow.end_logic.is_external() {
                    self.queue
                        .enqueue(
                            EXTERNAL_SUBMISSIONS_QUEUE,
                            json!({
                                "task_id": task.id,
                                "ticket_number": task.ticket_number,
                                "system": workflow.end_logic.to_string(),
                            }),
                        )
                        .await?;
                }
                self.emit_transition(
                    &task,
                    &from_step_name,
                    None,
                    previous_status,
                    &actor,
                    bypassed,
                )
                .await;
                self.publisher.publish(DomainEvent::TaskCompleted {
                    task_id: task.id,
                    ticket_number: task.ticket_number.clone(),
                    resolution: task.resolution_status,
                    awaiting_external: task.status == TaskStatus::PendingExternal,
                });
                TransitionOutcome {
                    task,
                    assigned: None,
                }
            }
        };
        Ok(outcome)
    }

    async fn emit_transition(
        &self,
        task: &Task,
        from_step: &str,
        to_step: Option<String>,
        previous_status: TaskStatus,
        actor: &AuditActor,
        bypassed: bool,
    ) {
        let action = if bypassed {
            AuditAction::TransitionBypassed
        } else {
            AuditAction::TransitionApplied
        };
        let to_label = to_step.clone().unwrap_or_else(|| "completed".to_string());
        self.audit
            .record(
                AuditEvent::new(
                    actor.clone(),
                    action,
                    "task",
                    task.id,
                    format!(
                        "ticket {} moved from {} to {}",
                        task.ticket_number, from_step, to_label
                    ),
                )
                .with_change("current_step", from_step, to_label.as_str())
                .with_change(
                    "status",
                    previous_status.to_string(),
                    task.status.to_string(),
                ),
            )
            .await;
        self.publisher.publish(DomainEvent::TransitionApplied {
            task_id: task.id,
            from_step: from_step.to_string(),
            to_step,
            actor: actor.name.clone(),
            bypassed,
        });
    }

    /// Allocate a member for the step's role and stamp the weighted
    /// deadline. Nothing is persisted here; the caller commits the item only
    /// after the surrounding task mutation is decided.
    async fn prepare_item(
        &self,
        task: &Task,
        step: &Step,
        steps: &[Step],
        workflow: &Workflow,
        origin: ItemOrigin,
        now: DateTime<Utc>,
    ) -> Result<TaskItem> {
        let member = self.allocator.assign(&step.role).await?;
        let target_resolution = sla::step_deadline(now, task.priority, step, steps, workflow)?;
        Ok(TaskItem {
            id: Uuid::new_v4(),
            task_id: task.id,
            role_user: member.id,
            role_user_name: member.username.clone(),
            role: step.role.clone(),
            origin,
            assigned_on_step: step.id,
            target_resolution,
            acted_on: None,
            notes: None,
            created_at: Utc::now(),
        })
    }

    /// Persist a prepared item with its initial ledger row and notify the
    /// assignee.
    async fn commit_item(&self, item: &TaskItem, task: &Task, step: &Step) -> Result<()> {
        self.store.insert_item(item).await?;
        self.queue
            .enqueue(
                NOTIFICATIONS_QUEUE,
                json!({
                    "task_id": task.id,
                    "ticket_number": task.ticket_number,
                    "assignee": item.role_user_name,
                    "step": step.name,
                    "target_resolution": item.target_resolution.to_rfc3339(),
                }),
            )
            .await?;
        Ok(())
    }
}
