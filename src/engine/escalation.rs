//! Escalation and the overdue sweep.
//!
//! Escalation supersedes the current assignment with a fresh one for the
//! step's escalation role. The elapsed portion of the SLA is not refunded:
//! the new assignment inherits the superseded item's deadline unchanged.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::RoundRobinAllocator;
use crate::config::SweepConfig;
use crate::constants::NOTIFICATIONS_QUEUE;
use crate::error::{EngineError, Result};
use crate::events::{AuditRecorder, DomainEvent, EventPublisher};
use crate::models::audit::{AuditAction, AuditActor, AuditEvent};
use crate::models::task_item::{ItemOrigin, ItemStatus, TaskItem};
use crate::queue::TaskQueueClient;
use crate::store::EngineStore;

pub struct EscalationEngine<S: EngineStore> {
    store: Arc<S>,
    allocator: RoundRobinAllocator<S>,
    publisher: EventPublisher,
    audit: AuditRecorder,
    queue: Arc<dyn TaskQueueClient>,
}

impl<S: EngineStore> Clone for EscalationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            allocator: self.allocator.clone(),
            publisher: self.publisher.clone(),
            audit: self.audit.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<S: EngineStore> EscalationEngine<S> {
    pub fn new(
        store: Arc<S>,
        allocator: RoundRobinAllocator<S>,
        publisher: EventPublisher,
        queue: Arc<dyn TaskQueueClient>,
    ) -> Self {
        let audit = AuditRecorder::new(store.clone());
        Self {
            store,
            allocator,
            publisher,
            audit,
            queue,
        }
    }

    /// Escalate the task's current assignment to the step's escalation role.
    /// The superseded item is marked `escalated` in its ledger; the new item
    /// carries `Escalation` origin and the same target resolution.
    pub async fn escalate(
        &self,
        task_id: Uuid,
        reason: &str,
        triggered_by: &AuditActor,
    ) -> Result<TaskItem> {
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound {
                reference: task_id.to_string(),
            })?;
        let step_id = task
            .current_step
            .ok_or(EngineError::NoActiveAssignment { task_id })?;
        let step = self
            .store
            .step(step_id)
            .await?
            .ok_or_else(|| EngineError::InvalidWorkflow {
                workflow: task.workflow_id.to_string(),
                reason: format!("task references unknown step {step_id}"),
            })?;
        let escalation_role =
            step.escalate_to
                .clone()
                .ok_or_else(|| EngineError::NoEscalationPath {
                    task_id,
                    step: step.name.clone(),
                })?;

        let current = self
            .store
            .latest_item(task_id)
            .await?
            .ok_or(EngineError::NoActiveAssignment { task_id })?;
        let current_active = self
            .store
            .item_status(current.id)
            .await?
            .map(|s| s.is_active())
            .unwrap_or(false);
        if !current_active {
            return Err(EngineError::NoActiveAssignment { task_id });
        }

        let member = self.allocator.assign(&escalation_role).await?;

        self.store
            .append_item_history(current.id, ItemStatus::Escalated, triggered_by.id)
            .await?;

        let item = TaskItem {
            id: Uuid::new_v4(),
            task_id,
            role_user: member.id,
            role_user_name: member.username.clone(),
            role: escalation_role.clone(),
            origin: ItemOrigin::Escalation,
            assigned_on_step: step.id,
            // deadline is inherited, not recomputed
            target_resolution: current.target_resolution,
            acted_on: None,
            notes: None,
            created_at: Utc::now(),
        };
        self.store.insert_item(&item).await?;
        self.queue
            .enqueue(
                NOTIFICATIONS_QUEUE,
                json!({
                    "task_id": task_id,
                    "ticket_number": task.ticket_number,
                    "assignee": member.username,
                    "step": step.name,
                    "escalated": true,
                    "target_resolution": item.target_resolution.to_rfc3339(),
                }),
            )
            .await?;

        info!(
            task_id = %task_id,
            from_user = %current.role_user_name,
            to_user = %member.username,
            to_role = %escalation_role,
            reason,
            "task escalated"
        );
        self.audit
            .record(
                AuditEvent::new(
                    triggered_by.clone(),
                    AuditAction::TaskEscalated,
                    "task",
                    task_id,
                    format!(
                        "ticket {} escalated from {} to {} on step {}",
                        task.ticket_number, current.role_user_name, member.username, step.name
                    ),
                )
                .with_change(
                    "assignee",
                    current.role_user_name.clone(),
                    member.username.clone(),
                )
                .with_change("role", current.role.qualified(), escalation_role.qualified())
                .with_metadata(json!({ "reason": reason })),
            )
            .await;
        self.publisher.publish(DomainEvent::TaskEscalated {
            task_id,
            from_user: current.role_user_name.clone(),
            to_user: member.username.clone(),
            from_role: current.role.qualified(),
            to_role: escalation_role.qualified(),
            reason: reason.to_string(),
        });
        Ok(item)
    }
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub escalated: usize,
    pub skipped: usize,
}

/// Periodic scan for assignments past their target resolution. Items that
/// already carry `Escalation` origin are skipped: the sweep escalates at
/// most once per step, after which the breach is a human problem.
pub struct OverdueSweep<S: EngineStore> {
    store: Arc<S>,
    escalation: EscalationEngine<S>,
    interval: Duration,
    batch_size: usize,
}

impl<S: EngineStore> OverdueSweep<S> {
    pub fn new(store: Arc<S>, escalation: EscalationEngine<S>, config: &SweepConfig) -> Self {
        Self {
            store,
            escalation,
            interval: config.interval(),
            batch_size: config.batch_size,
        }
    }

    pub async fn run_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let overdue = self.store.overdue_items(now, self.batch_size).await?;
        let mut outcome = SweepOutcome::default();
        let actor = AuditActor::system("overdue-sweep");

        for item in overdue {
            if item.origin == ItemOrigin::Escalation {
                debug!(task_id = %item.task_id, item_id = %item.id, "already escalated; skipping");
                outcome.skipped += 1;
                continue;
            }
            let reason = format!(
                "target resolution {} elapsed",
                item.target_resolution.to_rfc3339()
            );
            match self.escalation.escalate(item.task_id, &reason, &actor).await {
                Ok(_) => outcome.escalated += 1,
                Err(EngineError::NoEscalationPath { task_id, step }) => {
                    warn!(%task_id, step, "overdue item has no escalation path");
                    outcome.skipped += 1;
                }
                Err(err) => {
                    error!(task_id = %item.task_id, error = %err, "escalation failed; continuing sweep");
                    outcome.skipped += 1;
                }
            }
        }
        if outcome.escalated > 0 || outcome.skipped > 0 {
            info!(
                escalated = outcome.escalated,
                skipped = outcome.skipped,
                "overdue sweep completed"
            );
        }
        Ok(outcome)
    }

    /// Run forever on the configured interval. Intended to be spawned as a
    /// task.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(error = %err, "overdue sweep pass failed");
            }
        }
    }
}
