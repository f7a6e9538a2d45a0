//! # Persistence Seams
//!
//! Trait seams per aggregate, with two backends: the in-memory store used by
//! tests and single-process embedders, and the Postgres store used in
//! production. The engine is written against the traits only.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::audit::AuditEvent;
use crate::models::role::{RoleMember, RoleRef};
use crate::models::submission::FailedSubmission;
use crate::models::task::Task;
use crate::models::task_item::{ItemStatus, TaskItem, TaskItemHistory};
use crate::models::workflow::{EndLogic, Step, Transition, Workflow};

/// Read-mostly access to workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Find the deployed workflow matching the given ticket key, preferring
    /// an exact sub-category match over a catch-all.
    async fn find_matching(
        &self,
        department: &str,
        category: &str,
        sub_category: Option<&str>,
    ) -> Result<Option<Workflow>>;

    async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>>;

    /// Steps of a workflow, ordered by their `order` attribute.
    async fn steps(&self, workflow_id: Uuid) -> Result<Vec<Step>>;

    async fn step(&self, id: Uuid) -> Result<Option<Step>>;

    async fn transition(&self, id: Uuid) -> Result<Option<Transition>>;

    /// Persist a whole workflow graph (deployment path and seeding).
    async fn insert_graph(
        &self,
        workflow: &Workflow,
        steps: &[Step],
        transitions: &[Transition],
    ) -> Result<()>;
}

/// Live task state: tasks, assignments, and the assignment ledger.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn task_by_ticket_number(&self, ticket_number: &str) -> Result<Option<Task>>;

    /// Tasks parked for a given external system.
    async fn tasks_pending_external(&self, end_logic: EndLogic) -> Result<Vec<Task>>;

    /// Insert an item together with its initial `new` ledger row.
    async fn insert_item(&self, item: &TaskItem) -> Result<()>;
    async fn update_item(&self, item: &TaskItem) -> Result<()>;

    /// Items of a task, oldest first.
    async fn items_for_task(&self, task_id: Uuid) -> Result<Vec<TaskItem>>;

    /// The most recently created item of a task, if any.
    async fn latest_item(&self, task_id: Uuid) -> Result<Option<TaskItem>>;

    /// Current (latest) ledger status of an item.
    async fn item_status(&self, item_id: Uuid) -> Result<Option<ItemStatus>>;

    /// Append a ledger row, enforcing forward-only movement.
    async fn append_item_history(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        changed_by: Option<Uuid>,
    ) -> Result<()>;

    async fn item_history(&self, item_id: Uuid) -> Result<Vec<TaskItemHistory>>;

    /// The user's item on this task whose current status is active, if any.
    async fn active_item_for_user(&self, task_id: Uuid, user_id: Uuid)
        -> Result<Option<TaskItem>>;

    /// Latest items whose deadline has elapsed and whose status is still
    /// active, for the overdue sweep. Only the most recent item per task is
    /// considered actionable.
    async fn overdue_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskItem>>;
}

/// Directory of role membership. Implementations must return members in a
/// deterministic order (sorted by member id) for round-robin stability.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn active_members(&self, role: &RoleRef) -> Result<Vec<RoleMember>>;
}

/// Persisted round-robin cursors, one per role.
#[async_trait]
pub trait PointerStore: Send + Sync {
    /// Atomically read the pointer for `role`, reduce it modulo
    /// `member_count`, advance it by one (modulo `member_count`), and return
    /// the selected index. Concurrent calls for the same role must serialize;
    /// different roles are independent.
    async fn advance(&self, role: &RoleRef, member_count: usize) -> Result<usize>;
}

/// Failed external submissions awaiting retry or remediation.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn insert_submission(&self, record: &FailedSubmission) -> Result<()>;
    async fn update_submission(&self, record: &FailedSubmission) -> Result<()>;
    async fn submission(&self, id: Uuid) -> Result<Option<FailedSubmission>>;

    /// Non-terminal records whose `next_retry_at` has passed, oldest first.
    async fn due_submissions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FailedSubmission>>;

    async fn submissions_for_task(&self, task_id: Uuid) -> Result<Vec<FailedSubmission>>;
}

/// Append-only audit sink.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
    async fn events_for(&self, target_type: &str, target_id: &str) -> Result<Vec<AuditEvent>>;
}

/// Everything the engine needs from one backend.
pub trait EngineStore:
    WorkflowStore + TaskStore + RoleDirectory + PointerStore + SubmissionStore + AuditStore + 'static
{
}

impl<T> EngineStore for T where
    T: WorkflowStore
        + TaskStore
        + RoleDirectory
        + PointerStore
        + SubmissionStore
        + AuditStore
        + 'static
{
}
