//! In-memory backend. Used by the test suite and by single-process
//! embedders; pointer advancement is atomic per role via the map's shard
//! locks, matching the fairness contract of the Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::audit::AuditEvent;
use crate::models::role::{RoleMember, RoleRef};
use crate::models::submission::FailedSubmission;
use crate::models::task::Task;
use crate::models::task_item::{ItemStatus, TaskItem, TaskItemHistory};
use crate::models::workflow::{EndLogic, Step, Transition, Workflow};

use super::{
    AuditStore, PointerStore, RoleDirectory, SubmissionStore, TaskStore, WorkflowStore,
};

#[derive(Default)]
pub struct InMemoryStore {
    workflows: DashMap<Uuid, Workflow>,
    steps: DashMap<Uuid, Step>,
    transitions: DashMap<Uuid, Transition>,
    tasks: DashMap<Uuid, Task>,
    items: DashMap<Uuid, TaskItem>,
    histories: DashMap<Uuid, Vec<TaskItemHistory>>,
    members: DashMap<String, Vec<RoleMember>>,
    pointers: DashMap<String, u64>,
    submissions: DashMap<Uuid, FailedSubmission>,
    audit: DashMap<String, Vec<AuditEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role member for directory lookups.
    pub fn add_member(&self, member: RoleMember) {
        self.members
            .entry(member.role.qualified())
            .or_default()
            .push(member);
    }

    /// Mark a member inactive so directory lookups skip them.
    pub fn deactivate_member(&self, member_id: Uuid) {
        for mut entry in self.members.iter_mut() {
            for member in entry.value_mut().iter_mut() {
                if member.id == member_id {
                    member.active = false;
                }
            }
        }
    }

    fn latest_status(&self, item_id: Uuid) -> Option<ItemStatus> {
        self.histories
            .get(&item_id)
            .and_then(|rows| rows.last().map(|row| row.status))
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn find_matching(
        &self,
        department: &str,
        category: &str,
        sub_category: Option<&str>,
    ) -> Result<Option<Workflow>> {
        let mut candidates: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|entry| {
                entry.is_deployed() && entry.matches(department, category, sub_category)
            })
            .map(|entry| entry.clone())
            .collect();
        // prefer an exact sub-category key over a catch-all, then the
        // newest version
        candidates.sort_by(|a, b| {
            b.key
                .sub_category
                .is_some()
                .cmp(&a.key.sub_category.is_some())
                .then(b.version.cmp(&a.version))
        });
        Ok(candidates.into_iter().next())
    }

    async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        Ok(self.workflows.get(&id).map(|w| w.clone()))
    }

    async fn steps(&self, workflow_id: Uuid) -> Result<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .steps
            .iter()
            .filter(|s| s.workflow_id == workflow_id)
            .map(|s| s.clone())
            .collect();
        steps.sort_by_key(|s| s.order);
        Ok(steps)
    }

    async fn step(&self, id: Uuid) -> Result<Option<Step>> {
        Ok(self.steps.get(&id).map(|s| s.clone()))
    }

    async fn transition(&self, id: Uuid) -> Result<Option<Transition>> {
        Ok(self.transitions.get(&id).map(|t| t.clone()))
    }

    async fn insert_graph(
        &self,
        workflow: &Workflow,
        steps: &[Step],
        transitions: &[Transition],
    ) -> Result<()> {
        self.workflows.insert(workflow.id, workflow.clone());
        for step in steps {
            self.steps.insert(step.id, step.clone());
        }
        for transition in transitions {
            self.transitions.insert(transition.id, transition.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn task_by_ticket_number(&self, ticket_number: &str) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .iter()
            .find(|t| t.ticket_number == ticket_number)
            .map(|t| t.clone()))
    }

    async fn tasks_pending_external(&self, end_logic: EndLogic) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| {
                t.status == crate::models::task::TaskStatus::PendingExternal
                    && self
                        .workflows
                        .get(&t.workflow_id)
                        .map(|w| w.end_logic == end_logic)
                        .unwrap_or(false)
            })
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn insert_item(&self, item: &TaskItem) -> Result<()> {
        self.items.insert(item.id, item.clone());
        self.histories.entry(item.id).or_default().push(TaskItemHistory {
            id: Uuid::new_v4(),
            task_item_id: item.id,
            status: ItemStatus::New,
            changed_by: None,
            changed_at: item.created_at,
        });
        Ok(())
    }

    async fn update_item(&self, item: &TaskItem) -> Result<()> {
        self.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn items_for_task(&self, task_id: Uuid) -> Result<Vec<TaskItem>> {
        let mut items: Vec<TaskItem> = self
            .items
            .iter()
            .filter(|i| i.task_id == task_id)
            .map(|i| i.clone())
            .collect();
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    async fn latest_item(&self, task_id: Uuid) -> Result<Option<TaskItem>> {
        Ok(self.items_for_task(task_id).await?.pop())
    }

    async fn item_status(&self, item_id: Uuid) -> Result<Option<ItemStatus>> {
        Ok(self.latest_status(item_id))
    }

    async fn append_item_history(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        changed_by: Option<Uuid>,
    ) -> Result<()> {
        let mut rows = self.histories.entry(item_id).or_default();
        if let Some(last) = rows.last() {
            if status.rank() < last.status.rank() {
                return Err(EngineError::ItemStatusRegression {
                    item_id,
                    from: last.status.to_string(),
                    to: status.to_string(),
                });
            }
        }
        rows.push(TaskItemHistory {
            id: Uuid::new_v4(),
            task_item_id: item_id,
            status,
            changed_by,
            changed_at: Utc::now(),
        });
        Ok(())
    }

    async fn item_history(&self, item_id: Uuid) -> Result<Vec<TaskItemHistory>> {
        Ok(self
            .histories
            .get(&item_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn active_item_for_user(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TaskItem>> {
        let items = self.items_for_task(task_id).await?;
        Ok(items
            .into_iter()
            .rev()
            .find(|i| {
                i.role_user == user_id
                    && self
                        .latest_status(i.id)
                        .map(|s| s.is_active())
                        .unwrap_or(false)
            }))
    }

    async fn overdue_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskItem>> {
        let task_ids: Vec<Uuid> = self.tasks.iter().map(|t| t.id).collect();
        let mut overdue = Vec::new();
        for task_id in task_ids {
            if let Some(item) = self.latest_item(task_id).await? {
                let active = self
                    .latest_status(item.id)
                    .map(|s| s.is_active())
                    .unwrap_or(false);
                if active && item.target_resolution <= now {
                    overdue.push(item);
                    if overdue.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(overdue)
    }
}

#[async_trait]
impl RoleDirectory for InMemoryStore {
    async fn active_members(&self, role: &RoleRef) -> Result<Vec<RoleMember>> {
        let mut members: Vec<RoleMember> = self
            .members
            .get(&role.qualified())
            .map(|m| m.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.active)
            .collect();
        members.sort_by_key(|m| m.id);
        Ok(members)
    }
}

#[async_trait]
impl PointerStore for InMemoryStore {
    async fn advance(&self, role: &RoleRef, member_count: usize) -> Result<usize> {
        if member_count == 0 {
            return Err(EngineError::NoEligibleMember {
                role: role.qualified(),
            });
        }
        // the entry guard holds the shard lock, making the read-modify-write
        // atomic per role
        let mut pointer = self.pointers.entry(role.qualified()).or_insert(0);
        let index = (*pointer as usize) % member_count;
        *pointer = ((index + 1) % member_count) as u64;
        Ok(index)
    }
}

#[async_trait]
impl SubmissionStore for InMemoryStore {
    async fn insert_submission(&self, record: &FailedSubmission) -> Result<()> {
        self.submissions.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_submission(&self, record: &FailedSubmission) -> Result<()> {
        self.submissions.insert(record.id, record.clone());
        Ok(())
    }

    async fn submission(&self, id: Uuid) -> Result<Option<FailedSubmission>> {
        Ok(self.submissions.get(&id).map(|r| r.clone()))
    }

    async fn due_submissions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FailedSubmission>> {
        let mut due: Vec<FailedSubmission> = self
            .submissions
            .iter()
            .filter(|r| {
                !r.status.is_terminal()
                    && r.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|r| r.clone())
            .collect();
        due.sort_by_key(|r| r.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn submissions_for_task(&self, task_id: Uuid) -> Result<Vec<FailedSubmission>> {
        let mut records: Vec<FailedSubmission> = self
            .submissions
            .iter()
            .filter(|r| r.task_id == task_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        let key = format!("{}:{}", event.target_type, event.target_id);
        self.audit.entry(key).or_default().push(event);
        Ok(())
    }

    async fn events_for(&self, target_type: &str, target_id: &str) -> Result<Vec<AuditEvent>> {
        Ok(self
            .audit
            .get(&format!("{target_type}:{target_id}"))
            .map(|events| events.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::member;

    #[tokio::test]
    async fn pointer_advances_modulo_membership() {
        let store = InMemoryStore::new();
        let role = RoleRef::parse("helpdesk:agent").unwrap();
        let picks: Vec<usize> = {
            let mut out = Vec::new();
            for _ in 0..5 {
                out.push(store.advance(&role, 3).await.unwrap());
            }
            out
        };
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[tokio::test]
    async fn active_members_are_sorted_and_filtered() {
        let store = InMemoryStore::new();
        let role = RoleRef::parse("helpdesk:agent").unwrap();
        let mut inactive = member(&role, "carol");
        inactive.active = false;
        store.add_member(member(&role, "alice"));
        store.add_member(member(&role, "bob"));
        store.add_member(inactive);

        let members = store.active_members(&role).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.windows(2).all(|w| w[0].id <= w[1].id));
    }

    #[tokio::test]
    async fn history_is_forward_only() {
        let store = InMemoryStore::new();
        let item_id = Uuid::new_v4();
        store
            .append_item_history(item_id, ItemStatus::New, None)
            .await
            .unwrap();
        store
            .append_item_history(item_id, ItemStatus::Resolved, None)
            .await
            .unwrap();
        let err = store
            .append_item_history(item_id, ItemStatus::InProgress, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ItemStatusRegression { .. }));
    }
}
