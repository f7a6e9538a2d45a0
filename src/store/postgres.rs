//! Postgres backend using the sqlx runtime query API over a shared
//! [`PgPool`]. Status columns are stored as text and parsed through the
//! models' `FromStr` impls; the round-robin pointer is advanced under a
//! `FOR UPDATE` row lock so concurrent assignments for one role serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::audit::{AuditActor, AuditEvent};
use crate::models::role::{RoleMember, RoleRef};
use crate::models::submission::FailedSubmission;
use crate::models::task::Task;
use crate::models::task_item::{ItemStatus, TaskItem, TaskItemHistory};
use crate::models::workflow::{
    EndLogic, MatchKey, SlaPolicy, Step, Transition, Workflow,
};

use super::{
    AuditStore, PointerStore, RoleDirectory, SubmissionStore, TaskStore, WorkflowStore,
};

/// Postgres-backed engine store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the engine's tables if they do not exist. Idempotent.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }
}

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_workflows (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        department TEXT NOT NULL,
        category TEXT NOT NULL,
        sub_category TEXT,
        sla_low_seconds BIGINT,
        sla_medium_seconds BIGINT,
        sla_high_seconds BIGINT,
        sla_urgent_seconds BIGINT,
        end_logic TEXT NOT NULL,
        published BOOLEAN NOT NULL DEFAULT FALSE,
        status TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_steps (
        id UUID PRIMARY KEY,
        workflow_id UUID NOT NULL REFERENCES ticketflow_workflows(id),
        name TEXT NOT NULL,
        step_order INTEGER NOT NULL,
        role_system TEXT NOT NULL,
        role_name TEXT NOT NULL,
        weight DOUBLE PRECISION NOT NULL,
        escalate_system TEXT,
        escalate_role TEXT,
        is_start BOOLEAN NOT NULL DEFAULT FALSE,
        is_end BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_transitions (
        id UUID PRIMARY KEY,
        workflow_id UUID NOT NULL REFERENCES ticketflow_workflows(id),
        name TEXT NOT NULL,
        from_step UUID REFERENCES ticketflow_steps(id),
        to_step UUID REFERENCES ticketflow_steps(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_tasks (
        id UUID PRIMARY KEY,
        ticket_id UUID NOT NULL,
        ticket_number TEXT NOT NULL,
        workflow_id UUID NOT NULL REFERENCES ticketflow_workflows(id),
        current_step UUID,
        status TEXT NOT NULL,
        ticket_owner UUID NOT NULL,
        priority TEXT NOT NULL,
        target_resolution TIMESTAMPTZ NOT NULL,
        resolution_time TIMESTAMPTZ,
        resolution_status TEXT,
        progressed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ticketflow_tasks_ticket_number ON ticketflow_tasks(ticket_number)",
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_task_items (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL REFERENCES ticketflow_tasks(id),
        role_user UUID NOT NULL,
        role_user_name TEXT NOT NULL,
        role_system TEXT NOT NULL,
        role_name TEXT NOT NULL,
        origin TEXT NOT NULL,
        assigned_on_step UUID NOT NULL,
        target_resolution TIMESTAMPTZ NOT NULL,
        acted_on TIMESTAMPTZ,
        notes TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_task_item_history (
        id UUID PRIMARY KEY,
        seq BIGSERIAL,
        task_item_id UUID NOT NULL REFERENCES ticketflow_task_items(id),
        status TEXT NOT NULL,
        changed_by UUID,
        changed_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_role_members (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL,
        role_system TEXT NOT NULL,
        role_name TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_round_robin_pointers (
        role_key TEXT PRIMARY KEY,
        position BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_failed_submissions (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL,
        ticket_number TEXT NOT NULL,
        payload JSONB NOT NULL,
        source JSONB NOT NULL,
        status TEXT NOT NULL,
        error_kind TEXT NOT NULL,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        next_retry_at TIMESTAMPTZ,
        used_fallback_fiscal_year BOOLEAN NOT NULL DEFAULT FALSE,
        used_fallback_accounts BOOLEAN NOT NULL DEFAULT FALSE,
        external_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ticketflow_audit_events (
        id UUID PRIMARY KEY,
        actor_id UUID,
        actor_name TEXT NOT NULL,
        action TEXT NOT NULL,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        changes JSONB NOT NULL,
        description TEXT NOT NULL,
        request_metadata JSONB,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

fn parse<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(|e: String| EngineError::Database {
        message: format!("invalid value in database: {e}"),
    })
}

#[derive(FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    department: String,
    category: String,
    sub_category: Option<String>,
    sla_low_seconds: Option<i64>,
    sla_medium_seconds: Option<i64>,
    sla_high_seconds: Option<i64>,
    sla_urgent_seconds: Option<i64>,
    end_logic: String,
    published: bool,
    status: String,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow> {
        Ok(Workflow {
            id: self.id,
            name: self.name,
            key: MatchKey {
                department: self.department,
                category: self.category,
                sub_category: self.sub_category,
            },
            sla: SlaPolicy {
                low_seconds: self.sla_low_seconds,
                medium_seconds: self.sla_medium_seconds,
                high_seconds: self.sla_high_seconds,
                urgent_seconds: self.sla_urgent_seconds,
            },
            end_logic: parse::<EndLogic>(&self.end_logic)?,
            published: self.published,
            status: parse(&self.status)?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct StepRow {
    id: Uuid,
    workflow_id: Uuid,
    name: String,
    step_order: i32,
    role_system: String,
    role_name: String,
    weight: f64,
    escalate_system: Option<String>,
    escalate_role: Option<String>,
    is_start: bool,
    is_end: bool,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        let escalate_to = match (self.escalate_system, self.escalate_role) {
            (Some(system), Some(role)) => Some(RoleRef::new(system, role)?),
            _ => None,
        };
        Ok(Step {
            id: self.id,
            workflow_id: self.workflow_id,
            name: self.name,
            order: self.step_order,
            role: RoleRef::new(self.role_system, self.role_name)?,
            weight: self.weight,
            escalate_to,
            is_start: self.is_start,
            is_end: self.is_end,
        })
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    ticket_id: Uuid,
    ticket_number: String,
    workflow_id: Uuid,
    current_step: Option<Uuid>,
    status: String,
    ticket_owner: Uuid,
    priority: String,
    target_resolution: DateTime<Utc>,
    resolution_time: Option<DateTime<Utc>>,
    resolution_status: Option<String>,
    progressed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            ticket_id: self.ticket_id,
            ticket_number: self.ticket_number,
            workflow_id: self.workflow_id,
            current_step: self.current_step,
            status: parse(&self.status)?,
            ticket_owner: self.ticket_owner,
            priority: self.priority.parse().map_err(|e: String| {
                EngineError::Database {
                    message: format!("invalid value in database: {e}"),
                }
            })?,
            target_resolution: self.target_resolution,
            resolution_time: self.resolution_time,
            resolution_status: self
                .resolution_status
                .as_deref()
                .map(parse)
                .transpose()?,
            progressed: self.progressed,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ItemRow {
    id: Uuid,
    task_id: Uuid,
    role_user: Uuid,
    role_user_name: String,
    role_system: String,
    role_name: String,
    origin: String,
    assigned_on_step: Uuid,
    target_resolution: DateTime<Utc>,
    acted_on: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl ItemRow {
    fn into_item(self) -> Result<TaskItem> {
        Ok(TaskItem {
            id: self.id,
            task_id: self.task_id,
            role_user: self.role_user,
            role_user_name: self.role_user_name,
            role: RoleRef::new(self.role_system, self.role_name)?,
            origin: parse(&self.origin)?,
            assigned_on_step: self.assigned_on_step,
            target_resolution: self.target_resolution,
            acted_on: self.acted_on,
            notes: self.notes,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct SubmissionRow {
    id: Uuid,
    task_id: Uuid,
    ticket_number: String,
    payload: serde_json::Value,
    source: serde_json::Value,
    status: String,
    error_kind: String,
    error_message: Option<String>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    used_fallback_fiscal_year: bool,
    used_fallback_accounts: bool,
    external_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SubmissionRow {
    fn into_submission(self) -> Result<FailedSubmission> {
        Ok(FailedSubmission {
            id: self.id,
            task_id: self.task_id,
            ticket_number: self.ticket_number,
            payload: self.payload,
            source: self.source,
            status: parse(&self.status)?,
            error_kind: parse(&self.error_kind)?,
            error_message: self.error_message,
            retry_count: self.retry_count.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            next_retry_at: self.next_retry_at,
            used_fallback_fiscal_year: self.used_fallback_fiscal_year,
            used_fallback_accounts: self.used_fallback_accounts,
            external_id: self.external_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const ITEM_COLUMNS: &str = "id, task_id, role_user, role_user_name, role_system, role_name, \
     origin, assigned_on_step, target_resolution, acted_on, notes, created_at";

/// Latest-ledger-row subquery used wherever an item's current status matters.
const LATEST_STATUS: &str = "(SELECT h.status FROM ticketflow_task_item_history h \
     WHERE h.task_item_id = i.id ORDER BY h.seq DESC LIMIT 1)";

#[async_trait]
impl WorkflowStore for PgStore {
    async fn find_matching(
        &self,
        department: &str,
        category: &str,
        sub_category: Option<&str>,
    ) -> Result<Option<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT * FROM ticketflow_workflows
            WHERE LOWER(department) = LOWER($1)
              AND LOWER(category) = LOWER($2)
              AND published AND status = 'deployed'
            ORDER BY version DESC
            "#,
        )
        .bind(department)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = rows
            .into_iter()
            .map(WorkflowRow::into_workflow)
            .collect::<Result<Vec<_>>>()?;
        candidates.retain(|w| w.matches(department, category, sub_category));
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
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM ticketflow_workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkflowRow::into_workflow)
            .transpose()
    }

    async fn steps(&self, workflow_id: Uuid) -> Result<Vec<Step>> {
        sqlx::query_as::<_, StepRow>(
            "SELECT * FROM ticketflow_steps WHERE workflow_id = $1 ORDER BY step_order",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StepRow::into_step)
        .collect()
    }

    async fn step(&self, id: Uuid) -> Result<Option<Step>> {
        sqlx::query_as::<_, StepRow>("SELECT * FROM ticketflow_steps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(StepRow::into_step)
            .transpose()
    }

    async fn transition(&self, id: Uuid) -> Result<Option<Transition>> {
        Ok(sqlx::query_as::<_, Transition>(
            "SELECT id, workflow_id, name, from_step, to_step FROM ticketflow_transitions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_graph(
        &self,
        workflow: &Workflow,
        steps: &[Step],
        transitions: &[Transition],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO ticketflow_workflows
                (id, name, department, category, sub_category,
                 sla_low_seconds, sla_medium_seconds, sla_high_seconds, sla_urgent_seconds,
                 end_logic, published, status, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.key.department)
        .bind(&workflow.key.category)
        .bind(&workflow.key.sub_category)
        .bind(workflow.sla.low_seconds)
        .bind(workflow.sla.medium_seconds)
        .bind(workflow.sla.high_seconds)
        .bind(workflow.sla.urgent_seconds)
        .bind(workflow.end_logic.to_string())
        .bind(workflow.published)
        .bind(workflow.status.to_string())
        .bind(workflow.version)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO ticketflow_steps
                    (id, workflow_id, name, step_order, role_system, role_name,
                     weight, escalate_system, escalate_role, is_start, is_end)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(step.id)
            .bind(step.workflow_id)
            .bind(&step.name)
            .bind(step.order)
            .bind(&step.role.system)
            .bind(&step.role.role)
            .bind(step.weight)
            .bind(step.escalate_to.as_ref().map(|r| r.system.clone()))
            .bind(step.escalate_to.as_ref().map(|r| r.role.clone()))
            .bind(step.is_start)
            .bind(step.is_end)
            .execute(&mut *tx)
            .await?;
        }

        for transition in transitions {
            sqlx::query(
                "INSERT INTO ticketflow_transitions (id, workflow_id, name, from_step, to_step) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(transition.id)
            .bind(transition.workflow_id)
            .bind(&transition.name)
            .bind(transition.from_step)
            .bind(transition.to_step)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ticketflow_tasks
                (id, ticket_id, ticket_number, workflow_id, current_step, status,
                 ticket_owner, priority, target_resolution, resolution_time,
                 resolution_status, progressed, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(task.id)
        .bind(task.ticket_id)
        .bind(&task.ticket_number)
        .bind(task.workflow_id)
        .bind(task.current_step)
        .bind(task.status.to_string())
        .bind(task.ticket_owner)
        .bind(task.priority.to_string())
        .bind(task.target_resolution)
        .bind(task.resolution_time)
        .bind(task.resolution_status.map(|s| s.to_string()))
        .bind(task.progressed)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ticketflow_tasks SET
                current_step = $2, status = $3, target_resolution = $4,
                resolution_time = $5, resolution_status = $6, progressed = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.current_step)
        .bind(task.status.to_string())
        .bind(task.target_resolution)
        .bind(task.resolution_time)
        .bind(task.resolution_status.map(|s| s.to_string()))
        .bind(task.progressed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task(&self, id: Uuid) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM ticketflow_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TaskRow::into_task)
            .transpose()
    }

    async fn task_by_ticket_number(&self, ticket_number: &str) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM ticketflow_tasks WHERE ticket_number = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(ticket_number)
        .fetch_optional(&self.pool)
        .await?
        .map(TaskRow::into_task)
        .transpose()
    }

    async fn tasks_pending_external(&self, end_logic: EndLogic) -> Result<Vec<Task>> {
        sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT t.* FROM ticketflow_tasks t
            JOIN ticketflow_workflows w ON w.id = t.workflow_id
            WHERE t.status = 'pending_external' AND w.end_logic = $1
            ORDER BY t.created_at
            "#,
        )
        .bind(end_logic.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TaskRow::into_task)
        .collect()
    }

    async fn insert_item(&self, item: &TaskItem) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO ticketflow_task_items
                (id, task_id, role_user, role_user_name, role_system, role_name,
                 origin, assigned_on_step, target_resolution, acted_on, notes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(item.id)
        .bind(item.task_id)
        .bind(item.role_user)
        .bind(&item.role_user_name)
        .bind(&item.role.system)
        .bind(&item.role.role)
        .bind(item.origin.to_string())
        .bind(item.assigned_on_step)
        .bind(item.target_resolution)
        .bind(item.acted_on)
        .bind(&item.notes)
        .bind(item.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO ticketflow_task_item_history \
                 (id, task_item_id, status, changed_by, changed_at) \
             VALUES ($1, $2, 'new', NULL, $3)",
        )
        .bind(Uuid::new_v4())
        .bind(item.id)
        .bind(item.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_item(&self, item: &TaskItem) -> Result<()> {
        sqlx::query(
            "UPDATE ticketflow_task_items SET acted_on = $2, notes = $3 WHERE id = $1",
        )
        .bind(item.id)
        .bind(item.acted_on)
        .bind(&item.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn items_for_task(&self, task_id: Uuid) -> Result<Vec<TaskItem>> {
        sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM ticketflow_task_items WHERE task_id = $1 ORDER BY created_at",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ItemRow::into_item)
        .collect()
    }

    async fn latest_item(&self, task_id: Uuid) -> Result<Option<TaskItem>> {
        sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM ticketflow_task_items WHERE task_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ItemRow::into_item)
        .transpose()
    }

    async fn item_status(&self, item_id: Uuid) -> Result<Option<ItemStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM ticketflow_task_item_history \
             WHERE task_item_id = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        status.as_deref().map(parse).transpose()
    }

    async fn append_item_history(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        changed_by: Option<Uuid>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM ticketflow_task_item_history \
             WHERE task_item_id = $1 ORDER BY seq DESC LIMIT 1 FOR UPDATE",
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(current) = current {
            let current: ItemStatus = parse(&current)?;
            if status.rank() < current.rank() {
                return Err(EngineError::ItemStatusRegression {
                    item_id,
                    from: current.to_string(),
                    to: status.to_string(),
                });
            }
        }

        sqlx::query(
            "INSERT INTO ticketflow_task_item_history \
                 (id, task_item_id, status, changed_by, changed_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(item_id)
        .bind(status.to_string())
        .bind(changed_by)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn item_history(&self, item_id: Uuid) -> Result<Vec<TaskItemHistory>> {
        #[derive(FromRow)]
        struct HistoryRow {
            id: Uuid,
            task_item_id: Uuid,
            status: String,
            changed_by: Option<Uuid>,
            changed_at: DateTime<Utc>,
        }

        sqlx::query_as::<_, HistoryRow>(
            "SELECT id, task_item_id, status, changed_by, changed_at \
             FROM ticketflow_task_item_history WHERE task_item_id = $1 ORDER BY seq",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            Ok(TaskItemHistory {
                id: row.id,
                task_item_id: row.task_item_id,
                status: parse(&row.status)?,
                changed_by: row.changed_by,
                changed_at: row.changed_at,
            })
        })
        .collect()
    }

    async fn active_item_for_user(
        &self,
        task_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TaskItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM ticketflow_task_items i \
             WHERE i.task_id = $1 AND i.role_user = $2 \
               AND {LATEST_STATUS} IN ('new', 'in_progress') \
             ORDER BY i.created_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(task_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(ItemRow::into_item)
            .transpose()
    }

    async fn overdue_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TaskItem>> {
        // only the most recent item per task is actionable
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM \
                 (SELECT DISTINCT ON (task_id) * FROM ticketflow_task_items \
                  ORDER BY task_id, created_at DESC) i \
             WHERE i.target_resolution <= $1 \
               AND {LATEST_STATUS} IN ('new', 'in_progress') \
             ORDER BY i.target_resolution LIMIT $2"
        );
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ItemRow::into_item)
            .collect()
    }
}

#[async_trait]
impl RoleDirectory for PgStore {
    async fn active_members(&self, role: &RoleRef) -> Result<Vec<RoleMember>> {
        #[derive(FromRow)]
        struct MemberRow {
            id: Uuid,
            username: String,
            role_system: String,
            role_name: String,
            active: bool,
        }

        sqlx::query_as::<_, MemberRow>(
            "SELECT id, username, role_system, role_name, active \
             FROM ticketflow_role_members \
             WHERE role_system = $1 AND role_name = $2 AND active \
             ORDER BY id",
        )
        .bind(&role.system)
        .bind(&role.role)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            Ok(RoleMember {
                id: row.id,
                username: row.username,
                role: RoleRef::new(row.role_system, row.role_name)?,
                active: row.active,
            })
        })
        .collect()
    }
}

#[async_trait]
impl PointerStore for PgStore {
    async fn advance(&self, role: &RoleRef, member_count: usize) -> Result<usize> {
        if member_count == 0 {
            return Err(EngineError::NoEligibleMember {
                role: role.qualified(),
            });
        }
        let key = role.qualified();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO ticketflow_round_robin_pointers (role_key, position) \
             VALUES ($1, 0) ON CONFLICT (role_key) DO NOTHING",
        )
        .bind(&key)
        .execute(&mut *tx)
        .await?;

        // row lock serializes concurrent assignments for the same role
        let position: i64 = sqlx::query_scalar(
            "SELECT position FROM ticketflow_round_robin_pointers \
             WHERE role_key = $1 FOR UPDATE",
        )
        .bind(&key)
        .fetch_one(&mut *tx)
        .await?;

        let index = (position.max(0) as usize) % member_count;
        sqlx::query(
            "UPDATE ticketflow_round_robin_pointers SET position = $2 WHERE role_key = $1",
        )
        .bind(&key)
        .bind(((index + 1) % member_count) as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(index)
    }
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn insert_submission(&self, record: &FailedSubmission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ticketflow_failed_submissions
                (id, task_id, ticket_number, payload, source, status, error_kind,
                 error_message, retry_count, max_retries, next_retry_at,
                 used_fallback_fiscal_year, used_fallback_accounts, external_id,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(record.id)
        .bind(record.task_id)
        .bind(&record.ticket_number)
        .bind(&record.payload)
        .bind(&record.source)
        .bind(record.status.to_string())
        .bind(record.error_kind.to_string())
        .bind(&record.error_message)
        .bind(record.retry_count as i32)
        .bind(record.max_retries as i32)
        .bind(record.next_retry_at)
        .bind(record.used_fallback_fiscal_year)
        .bind(record.used_fallback_accounts)
        .bind(&record.external_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_submission(&self, record: &FailedSubmission) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ticketflow_failed_submissions SET
                status = $2, error_kind = $3, error_message = $4, retry_count = $5,
                next_retry_at = $6, used_fallback_fiscal_year = $7,
                used_fallback_accounts = $8, external_id = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.status.to_string())
        .bind(record.error_kind.to_string())
        .bind(&record.error_message)
        .bind(record.retry_count as i32)
        .bind(record.next_retry_at)
        .bind(record.used_fallback_fiscal_year)
        .bind(record.used_fallback_accounts)
        .bind(&record.external_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn submission(&self, id: Uuid) -> Result<Option<FailedSubmission>> {
        sqlx::query_as::<_, SubmissionRow>(
            "SELECT * FROM ticketflow_failed_submissions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(SubmissionRow::into_submission)
        .transpose()
    }

    async fn due_submissions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FailedSubmission>> {
        sqlx::query_as::<_, SubmissionRow>(
            "SELECT * FROM ticketflow_failed_submissions \
             WHERE status IN ('pending', 'retrying') AND next_retry_at <= $1 \
             ORDER BY next_retry_at LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SubmissionRow::into_submission)
        .collect()
    }

    async fn submissions_for_task(&self, task_id: Uuid) -> Result<Vec<FailedSubmission>> {
        sqlx::query_as::<_, SubmissionRow>(
            "SELECT * FROM ticketflow_failed_submissions WHERE task_id = $1 ORDER BY created_at",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(SubmissionRow::into_submission)
        .collect()
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ticketflow_audit_events
                (id, actor_id, actor_name, action, target_type, target_id,
                 changes, description, request_metadata, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(event.actor.id)
        .bind(&event.actor.name)
        .bind(event.action.to_string())
        .bind(&event.target_type)
        .bind(&event.target_id)
        .bind(serde_json::to_value(&event.changes)?)
        .bind(&event.description)
        .bind(&event.request_metadata)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for(&self, target_type: &str, target_id: &str) -> Result<Vec<AuditEvent>> {
        #[derive(FromRow)]
        struct EventRow {
            id: Uuid,
            actor_id: Option<Uuid>,
            actor_name: String,
            action: String,
            target_type: String,
            target_id: String,
            changes: serde_json::Value,
            description: String,
            request_metadata: Option<serde_json::Value>,
            recorded_at: DateTime<Utc>,
        }

        sqlx::query_as::<_, EventRow>(
            "SELECT * FROM ticketflow_audit_events \
             WHERE target_type = $1 AND target_id = $2 ORDER BY recorded_at",
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            let action = serde_json::from_value(serde_json::Value::String(row.action.clone()))?;
            Ok(AuditEvent {
                id: row.id,
                actor: AuditActor {
                    id: row.actor_id,
                    name: row.actor_name,
                },
                action,
                target_type: row.target_type,
                target_id: row.target_id,
                changes: serde_json::from_value(row.changes)?,
                description: row.description,
                request_metadata: row.request_metadata,
                recorded_at: row.recorded_at,
            })
        })
        .collect()
    }
}
