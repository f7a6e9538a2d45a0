//! Domain records for the routing engine: the workflow graph, live tasks and
//! their assignment ledgers, role references, failed external submissions,
//! and audit events.

pub mod audit;
pub mod role;
pub mod submission;
pub mod task;
pub mod task_item;
pub mod ticket;
pub mod workflow;

pub use audit::{AuditAction, AuditActor, AuditEvent, FieldChange};
pub use role::{RoleMember, RoleRef};
pub use submission::{FailedSubmission, SubmissionErrorKind, SubmissionStatus};
pub use task::{ResolutionStatus, Task, TaskStatus};
pub use task_item::{ItemOrigin, ItemStatus, TaskItem, TaskItemHistory};
pub use ticket::{Employee, Priority, Ticket, TicketLineItem};
pub use workflow::{
    total_weight, validate_graph, EndLogic, MatchKey, SlaPolicy, Step, Transition, Workflow,
    WorkflowStatus,
};
