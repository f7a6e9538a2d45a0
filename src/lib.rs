//! # TicketFlow Core
//!
//! Workflow-driven ticket routing: a configurable sequence of role-owned
//! steps, fair round-robin assignment of each step to a human actor,
//! priority-based SLA deadlines weighted per step, escalation of overdue
//! work to backup roles, and a retrying, fallback-aware hand-off to external
//! budget/asset systems at workflow completion.
//!
//! ## Architecture
//!
//! - [`engine`]: the task state machine: creation, transition validation,
//!   administrative bypass, escalation, and the overdue sweep
//! - [`allocator`]: round-robin assignment over persisted per-role pointers
//! - [`sla`]: task- and step-level deadline computation
//! - [`submission`]: external submission client with retry/backoff/fallback
//! - [`store`]: persistence seams with in-memory and Postgres backends
//! - [`events`]: typed domain events and the best-effort audit recorder
//! - [`api`]: typed gateway surface for external collaborators
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ticketflow_core::config::EngineConfig;
//! use ticketflow_core::engine::TaskEngine;
//! use ticketflow_core::events::EventPublisher;
//! use ticketflow_core::queue::InMemoryQueue;
//! use ticketflow_core::store::InMemoryStore;
//!
//! # fn main() -> ticketflow_core::error::Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let config = EngineConfig::default();
//! let engine = TaskEngine::new(
//!     store,
//!     &config,
//!     EventPublisher::default(),
//!     Arc::new(InMemoryQueue::new()),
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod api;
pub mod auth;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod queue;
pub mod sla;
pub mod store;
pub mod submission;

#[doc(hidden)]
pub mod test_support;

pub use config::EngineConfig;
pub use engine::{EscalationEngine, OverdueSweep, TaskEngine, TransitionOutcome};
pub use error::{EngineError, Result};
pub use events::{DomainEvent, EventPublisher};
pub use store::{EngineStore, InMemoryStore, PgStore};
pub use submission::{RetrySweep, SubmissionClient};
