//! Domain events and the audit recorder.
//!
//! The engine emits explicit, typed events instead of relying on framework
//! hooks: every consumer (audit, notifications, metrics) subscribes by name
//! to the broadcast publisher or is called directly.

pub mod audit;
pub mod publisher;

pub use audit::AuditRecorder;
pub use publisher::{DomainEvent, EventPublisher, PublishedEvent};
