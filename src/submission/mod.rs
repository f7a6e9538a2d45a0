//! # External Submission Client
//!
//! Hands a completed ticket to the budget-management system: payload
//! transform, bounded POST with outcome classification, a one-shot
//! validation fallback, and an exponential-backoff retry sweep for
//! transient failures.

pub mod client;
pub mod payload;
pub mod retry;

pub use client::{
    HttpSubmissionTransport, SubmissionClient, SubmissionOutcome, SubmissionReport,
    SubmissionTransport,
};
pub use payload::{coerce_amount, BudgetLine, BudgetSubmissionPayload};
pub use retry::{RetryOutcome, RetrySweep};
