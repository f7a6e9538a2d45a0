//! Engine-wide defaults. Runtime values come from [`crate::config::EngineConfig`];
//! these are the fallbacks its `Default` impl is built from.

/// Bounded timeout for one external submission POST.
pub const DEFAULT_SUBMISSION_TIMEOUT_SECONDS: u64 = 30;

/// Bounded timeout for resolving a role's active membership.
pub const DEFAULT_ROLE_LOOKUP_TIMEOUT_SECONDS: u64 = 10;

/// Delay before the first retry of a transient submission failure.
pub const DEFAULT_INITIAL_RETRY_DELAY_SECONDS: i64 = 30;

/// Base of the exponential backoff schedule (`base * 2^retry_count`).
pub const DEFAULT_BACKOFF_BASE_SECONDS: i64 = 30;

/// Upper bound on any single backoff delay.
pub const DEFAULT_BACKOFF_CAP_SECONDS: i64 = 3600;

/// Retries before a transient submission failure becomes permanent.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Records claimed per retry-sweep pass.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 50;

/// Role that owns every ticket for its whole lifetime (`system:role` form).
pub const DEFAULT_COORDINATOR_ROLE: &str = "helpdesk:coordinator";

/// Category code substituted when the source ticket's sub-category is blank.
pub const DEFAULT_CATEGORY_CODE: &str = "GENERAL";

/// Queue names used with the task-queue client.
pub const NOTIFICATIONS_QUEUE: &str = "notifications";
pub const EXTERNAL_SUBMISSIONS_QUEUE: &str = "external_submissions";
