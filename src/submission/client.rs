//! Submission transport and the first-attempt client with its one-shot
//! validation fallback.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{FallbackConfig, SubmissionConfig};
use crate::error::{EngineError, Result};
use crate::events::{AuditRecorder, DomainEvent, EventPublisher};
use crate::models::audit::{AuditAction, AuditActor, AuditEvent};
use crate::models::submission::{FailedSubmission, SubmissionErrorKind, SubmissionStatus};
use crate::models::task::Task;
use crate::models::ticket::Ticket;
use crate::store::EngineStore;
use crate::submission::payload::BudgetSubmissionPayload;

/// Classified result of one POST to the external system.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// 2xx. The external system may return its own identifier.
    Accepted { external_id: Option<String> },
    /// 4xx: the payload was rejected; retrying without changing it is
    /// pointless.
    Rejected { status: u16, message: String },
    /// 5xx or connection failure.
    Unavailable { message: String },
    /// The bounded request timeout elapsed.
    TimedOut,
}

impl SubmissionOutcome {
    pub fn error_kind(&self) -> Option<SubmissionErrorKind> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { .. } => Some(SubmissionErrorKind::Validation),
            Self::Unavailable { .. } => Some(SubmissionErrorKind::ServiceUnavailable),
            Self::TimedOut => Some(SubmissionErrorKind::Timeout),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected { status, message } => Some(format!("HTTP {status}: {message}")),
            Self::Unavailable { message } => Some(message.clone()),
            Self::TimedOut => Some("request timed out".to_string()),
        }
    }
}

/// Seam over the wire call so the client and the retry sweep are testable
/// without a live endpoint.
#[async_trait]
pub trait SubmissionTransport: Send + Sync {
    async fn post(&self, payload: &Value) -> Result<SubmissionOutcome>;
}

/// Production transport over reqwest with the bounded submission timeout.
pub struct HttpSubmissionTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSubmissionTransport {
    pub fn new(config: &SubmissionConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(EngineError::Configuration {
                message: "submission endpoint is not configured".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| EngineError::Submission {
                message: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl SubmissionTransport for HttpSubmissionTransport {
    async fn post(&self, payload: &Value) -> Result<SubmissionOutcome> {
        let response = match self.client.post(&self.endpoint).json(payload).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Ok(SubmissionOutcome::TimedOut),
            Err(err) => {
                return Ok(SubmissionOutcome::Unavailable {
                    message: err.to_string(),
                })
            }
        };

        let status = response.status();
        if status.is_success() {
            let external_id = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("external_id")
                        .or_else(|| body.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            return Ok(SubmissionOutcome::Accepted { external_id });
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Ok(SubmissionOutcome::Rejected {
                status: status.as_u16(),
                message,
            })
        } else {
            Ok(SubmissionOutcome::Unavailable {
                message: format!("HTTP {}: {message}", status.as_u16()),
            })
        }
    }
}

/// Result of the first submission attempt for a completed task.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionReport {
    /// Accepted, possibly after the fallback pass.
    Submitted {
        external_id: Option<String>,
        used_fallback_fiscal_year: bool,
        used_fallback_accounts: bool,
    },
    /// Transient failure; a retry record was persisted.
    Deferred { record: FailedSubmission },
    /// Validation failure that survived the fallback pass; terminal.
    Failed { record: FailedSubmission },
}

/// First-attempt submission client. Transform, POST, classify, and apply the
/// one-shot validation fallback before conceding to the retry schedule.
pub struct SubmissionClient<S: EngineStore> {
    store: Arc<S>,
    transport: Arc<dyn SubmissionTransport>,
    publisher: EventPublisher,
    audit: AuditRecorder,
    config: SubmissionConfig,
    fallback: FallbackConfig,
}

impl<S: EngineStore> SubmissionClient<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn SubmissionTransport>,
        publisher: EventPublisher,
        config: SubmissionConfig,
        fallback: FallbackConfig,
    ) -> Self {
        let audit = AuditRecorder::new(store.clone());
        Self {
            store,
            transport,
            publisher,
            audit,
            config,
            fallback,
        }
    }

    pub async fn submit(&self, task: &Task, ticket: &Ticket) -> Result<SubmissionReport> {
        let mut payload = BudgetSubmissionPayload::from_ticket(ticket)?;
        let source = serde_json::to_value(ticket)?;

        let outcome = self.transport.post(&serde_json::to_value(&payload)?).await?;
        let mut used_fiscal_year = false;
        let mut used_accounts = false;

        let final_outcome = match outcome {
            SubmissionOutcome::Rejected { status, message } => {
                match self.apply_fallback(&mut payload, &message) {
                    (false, false) => SubmissionOutcome::Rejected { status, message },
                    (fy, acc) => {
                        used_fiscal_year = fy;
                        used_accounts = acc;
                        info!(
                            task_id = %task.id,
                            used_fiscal_year = fy,
                            used_accounts = acc,
                            "retrying submission with fallback identifiers"
                        );
                        self.transport.post(&serde_json::to_value(&payload)?).await?
                    }
                }
            }
            other => other,
        };

        match final_outcome {
            SubmissionOutcome::Accepted { external_id } => {
                self.record_attempt(task, true, used_fiscal_year, used_accounts)
                    .await;
                Ok(SubmissionReport::Submitted {
                    external_id,
                    used_fallback_fiscal_year: used_fiscal_year,
                    used_fallback_accounts: used_accounts,
                })
            }
            outcome @ SubmissionOutcome::Rejected { .. } => {
                // data correction, not time: terminal immediately
                let record = self
                    .persist_failure(
                        task,
                        &payload,
                        source,
                        &outcome,
                        SubmissionStatus::Failed,
                        None,
                        used_fiscal_year,
                        used_accounts,
                    )
                    .await?;
                warn!(
                    task_id = %task.id,
                    error = %record.error_message.as_deref().unwrap_or("unknown"),
                    "submission rejected after fallback; manual correction required"
                );
                self.publisher.publish(DomainEvent::SubmissionFailed {
                    task_id: task.id,
                    kind: SubmissionErrorKind::Validation,
                    retry_count: 0,
                    terminal: true,
                });
                Ok(SubmissionReport::Failed { record })
            }
            outcome => {
                let next_retry_at = Utc::now()
                    + ChronoDuration::seconds(self.config.initial_retry_delay_seconds);
                let record = self
                    .persist_failure(
                        task,
                        &payload,
                        source,
                        &outcome,
                        SubmissionStatus::Pending,
                        Some(next_retry_at),
                        used_fiscal_year,
                        used_accounts,
                    )
                    .await?;
                let kind = record.error_kind;
                warn!(
                    task_id = %task.id,
                    kind = %kind,
                    next_retry_at = %next_retry_at.to_rfc3339(),
                    "submission deferred for retry"
                );
                self.publisher.publish(DomainEvent::SubmissionFailed {
                    task_id: task.id,
                    kind,
                    retry_count: 0,
                    terminal: false,
                });
                Ok(SubmissionReport::Deferred { record })
            }
        }
    }

    /// Substitute known-good identifiers named by the rejection message.
    /// Returns which substitutions were applied.
    fn apply_fallback(
        &self,
        payload: &mut BudgetSubmissionPayload,
        message: &str,
    ) -> (bool, bool) {
        let lowered = message.to_lowercase();
        let mut used_fiscal_year = false;
        let mut used_accounts = false;

        if lowered.contains("fiscal") {
            if let Some(fiscal_year_id) = &self.fallback.fiscal_year_id {
                payload.fiscal_year_id = Some(fiscal_year_id.clone());
                used_fiscal_year = true;
            }
        }
        if lowered.contains("account") {
            if let Some(account_id) = &self.fallback.account_id {
                for line in &mut payload.lines {
                    line.account_id = Some(account_id.clone());
                }
                used_accounts = true;
            }
        }
        (used_fiscal_year, used_accounts)
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_failure(
        &self,
        task: &Task,
        payload: &BudgetSubmissionPayload,
        source: Value,
        outcome: &SubmissionOutcome,
        status: SubmissionStatus,
        next_retry_at: Option<chrono::DateTime<Utc>>,
        used_fiscal_year: bool,
        used_accounts: bool,
    ) -> Result<FailedSubmission> {
        let now = Utc::now();
        let record = FailedSubmission {
            id: Uuid::new_v4(),
            task_id: task.id,
            ticket_number: task.ticket_number.clone(),
            payload: serde_json::to_value(payload)?,
            source,
            status,
            error_kind: outcome.error_kind().unwrap_or(SubmissionErrorKind::Unknown),
            error_message: outcome.error_message(),
            retry_count: 0,
            max_retries: self.config.max_retries,
            next_retry_at,
            used_fallback_fiscal_year: used_fiscal_year,
            used_fallback_accounts: used_accounts,
            external_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_submission(&record).await?;
        self.record_attempt(task, false, used_fiscal_year, used_accounts)
            .await;
        Ok(record)
    }

    async fn record_attempt(
        &self,
        task: &Task,
        success: bool,
        used_fiscal_year: bool,
        used_accounts: bool,
    ) {
        self.audit
            .record(
                AuditEvent::new(
                    AuditActor::system("submission-client"),
                    if success {
                        AuditAction::SubmissionAttempted
                    } else {
                        AuditAction::SubmissionFailed
                    },
                    "task",
                    task.id,
                    format!(
                        "external submission for ticket {} {}",
                        task.ticket_number,
                        if success { "accepted" } else { "failed" }
                    ),
                )
                .with_metadata(serde_json::json!({
                    "used_fallback_fiscal_year": used_fiscal_year,
                    "used_fallback_accounts": used_accounts,
                })),
            )
            .await;
        if success {
            self.publisher.publish(DomainEvent::SubmissionAttempted {
                task_id: task.id,
                success,
                used_fallback_fiscal_year: used_fiscal_year,
                used_fallback_accounts: used_accounts,
            });
        }
    }
}
