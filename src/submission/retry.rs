//! Retry sweep for failed external submissions.
//!
//! Retries for different tasks are independent; retries for the same task
//! serialize through the in-flight guard so one task is never resubmitted
//! concurrently.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{SubmissionConfig, SweepConfig};
use crate::error::Result;
use crate::events::{AuditRecorder, DomainEvent, EventPublisher};
use crate::models::audit::{AuditAction, AuditActor, AuditEvent};
use crate::models::submission::{FailedSubmission, SubmissionStatus};
use crate::store::EngineStore;
use crate::submission::client::{SubmissionOutcome, SubmissionTransport};

/// Exponential backoff from the post-increment retry count, capped.
fn backoff_delay(base_seconds: i64, cap_seconds: i64, retry_count: u32) -> ChronoDuration {
    let shift = retry_count.min(32);
    let delay = base_seconds.saturating_mul(1i64 << shift);
    ChronoDuration::seconds(delay.min(cap_seconds))
}

/// Counters from one retry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    pub recovered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub skipped: usize,
}

pub struct RetrySweep<S: EngineStore> {
    store: Arc<S>,
    transport: Arc<dyn SubmissionTransport>,
    publisher: EventPublisher,
    audit: AuditRecorder,
    config: SubmissionConfig,
    interval: Duration,
    batch_size: usize,
    /// Task ids with a resubmission in flight.
    in_flight: DashMap<Uuid, ()>,
}

impl<S: EngineStore> RetrySweep<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn SubmissionTransport>,
        publisher: EventPublisher,
        config: SubmissionConfig,
        sweep: &SweepConfig,
    ) -> Self {
        let audit = AuditRecorder::new(store.clone());
        Self {
            store,
            transport,
            publisher,
            audit,
            config,
            interval: sweep.interval(),
            batch_size: sweep.batch_size,
            in_flight: DashMap::new(),
        }
    }

    pub async fn run_once(&self) -> Result<RetryOutcome> {
        let due = self
            .store
            .due_submissions(Utc::now(), self.batch_size)
            .await?;
        let mut outcome = RetryOutcome::default();

        // claim one guard per task; a second due record for the same task
        // waits for the next pass
        let mut guards = Vec::new();
        let mut claimed = Vec::new();
        for record in due {
            let task_id = record.task_id;
            match self.in_flight.entry(task_id) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    debug!(%task_id, "resubmission already in flight; skipping");
                    outcome.skipped += 1;
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(());
                    guards.push(InFlightGuard {
                        map: &self.in_flight,
                        task_id,
                    });
                    claimed.push(record);
                }
            }
        }

        // different tasks are independent, so their retries run concurrently
        let results = futures::future::join_all(claimed.into_iter().map(|record| {
            let task_id = record.task_id;
            async move { (task_id, self.retry(record).await) }
        }))
        .await;
        drop(guards);

        for (task_id, result) in results {
            match result {
                Ok(record) => match record.status {
                    SubmissionStatus::Success => outcome.recovered += 1,
                    SubmissionStatus::Failed => outcome.exhausted += 1,
                    _ => outcome.rescheduled += 1,
                },
                Err(err) => {
                    error!(%task_id, error = %err, "retry attempt errored; continuing sweep");
                    outcome.skipped += 1;
                }
            }
        }

        if outcome != RetryOutcome::default() {
            info!(
                recovered = outcome.recovered,
                rescheduled = outcome.rescheduled,
                exhausted = outcome.exhausted,
                skipped = outcome.skipped,
                "submission retry sweep completed"
            );
        }
        Ok(outcome)
    }

    /// One retry attempt: increment the count, re-post the stored payload,
    /// and settle the record.
    pub async fn retry(&self, mut record: FailedSubmission) -> Result<FailedSubmission> {
        record.retry_count += 1;
        record.status = SubmissionStatus::Retrying;
        record.updated_at = Utc::now();

        let outcome = self.transport.post(&record.payload).await?;
        match outcome {
            SubmissionOutcome::Accepted { external_id } => {
                record.status = SubmissionStatus::Success;
                record.external_id = external_id.clone();
                record.next_retry_at = None;
                record.error_message = None;
                self.store.update_submission(&record).await?;
                info!(
                    task_id = %record.task_id,
                    ticket_number = %record.ticket_number,
                    retry_count = record.retry_count,
                    "submission recovered on retry"
                );
                self.audit
                    .record(AuditEvent::new(
                        AuditActor::system("retry-sweep"),
                        AuditAction::SubmissionRecovered,
                        "task",
                        record.task_id,
                        format!(
                            "submission for ticket {} succeeded on retry {}",
                            record.ticket_number, record.retry_count
                        ),
                    ))
                    .await;
                self.publisher.publish(DomainEvent::SubmissionRecovered {
                    task_id: record.task_id,
                    external_id,
                    retry_count: record.retry_count,
                });
            }
            outcome => {
                record.error_kind = outcome
                    .error_kind()
                    .unwrap_or(record.error_kind);
                record.error_message = outcome.error_message();

                // validation on retry means the stored payload itself is bad;
                // the one fallback pass already happened on first submission
                let terminal = !record.error_kind.is_retriable() || record.retries_exhausted();
                if terminal {
                    record.status = SubmissionStatus::Failed;
                    record.next_retry_at = None;
                    warn!(
                        task_id = %record.task_id,
                        ticket_number = %record.ticket_number,
                        retry_count = record.retry_count,
                        kind = %record.error_kind,
                        "submission permanently failed"
                    );
                } else {
                    let delay = backoff_delay(
                        self.config.backoff_base_seconds,
                        self.config.backoff_cap_seconds,
                        record.retry_count,
                    );
                    record.status = SubmissionStatus::Pending;
                    record.next_retry_at = Some(Utc::now() + delay);
                    debug!(
                        task_id = %record.task_id,
                        retry_count = record.retry_count,
                        delay_seconds = delay.num_seconds(),
                        "submission rescheduled"
                    );
                }
                record.updated_at = Utc::now();
                self.store.update_submission(&record).await?;
                self.publisher.publish(DomainEvent::SubmissionFailed {
                    task_id: record.task_id,
                    kind: record.error_kind,
                    retry_count: record.retry_count,
                    terminal,
                });
            }
        }
        Ok(record)
    }

    /// Run forever on the configured interval. Intended to be spawned as a
    /// task.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(error = %err, "submission retry pass failed");
            }
        }
    }
}

/// Removes the task from the in-flight set on drop.
struct InFlightGuard<'a> {
    map: &'a DashMap<Uuid, ()>,
    task_id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::submission::SubmissionErrorKind;
    use crate::store::memory::InMemoryStore;
    use crate::store::SubmissionStore;
    use crate::submission::client::tests::ScriptedTransport;
    use chrono::DateTime;
    use serde_json::json;

    fn record(retry_count: u32, next_retry_at: Option<DateTime<Utc>>) -> FailedSubmission {
        let now = Utc::now();
        FailedSubmission {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            ticket_number: "TKT-300".to_string(),
            payload: json!({"ticket_number": "TKT-300"}),
            source: json!({}),
            status: SubmissionStatus::Pending,
            error_kind: SubmissionErrorKind::ServiceUnavailable,
            error_message: Some("HTTP 503".to_string()),
            retry_count,
            max_retries: 5,
            next_retry_at,
            used_fallback_fiscal_year: false,
            used_fallback_accounts: false,
            external_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sweep(
        store: Arc<InMemoryStore>,
        transport: Arc<ScriptedTransport>,
    ) -> RetrySweep<InMemoryStore> {
        RetrySweep::new(
            store,
            transport,
            EventPublisher::default(),
            SubmissionConfig::default(),
            &SweepConfig::default(),
        )
    }

    #[test]
    fn backoff_doubles_from_the_post_increment_count() {
        assert_eq!(backoff_delay(30, 3600, 1).num_seconds(), 60);
        assert_eq!(backoff_delay(30, 3600, 2).num_seconds(), 120);
        assert_eq!(backoff_delay(30, 3600, 3).num_seconds(), 240);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(30, 3600, 10).num_seconds(), 3600);
        assert_eq!(backoff_delay(30, 3600, 63).num_seconds(), 3600);
    }

    proptest::proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(count in 0u32..64u32) {
            let delay = backoff_delay(30, 3600, count);
            proptest::prop_assert!(delay.num_seconds() >= 30);
            proptest::prop_assert!(delay.num_seconds() <= 3600);
            proptest::prop_assert!(delay <= backoff_delay(30, 3600, count + 1));
        }
    }

    #[tokio::test]
    async fn third_failure_reschedules_at_two_minutes() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(vec![
            SubmissionOutcome::Unavailable {
                message: "HTTP 503".to_string(),
            },
        ]));
        // one initial failure plus one failed retry so far
        let record = record(1, Some(Utc::now()));
        store.insert_submission(&record).await.unwrap();

        let before = Utc::now();
        let updated = sweep(store, transport).retry(record).await.unwrap();
        assert_eq!(updated.retry_count, 2);
        assert_eq!(updated.status, SubmissionStatus::Pending);
        let delay = (updated.next_retry_at.unwrap() - before).num_seconds();
        assert!((119..=121).contains(&delay), "delay was {delay}s");
    }

    #[tokio::test]
    async fn exhausted_retries_fail_permanently() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(vec![SubmissionOutcome::TimedOut]));
        let record = record(4, Some(Utc::now()));
        store.insert_submission(&record).await.unwrap();

        let updated = sweep(store, transport).retry(record).await.unwrap();
        assert_eq!(updated.retry_count, 5);
        assert_eq!(updated.status, SubmissionStatus::Failed);
        assert!(updated.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn recovery_records_the_external_id() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(vec![SubmissionOutcome::Accepted {
            external_id: Some("BMS-42".to_string()),
        }]));
        let record = record(2, Some(Utc::now()));
        store.insert_submission(&record).await.unwrap();
        let id = record.id;

        let updated = sweep(store.clone(), transport).retry(record).await.unwrap();
        assert_eq!(updated.status, SubmissionStatus::Success);
        assert_eq!(updated.external_id.as_deref(), Some("BMS-42"));

        let stored = store.submission(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Success);
    }

    #[tokio::test]
    async fn second_due_record_for_a_task_waits_for_the_next_pass() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(vec![
            SubmissionOutcome::Accepted { external_id: None },
            SubmissionOutcome::Accepted { external_id: None },
        ]));
        let first = record(0, Some(Utc::now() - ChronoDuration::seconds(5)));
        let mut second = record(0, Some(Utc::now() - ChronoDuration::seconds(5)));
        second.task_id = first.task_id;
        store.insert_submission(&first).await.unwrap();
        store.insert_submission(&second).await.unwrap();

        let outcome = sweep(store.clone(), transport.clone())
            .run_once()
            .await
            .unwrap();
        assert_eq!(outcome.recovered, 1);
        assert_eq!(outcome.skipped, 1);
        // one guarded post for the task, not two
        assert_eq!(transport.posts.lock().len(), 1);

        let a = store.submission(first.id).await.unwrap().unwrap();
        let b = store.submission(second.id).await.unwrap().unwrap();
        let (retried, deferred) = if a.status == SubmissionStatus::Success {
            (a, b)
        } else {
            (b, a)
        };
        assert_eq!(retried.retry_count, 1);
        assert_eq!(deferred.status, SubmissionStatus::Pending);
        assert_eq!(deferred.retry_count, 0);
    }

    #[tokio::test]
    async fn sweep_picks_up_only_due_records() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(vec![SubmissionOutcome::Accepted {
            external_id: None,
        }]));
        let due = record(0, Some(Utc::now() - ChronoDuration::seconds(5)));
        let future = record(0, Some(Utc::now() + ChronoDuration::hours(1)));
        store.insert_submission(&due).await.unwrap();
        store.insert_submission(&future).await.unwrap();

        let outcome = sweep(store.clone(), transport).run_once().await.unwrap();
        assert_eq!(outcome.recovered, 1);
        assert_eq!(outcome.rescheduled, 0);

        let untouched = store.submission(future.id).await.unwrap().unwrap();
        assert_eq!(untouched.retry_count, 0);
    }
}
