//! The intake service: one entry point per delivery.
//!
//! The pipeline is strict: signature first (nothing untrusted is parsed
//! before it), then the event-kind header, then dedup, then payload
//! parsing, then translation. Dedup and the job row commit in one
//! transaction so a crash between them cannot orphan a delivery; if the
//! process dies before the enqueue, the platform's retry finds the job
//! still in `received` and repairs the enqueue instead of dropping it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use sqlx::types::Json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use conveyor::{CancelOutcome, Entry};

use crate::common::id::db_id;
use crate::common::OrchestratorError;
use crate::config::IntakeConfig;
use crate::kernel::jobs::{Job, JobEngine, JobState, PgJobStore, RunningJobs};
use crate::kernel::router::Router;
use crate::telemetry::{EventSink, MetricsSink, OrchestratorEvent};

use super::payload::{WebhookEvent, WebhookHeaders, WebhookPayload};
use super::signature::verify_signature;

/// The HTTP-visible acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Ack {
    pub received: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl Ack {
    fn fresh() -> Self {
        Self {
            received: true,
            duplicate: false,
        }
    }

    fn duplicate() -> Self {
        Self {
            received: true,
            duplicate: true,
        }
    }
}

/// What happened to a delivery, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Created(uuid::Uuid),
    Duplicate,
    CancelRequested(uuid::Uuid),
    Dropped(&'static str),
}

/// Webhook intake. See module docs for the pipeline.
pub struct Intake {
    config: IntakeConfig,
    /// Attempt budget for jobs the platform requests.
    default_max_attempts: i32,
    store: Arc<PgJobStore>,
    engine: Arc<JobEngine>,
    router: Arc<Router>,
    running: RunningJobs,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    mismatches: Mutex<VecDeque<Instant>>,
}

impl Intake {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: IntakeConfig,
        default_max_attempts: i32,
        store: Arc<PgJobStore>,
        engine: Arc<JobEngine>,
        router: Arc<Router>,
        running: RunningJobs,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            default_max_attempts: default_max_attempts.max(1),
            store,
            engine,
            router,
            running,
            events,
            metrics,
            mismatches: Mutex::new(VecDeque::new()),
        }
    }

    /// Ingest one delivery.
    pub async fn ingest(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<(Ack, IntakeOutcome), OrchestratorError> {
        let signature = headers.signature.as_deref().unwrap_or("");
        if let Err(e) = verify_signature(&self.config.signature_secret, body, signature) {
            self.record_mismatch();
            return Err(e);
        }

        let event_kind = headers
            .event
            .as_deref()
            .ok_or_else(|| OrchestratorError::Validation("missing_event".to_string()))?;
        let delivery_id = headers
            .delivery
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| OrchestratorError::Validation("bad_payload".to_string()))?;

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|_| OrchestratorError::Validation("bad_payload".to_string()))?;

        match payload.classify(event_kind) {
            WebhookEvent::JobRequested => self.accept_job(delivery_id, &payload).await,
            WebhookEvent::JobFinished => self.finish_job(delivery_id, &payload).await,
            WebhookEvent::Ignored => {
                self.metrics.counter(
                    "intake_ignored_events",
                    1,
                    &[("kind", event_kind.to_string())],
                );
                debug!(event = event_kind, action = %payload.action, "delivery ignored");
                Ok((Ack::fresh(), IntakeOutcome::Dropped("ignored_event")))
            }
        }
    }

    async fn accept_job(
        &self,
        delivery_id: &str,
        payload: &WebhookPayload,
    ) -> Result<(Ack, IntakeOutcome), OrchestratorError> {
        let decision = self.router.route(
            &payload.repository.full_name,
            &payload.workflow_job.labels,
            payload.on_default_branch(),
        );

        let job = Job::builder()
            .id(db_id())
            .delivery_id(delivery_id.to_string())
            .repository(payload.repository.full_name.clone())
            .workflow(payload.workflow_job.name.clone())
            .platform_job_id(payload.workflow_job.id)
            .requested_labels(payload.workflow_job.labels.clone())
            .priority(decision.priority)
            .queue_name(decision.queue_name.clone())
            .resource_profile(Json(decision.profile))
            .required_labels(decision.required_labels)
            .max_attempts(self.default_max_attempts)
            .build();

        match self.record_delivery(&job).await? {
            Some(inserted) => {
                self.enqueue(&inserted).await?;
                self.metrics.counter("intake_jobs_created", 1, &[]);
                info!(
                    job_id = %inserted.id,
                    repo = %inserted.repository,
                    queue = %inserted.queue_name,
                    priority = inserted.priority,
                    "job accepted"
                );
                Ok((Ack::fresh(), IntakeOutcome::Created(inserted.id)))
            }
            None => {
                // Seen before. If the first attempt crashed between the
                // insert and the enqueue, repair it now.
                if let Some(existing) = Job::find_by_delivery_id(delivery_id, self.store.pool())
                    .await
                    .map_err(OrchestratorError::transient)?
                {
                    if existing.state == JobState::Received {
                        warn!(job_id = %existing.id, "repairing un-enqueued duplicate");
                        self.enqueue(&existing).await?;
                    }
                }
                self.metrics.counter("intake_duplicates", 1, &[]);
                Ok((Ack::duplicate(), IntakeOutcome::Duplicate))
            }
        }
    }

    /// The platform finished or cancelled the job upstream; stop ours.
    async fn finish_job(
        &self,
        _delivery_id: &str,
        payload: &WebhookPayload,
    ) -> Result<(Ack, IntakeOutcome), OrchestratorError> {
        let open = Job::find_open_by_platform_job(
            &payload.repository.full_name,
            payload.workflow_job.id,
            self.store.pool(),
        )
        .await
        .map_err(OrchestratorError::transient)?;

        let Some(job) = open else {
            return Ok((Ack::fresh(), IntakeOutcome::Dropped("no_open_job")));
        };

        match job.state {
            JobState::Received => {
                // Never enqueued; close it directly.
                self.store
                    .update_state(
                        job.id,
                        JobState::Received,
                        JobState::Cancelled,
                        crate::kernel::jobs::StatePatch {
                            set_finished: true,
                            ..Default::default()
                        },
                        Some("platform_finished"),
                    )
                    .await?;
            }
            _ => match self.engine.cancel(job.id).await {
                Ok(CancelOutcome::Removed) => {}
                Ok(CancelOutcome::InFlight) => {
                    self.running.request_cancel(job.id);
                }
                Err(e) if !e.is_transient() => {
                    debug!(job_id = %job.id, error = %e, "cancel raced with completion");
                }
                Err(e) => return Err(OrchestratorError::transient(e)),
            },
        }

        info!(job_id = %job.id, "platform finished job, cancellation requested");
        Ok((Ack::fresh(), IntakeOutcome::CancelRequested(job.id)))
    }

    /// Insert the dedup marker and the job row in one transaction.
    ///
    /// Returns `None` when the delivery id was already recorded.
    async fn record_delivery(&self, job: &Job) -> Result<Option<Job>, OrchestratorError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(OrchestratorError::transient)?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.dedup_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let marked = sqlx::query(
            r#"
            INSERT INTO intake_dedup (delivery_id, seen_at, expires_at)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (delivery_id) DO NOTHING
            "#,
        )
        .bind(&job.delivery_id)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(OrchestratorError::transient)?;

        if marked.rows_affected() == 0 {
            return Ok(None);
        }

        let inserted = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, delivery_id, repository, workflow, platform_job_id, requested_labels,
                priority, queue_name, resource_profile, required_labels,
                state, attempts, max_attempts, next_attempt_at, delay_until,
                runner_id, container_id, failure_reason, error_kind,
                enqueued_at, started_at, finished_at, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10,
                $11, $12, $13, $14, $15,
                $16, $17, $18, $19,
                $20, $21, $22, $23, $24
            )
            RETURNING
                id, delivery_id, repository, workflow, platform_job_id, requested_labels,
                priority, queue_name, resource_profile, required_labels,
                state, attempts, max_attempts, next_attempt_at, delay_until,
                runner_id, container_id, failure_reason, error_kind,
                enqueued_at, started_at, finished_at, created_at, updated_at
            "#,
        )
        .bind(job.id)
        .bind(&job.delivery_id)
        .bind(&job.repository)
        .bind(&job.workflow)
        .bind(job.platform_job_id)
        .bind(&job.requested_labels)
        .bind(job.priority)
        .bind(&job.queue_name)
        .bind(&job.resource_profile)
        .bind(&job.required_labels)
        .bind(job.state)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.next_attempt_at)
        .bind(job.delay_until)
        .bind(job.runner_id)
        .bind(&job.container_id)
        .bind(&job.failure_reason)
        .bind(job.error_kind)
        .bind(job.enqueued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(OrchestratorError::transient)?;

        tx.commit().await.map_err(OrchestratorError::transient)?;
        Ok(Some(inserted))
    }

    async fn enqueue(&self, job: &Job) -> Result<(), OrchestratorError> {
        let entry = Entry::new(
            job.id,
            job.queue_name.clone(),
            job.priority.clamp(1, 5) as u8,
            job.max_attempts.max(1) as u32,
        );
        self.engine
            .enqueue(entry)
            .await
            .map_err(|e| OrchestratorError::transient(anyhow::anyhow!(e)))?;

        self.events.emit(OrchestratorEvent::JobStateChanged {
            job_id: job.id,
            from: JobState::Received.as_str().to_string(),
            to: JobState::Queued.as_str().to_string(),
            reason: Some("enqueued".to_string()),
        });
        Ok(())
    }

    /// Track signature mismatches; a burst beyond the threshold is a
    /// security event.
    fn record_mismatch(&self) {
        self.metrics.counter("intake_signature_mismatches", 1, &[]);

        let now = Instant::now();
        let window = self.config.flood_window;
        let mut mismatches = self
            .mismatches
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        mismatches.push_back(now);
        while matches!(
            mismatches.front(),
            Some(&t) if now.duration_since(t) > window
        ) {
            mismatches.pop_front();
        }

        if mismatches.len() as u32 >= self.config.flood_threshold {
            let count = mismatches.len() as u32;
            mismatches.clear();
            drop(mismatches);
            self.events.emit(OrchestratorEvent::SignatureFlood {
                source: "webhook_intake".to_string(),
                mismatches: count,
                window_ms: window.as_millis() as u64,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_serialization_omits_false_duplicate() {
        let fresh = serde_json::to_string(&Ack::fresh()).unwrap();
        assert_eq!(fresh, r#"{"received":true}"#);

        let dup = serde_json::to_string(&Ack::duplicate()).unwrap();
        assert!(dup.contains("\"duplicate\":true"));
    }
}
