//! Job model: one row per CI job, plus its state machine.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::id::db_id;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle of a job. Transitions only along [`JobState::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Received,
    Queued,
    Scheduled,
    Routed,
    Assigned,
    Running,
    Completed,
    Failed,
    DeadLettered,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::DeadLettered
                | JobState::Cancelled
        )
    }

    /// Whether a transition to `to` is allowed from this state.
    ///
    /// Provisioning can fail before the runner process ever starts, so
    /// Routed and Assigned may fail directly; recovery may send any
    /// in-flight state back to Queued with attempts unchanged.
    pub fn can_transition(&self, to: JobState) -> bool {
        use JobState::*;
        if !self.is_terminal() && !matches!(self, Failed) && to == Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (Received, Queued)
                | (Received, Scheduled)
                | (Queued, Scheduled)
                | (Queued, Routed)
                | (Scheduled, Queued)
                | (Routed, Assigned)
                | (Routed, Failed)
                | (Routed, Queued)
                | (Assigned, Running)
                | (Assigned, Failed)
                | (Assigned, Queued)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Failed, Scheduled)
                | (Failed, DeadLettered)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Received => "received",
            JobState::Queued => "queued",
            JobState::Scheduled => "scheduled",
            JobState::Routed => "routed",
            JobState::Assigned => "assigned",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Failure classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Job was cancelled by user/system
    Cancelled,
    /// Job was interrupted by graceful shutdown - will retry
    Shutdown,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Shutdown)
    }
}

// ============================================================================
// Resource profile
// ============================================================================

/// A named bundle of container resource settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub name: String,
    pub cpu_shares: i64,
    pub memory_bytes: i64,
    /// Number of GPUs to reserve; 0 for none.
    pub gpu_count: i32,
    pub image: String,
    pub max_execution_ms: i64,
    pub read_only_rootfs: bool,
}

impl ResourceProfile {
    pub fn default_profile(image: &str) -> Self {
        Self {
            name: "default".to_string(),
            cpu_shares: 1_024,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            gpu_count: 0,
            image: image.to_string(),
            max_execution_ms: 60 * 60 * 1_000,
            read_only_rootfs: false,
        }
    }

    pub fn high_memory(image: &str) -> Self {
        Self {
            name: "high-memory".to_string(),
            cpu_shares: 2_048,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            ..Self::default_profile(image)
        }
    }

    pub fn gpu(image: &str) -> Self {
        Self {
            name: "gpu".to_string(),
            cpu_shares: 4_096,
            memory_bytes: 16 * 1024 * 1024 * 1024,
            gpu_count: 1,
            ..Self::default_profile(image)
        }
    }

    /// Look a profile up by name, falling back to the default.
    pub fn by_name(name: &str, image: &str) -> Self {
        match name {
            "gpu" => Self::gpu(image),
            "high-memory" => Self::high_memory(image),
            _ => Self::default_profile(image),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = db_id())]
    pub id: Uuid,

    // Intake identity
    pub delivery_id: String,
    pub repository: String,
    pub workflow: String,
    /// The platform's workflow-job id, used to correlate later events
    /// (completion, cancellation) for the same job.
    #[builder(default = 0)]
    pub platform_job_id: i64,
    #[builder(default)]
    pub requested_labels: Vec<String>,

    // Routing result
    #[builder(default = 3)]
    pub priority: i16,
    #[builder(default = "default".to_string())]
    pub queue_name: String,
    pub resource_profile: Json<ResourceProfile>,
    #[builder(default)]
    pub required_labels: Vec<String>,

    // Lifecycle
    #[builder(default)]
    pub state: JobState,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    /// When the next dispatch attempt may happen; set when a retry is
    /// scheduled, cleared when the job returns to the queue.
    #[builder(default, setter(strip_option))]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub delay_until: Option<DateTime<Utc>>,

    // Linkage
    #[builder(default, setter(strip_option))]
    pub runner_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub container_id: Option<String>,

    // Failure tracking
    #[builder(default, setter(strip_option))]
    pub failure_reason: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub enqueued_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// One appended row per state change.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobTransition {
    pub id: i64,
    pub job_id: Uuid,
    pub at: DateTime<Utc>,
    pub from_state: JobState,
    pub to_state: JobState,
    pub reason: Option<String>,
}

const JOB_COLUMNS: &str = r#"
    id, delivery_id, repository, workflow, platform_job_id, requested_labels,
    priority, queue_name, resource_profile, required_labels,
    state, attempts, max_attempts, next_attempt_at, delay_until,
    runner_id, container_id, failure_reason, error_kind,
    enqueued_at, started_at, finished_at, created_at, updated_at
"#;

impl Job {
    /// The pool this job draws runners from.
    pub fn pool_key(&self) -> String {
        format!("{}:{}", self.repository, self.resource_profile.name)
    }

    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
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
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.delivery_id)
        .bind(&self.repository)
        .bind(&self.workflow)
        .bind(self.platform_job_id)
        .bind(&self.requested_labels)
        .bind(self.priority)
        .bind(&self.queue_name)
        .bind(&self.resource_profile)
        .bind(&self.required_labels)
        .bind(self.state)
        .bind(self.attempts)
        .bind(self.max_attempts)
        .bind(self.next_attempt_at)
        .bind(self.delay_until)
        .bind(self.runner_id)
        .bind(&self.container_id)
        .bind(&self.failure_reason)
        .bind(self.error_kind)
        .bind(self.enqueued_at)
        .bind(self.started_at)
        .bind(self.finished_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    pub async fn find_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    pub async fn find_by_delivery_id(delivery_id: &str, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE delivery_id = $1 LIMIT 1"
        ))
        .bind(delivery_id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// The open job for a platform workflow-job id, if any.
    pub async fn find_open_by_platform_job(
        repository: &str,
        platform_job_id: i64,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE repository = $1
              AND platform_job_id = $2
              AND state NOT IN ('completed', 'dead_lettered', 'cancelled')
            LIMIT 1
            "#
        ))
        .bind(repository)
        .bind(platform_job_id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    pub async fn list_by_states(
        states: &[JobState],
        limit: i64,
        db: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE state = ANY($1)
            ORDER BY priority, enqueued_at, id
            LIMIT $2
            "#
        ))
        .bind(states)
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    /// Jobs waiting for dispatch, counted per pool key.
    pub async fn waiting_by_pool(db: &sqlx::PgPool) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT repository, resource_profile->>'name', COUNT(*)
            FROM jobs
            WHERE state IN ('queued', 'scheduled')
            GROUP BY 1, 2
            "#,
        )
        .fetch_all(db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(repo, profile, count)| (format!("{repo}:{profile}"), count))
            .collect())
    }

    /// Jobs arriving per pool key since `since`, for the scaler forecast.
    pub async fn arrivals_by_pool_since(
        since: DateTime<Utc>,
        db: &sqlx::PgPool,
    ) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT repository, resource_profile->>'name', COUNT(*)
            FROM jobs
            WHERE created_at >= $1
            GROUP BY 1, 2
            "#,
        )
        .bind(since)
        .fetch_all(db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(repo, profile, count)| (format!("{repo}:{profile}"), count))
            .collect())
    }

    /// Transition log for a job, oldest first.
    pub async fn transitions(job_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<JobTransition>> {
        let rows = sqlx::query_as::<_, JobTransition>(
            r#"
            SELECT id, job_id, at, from_state, to_state, reason
            FROM job_transitions
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(db)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .delivery_id("d1")
            .repository("acme/web")
            .workflow("ci")
            .resource_profile(Json(ResourceProfile::default_profile("img:latest")))
            .build()
    }

    #[test]
    fn new_job_starts_received_with_defaults() {
        let job = sample_job();
        assert_eq!(job.state, JobState::Received);
        assert_eq!(job.priority, 3);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.next_attempt_at.is_none());
        assert!(job.delay_until.is_none());
        assert_eq!(job.queue_name, "default");
    }

    #[test]
    fn pool_key_combines_repo_and_profile() {
        let job = sample_job();
        assert_eq!(job.pool_key(), "acme/web:default");
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use JobState::*;
        let path = [Received, Queued, Routed, Assigned, Running, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn retry_loop_transitions_are_legal() {
        use JobState::*;
        assert!(Running.can_transition(Failed));
        assert!(Failed.can_transition(Scheduled));
        assert!(Scheduled.can_transition(Queued));
        assert!(Failed.can_transition(DeadLettered));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        use JobState::*;
        for terminal in [Completed, DeadLettered, Cancelled] {
            for to in [
                Received, Queued, Scheduled, Routed, Assigned, Running, Completed, Failed,
                DeadLettered, Cancelled,
            ] {
                assert!(!terminal.can_transition(to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn any_non_terminal_may_cancel_except_failed() {
        use JobState::*;
        for from in [Received, Queued, Scheduled, Routed, Assigned, Running] {
            assert!(from.can_transition(Cancelled), "{from:?} -> Cancelled");
        }
        // A failed job resolves through retry or dead-letter instead.
        assert!(!Failed.can_transition(Cancelled));
    }

    #[test]
    fn illegal_shortcuts_are_rejected() {
        use JobState::*;
        assert!(!Received.can_transition(Running));
        assert!(!Queued.can_transition(Completed));
        assert!(!Completed.can_transition(Queued));
        assert!(!DeadLettered.can_transition(Scheduled));
    }

    #[test]
    fn shutdown_failures_retry() {
        assert!(ErrorKind::Shutdown.should_retry());
        assert!(ErrorKind::Retryable.should_retry());
        assert!(!ErrorKind::NonRetryable.should_retry());
        assert!(!ErrorKind::Cancelled.should_retry());
    }

    #[test]
    fn gpu_profile_reserves_a_gpu() {
        let profile = ResourceProfile::gpu("img");
        assert_eq!(profile.gpu_count, 1);
        assert!(profile.memory_bytes > ResourceProfile::default_profile("img").memory_bytes);
    }
}
