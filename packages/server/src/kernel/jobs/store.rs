//! PostgreSQL job store.
//!
//! `PgJobStore` is the durable source of truth for jobs. It exposes two
//! faces:
//!
//! - the orchestrator's store API (`insert`, `update_state`, `recover`,
//!   `archive`), where every state change is a short transaction that
//!   re-reads the row `FOR UPDATE`, checks the precondition, applies the
//!   patch, and appends to the `job_transitions` log;
//! - conveyor's [`QueueStore`] trait, which maps the engine's entry
//!   states onto job states so the queue engine stays SQL-free.
//!
//! Entry-state mapping: waiting = `queued`, delayed = `scheduled`,
//! active = `routed`/`assigned`/`running` (the worker advances within
//! that band), plus the terminal states one-to-one.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use conveyor::{Entry, EntryState, PersistedEntry, QueueStore};

use crate::common::OrchestratorError;
use super::job::{ErrorKind, Job, JobState};

/// Optional field updates applied together with a state change.
#[derive(Debug, Default, Clone)]
pub struct StatePatch {
    pub attempts: Option<i32>,
    pub runner_id: Option<Uuid>,
    pub container_id: Option<String>,
    pub failure_reason: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
    /// Clear `next_attempt_at`, `delay_until`, `runner_id`, and
    /// `container_id` (requeue).
    pub clear_linkage: bool,
    pub set_started: bool,
    pub set_finished: bool,
}

impl StatePatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn runner(runner_id: Uuid) -> Self {
        Self {
            runner_id: Some(runner_id),
            ..Self::default()
        }
    }

    pub fn container(container_id: impl Into<String>) -> Self {
        Self {
            container_id: Some(container_id.into()),
            set_started: true,
            ..Self::default()
        }
    }

    pub fn failure(reason: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            error_kind: Some(kind),
            ..Self::default()
        }
    }
}

/// Durable job persistence on Postgres.
pub struct PgJobStore {
    db: PgPool,
}

impl PgJobStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }

    pub async fn insert(&self, job: &Job) -> Result<Job, OrchestratorError> {
        let inserted = job
            .insert(&self.db)
            .await
            .map_err(OrchestratorError::transient)?;
        debug!(job_id = %inserted.id, repo = %inserted.repository, "job inserted");
        Ok(inserted)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        Job::find_by_id(job_id, &self.db)
            .await
            .map_err(OrchestratorError::transient)
    }

    pub async fn list_by_states(
        &self,
        states: &[JobState],
        limit: i64,
    ) -> Result<Vec<Job>, OrchestratorError> {
        Job::list_by_states(states, limit, &self.db)
            .await
            .map_err(OrchestratorError::transient)
    }

    /// Conditionally transition a job, appending to the transition log.
    ///
    /// Fails with `Conflict` when the stored state is not `from` or the
    /// transition is not in the allowed graph.
    pub async fn update_state(
        &self,
        job_id: Uuid,
        from: JobState,
        to: JobState,
        patch: StatePatch,
        reason: Option<&str>,
    ) -> Result<Job, OrchestratorError> {
        if !from.can_transition(to) {
            return Err(OrchestratorError::Conflict(format!(
                "illegal transition {} -> {} for job {job_id}",
                from.as_str(),
                to.as_str()
            )));
        }

        let mut tx = self
            .db
            .begin()
            .await
            .map_err(OrchestratorError::transient)?;

        let current = lock_state(&mut tx, job_id)
            .await
            .map_err(OrchestratorError::transient)?;
        if current != from {
            return Err(OrchestratorError::Conflict(format!(
                "job {job_id} is {}, expected {}",
                current.as_str(),
                from.as_str()
            )));
        }

        let job = apply_patch(&mut tx, job_id, to, &patch)
            .await
            .map_err(OrchestratorError::transient)?;
        append_transition(&mut tx, job_id, from, to, reason)
            .await
            .map_err(OrchestratorError::transient)?;

        tx.commit().await.map_err(OrchestratorError::transient)?;
        Ok(job)
    }

    /// All non-terminal jobs grouped by state, for startup recovery.
    ///
    /// Supplies data only; re-enqueueing is the control loop's call.
    pub async fn recover(&self) -> Result<HashMap<JobState, Vec<Job>>, OrchestratorError> {
        let open = Job::list_by_states(
            &[
                JobState::Received,
                JobState::Queued,
                JobState::Scheduled,
                JobState::Routed,
                JobState::Assigned,
                JobState::Running,
                JobState::Failed,
            ],
            i64::MAX,
            &self.db,
        )
        .await
        .map_err(OrchestratorError::transient)?;

        let mut grouped: HashMap<JobState, Vec<Job>> = HashMap::new();
        for job in open {
            grouped.entry(job.state).or_default().push(job);
        }
        info!(
            states = grouped.len(),
            total = grouped.values().map(Vec::len).sum::<usize>(),
            "recovered non-terminal jobs"
        );
        Ok(grouped)
    }

    /// Move a terminal job to the archive. Idempotent: archiving an
    /// already-archived or missing job is a no-op.
    pub async fn archive(&self, job_id: Uuid) -> Result<bool, OrchestratorError> {
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(OrchestratorError::transient)?;

        let archived = sqlx::query(
            r#"
            INSERT INTO archive_jobs (
                job_id, repository, workflow, queue_name, final_state,
                attempts, enqueued_at, finished_at, archived_at
            )
            SELECT id, repository, workflow, queue_name, state,
                   attempts, enqueued_at, finished_at, NOW()
            FROM jobs
            WHERE id = $1 AND state IN ('completed', 'dead_lettered', 'cancelled')
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(OrchestratorError::transient)?;

        sqlx::query("DELETE FROM job_transitions WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(OrchestratorError::transient)?;
        let deleted = sqlx::query(
            "DELETE FROM jobs WHERE id = $1 AND state IN ('completed', 'dead_lettered', 'cancelled')",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(OrchestratorError::transient)?;

        tx.commit().await.map_err(OrchestratorError::transient)?;
        Ok(archived.rows_affected() > 0 || deleted.rows_affected() > 0)
    }

    /// Terminal jobs older than `cutoff`, for the reaper.
    pub async fn terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, OrchestratorError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM jobs
            WHERE state IN ('completed', 'dead_lettered', 'cancelled')
              AND finished_at IS NOT NULL
              AND finished_at < $1
            ORDER BY finished_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(OrchestratorError::transient)?;
        Ok(ids)
    }
}

async fn lock_state(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<JobState> {
    let state = sqlx::query_scalar::<_, JobState>(
        "SELECT state FROM jobs WHERE id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| anyhow!("job {job_id} not found"))?;
    Ok(state)
}

async fn apply_patch(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    to: JobState,
    patch: &StatePatch,
) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs SET
            state = $2,
            attempts = COALESCE($3, attempts),
            runner_id = CASE WHEN $9 THEN NULL ELSE COALESCE($4, runner_id) END,
            container_id = CASE WHEN $9 THEN NULL ELSE COALESCE($5, container_id) END,
            failure_reason = COALESCE($6, failure_reason),
            error_kind = COALESCE($7, error_kind),
            next_attempt_at = CASE WHEN $9 THEN NULL ELSE COALESCE($12, next_attempt_at) END,
            delay_until = CASE WHEN $9 THEN NULL ELSE COALESCE($8, delay_until) END,
            started_at = CASE WHEN $10 THEN NOW() ELSE started_at END,
            finished_at = CASE WHEN $11 THEN NOW() ELSE finished_at END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING
            id, delivery_id, repository, workflow, platform_job_id, requested_labels,
            priority, queue_name, resource_profile, required_labels,
            state, attempts, max_attempts, next_attempt_at, delay_until,
            runner_id, container_id, failure_reason, error_kind,
            enqueued_at, started_at, finished_at, created_at, updated_at
        "#,
    )
    .bind(job_id)
    .bind(to)
    .bind(patch.attempts)
    .bind(patch.runner_id)
    .bind(&patch.container_id)
    .bind(&patch.failure_reason)
    .bind(patch.error_kind)
    .bind(patch.delay_until)
    .bind(patch.clear_linkage)
    .bind(patch.set_started)
    .bind(patch.set_finished)
    .bind(patch.next_attempt_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(job)
}

async fn append_transition(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    from: JobState,
    to: JobState,
    reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job_transitions (job_id, at, from_state, to_state, reason)
        VALUES ($1, NOW(), $2, $3, $4)
        "#,
    )
    .bind(job_id)
    .bind(from)
    .bind(to)
    .bind(reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============================================================================
// Conveyor QueueStore bridge
// ============================================================================

fn active_states() -> &'static [JobState] {
    &[JobState::Routed, JobState::Assigned, JobState::Running]
}

fn entry_to_job_state(state: EntryState) -> JobState {
    match state {
        EntryState::Waiting => JobState::Queued,
        EntryState::Delayed => JobState::Scheduled,
        EntryState::Active => JobState::Running,
        EntryState::Completed => JobState::Completed,
        EntryState::Failed => JobState::Failed,
        EntryState::DeadLettered => JobState::DeadLettered,
        EntryState::Cancelled => JobState::Cancelled,
    }
}

fn job_to_entry_state(state: JobState) -> Option<EntryState> {
    match state {
        JobState::Queued => Some(EntryState::Waiting),
        JobState::Scheduled => Some(EntryState::Delayed),
        JobState::Routed | JobState::Assigned | JobState::Running => Some(EntryState::Active),
        _ => None,
    }
}

/// One conditional transition inside the engine's state-mapping rules.
///
/// `from` names a band of job states (active spans routed through
/// running); the transition row records the actual state found.
async fn transition_within(
    db: &PgPool,
    job_id: Uuid,
    from: &[JobState],
    to: JobState,
    patch: StatePatch,
    reason: &str,
) -> Result<()> {
    let mut tx = db.begin().await?;

    let current = lock_state(&mut tx, job_id).await?;
    if !from.contains(&current) {
        bail!(
            "transition conflict for job {job_id}: stored {}, expected one of {:?}",
            current.as_str(),
            from.iter().map(|s| s.as_str()).collect::<Vec<_>>()
        );
    }

    apply_patch(&mut tx, job_id, to, &patch).await?;
    append_transition(&mut tx, job_id, current, to, Some(reason)).await?;

    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl QueueStore for PgJobStore {
    async fn persist_enqueued(&self, entry: &Entry) -> Result<()> {
        let to = match entry.state {
            EntryState::Delayed => JobState::Scheduled,
            _ => JobState::Queued,
        };
        transition_within(
            &self.db,
            entry.id,
            &[JobState::Received],
            to,
            StatePatch {
                delay_until: entry.delay_until,
                ..StatePatch::default()
            },
            "enqueued",
        )
        .await
    }

    async fn persist_transition(
        &self,
        id: Uuid,
        from: EntryState,
        to: EntryState,
        reason: &str,
    ) -> Result<()> {
        let from_states: Vec<JobState> = match from {
            EntryState::Active => active_states().to_vec(),
            other => vec![entry_to_job_state(other)],
        };
        let to_state = entry_to_job_state(to);
        let patch = StatePatch {
            set_finished: to_state.is_terminal(),
            clear_linkage: to == EntryState::Waiting,
            ..StatePatch::default()
        };
        transition_within(&self.db, id, &from_states, to_state, patch, reason).await
    }

    async fn persist_dispatch(&self, id: Uuid, attempts: u32) -> Result<()> {
        transition_within(
            &self.db,
            id,
            &[JobState::Queued],
            JobState::Routed,
            StatePatch {
                attempts: Some(attempts as i32),
                ..StatePatch::default()
            },
            "dispatched",
        )
        .await
    }

    async fn persist_requeue(&self, id: Uuid, attempts: u32, reason: &str) -> Result<()> {
        transition_within(
            &self.db,
            id,
            active_states(),
            JobState::Queued,
            StatePatch {
                attempts: Some(attempts as i32),
                clear_linkage: true,
                ..StatePatch::default()
            },
            reason,
        )
        .await
    }

    async fn persist_retry(
        &self,
        id: Uuid,
        attempts: u32,
        delay_until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        transition_within(
            &self.db,
            id,
            &[JobState::Failed],
            JobState::Scheduled,
            StatePatch {
                attempts: Some(attempts as i32),
                next_attempt_at: Some(delay_until),
                delay_until: Some(delay_until),
                ..StatePatch::default()
            },
            reason,
        )
        .await
    }

    async fn persist_dead_letter(
        &self,
        id: Uuid,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let current = lock_state(&mut tx, id).await?;
        if current != JobState::Failed {
            bail!(
                "dead-letter conflict for job {id}: stored {}, expected failed",
                current.as_str()
            );
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead_lettered',
                queue_name = $2,
                failure_reason = $3,
                next_attempt_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(dead_letter_queue)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        append_transition(&mut tx, id, current, JobState::DeadLettered, Some(reason)).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_open(&self) -> Result<Vec<PersistedEntry>> {
        let jobs = Job::list_by_states(
            &[
                JobState::Queued,
                JobState::Scheduled,
                JobState::Routed,
                JobState::Assigned,
                JobState::Running,
            ],
            i64::MAX,
            &self.db,
        )
        .await?;

        Ok(jobs
            .into_iter()
            .filter_map(|job| {
                let state = job_to_entry_state(job.state)?;
                Some(PersistedEntry {
                    entry: Entry {
                        id: job.id,
                        queue: job.queue_name.clone(),
                        priority: job.priority.clamp(1, 5) as u8,
                        enqueued_at: job.enqueued_at,
                        delay_until: job.delay_until,
                        attempts: job.attempts.max(0) as u32,
                        max_attempts: job.max_attempts.max(1) as u32,
                        state,
                    },
                    updated_at: job.updated_at,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_states_round_trip_where_defined() {
        for entry_state in [EntryState::Waiting, EntryState::Delayed] {
            let job_state = entry_to_job_state(entry_state);
            assert_eq!(job_to_entry_state(job_state), Some(entry_state));
        }
    }

    #[test]
    fn active_band_covers_worker_progress() {
        for state in [JobState::Routed, JobState::Assigned, JobState::Running] {
            assert_eq!(job_to_entry_state(state), Some(EntryState::Active));
        }
    }

    #[test]
    fn terminal_job_states_do_not_map_to_entries() {
        for state in [
            JobState::Received,
            JobState::Completed,
            JobState::Failed,
            JobState::DeadLettered,
            JobState::Cancelled,
        ] {
            assert_eq!(job_to_entry_state(state), None);
        }
    }

    #[test]
    fn failure_patch_carries_reason_and_kind() {
        let patch = StatePatch::failure("container_oom", ErrorKind::Retryable);
        assert_eq!(patch.failure_reason.as_deref(), Some("container_oom"));
        assert_eq!(patch.error_kind, Some(ErrorKind::Retryable));
        assert!(patch.next_attempt_at.is_none());
        assert!(!patch.clear_linkage);
    }
}
