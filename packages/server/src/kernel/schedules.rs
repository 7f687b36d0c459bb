//! Recurring job schedules.
//!
//! A `schedules` row is a cron template; each cron boundary emits one
//! concrete Job. The emitted job's delivery id is derived from
//! `(template, boundary)` so re-emissions after a restart collapse onto
//! the jobs table's delivery-id uniqueness instead of double-running.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use conveyor::Entry;

use crate::common::id::db_id;
use crate::kernel::jobs::{Job, JobEngine, PgJobStore, ResourceProfile};

/// One cron template.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub repository: String,
    pub workflow: String,
    pub queue_name: String,
    pub priority: i16,
    pub profile_name: String,
    pub labels: Vec<String>,
    /// 0 inherits the server-wide attempt budget.
    pub max_attempts: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduleRecord {
    pub async fn list_enabled(db: &PgPool) -> Result<Vec<Self>> {
        let schedules = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, cron_expression, repository, workflow, queue_name,
                   priority, profile_name, labels, max_attempts, enabled, created_at
            FROM schedules
            WHERE enabled = true
            ORDER BY name
            "#,
        )
        .fetch_all(db)
        .await?;
        Ok(schedules)
    }
}

/// Idempotency key for one emission: the cron boundary truncated to the
/// minute, so retries and restart double-fires collide.
pub fn emission_key(template_id: Uuid, at: DateTime<Utc>) -> String {
    let boundary = at
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at);
    format!("schedule:{template_id}:{}", boundary.timestamp())
}

/// A template's attempt budget; zero or negative inherits the server
/// default.
fn effective_max_attempts(template: i32, default_max_attempts: i32) -> i32 {
    if template > 0 {
        template
    } else {
        default_max_attempts.max(1)
    }
}

/// Start cron jobs for every enabled schedule.
pub async fn start_scheduler(
    db: PgPool,
    store: Arc<PgJobStore>,
    engine: Arc<JobEngine>,
    default_image: String,
    default_max_attempts: i32,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let schedules = ScheduleRecord::list_enabled(&db).await?;
    let count = schedules.len();

    for schedule in schedules {
        let store = Arc::clone(&store);
        let engine = Arc::clone(&engine);
        let image = default_image.clone();
        let cron = schedule.cron_expression.clone();
        let cron_job = CronJob::new_async(cron.as_str(), move |_uuid, _lock| {
            let store = Arc::clone(&store);
            let engine = Arc::clone(&engine);
            let schedule = schedule.clone();
            let image = image.clone();
            Box::pin(async move {
                if let Err(e) =
                    emit_scheduled_job(&store, &engine, &schedule, &image, default_max_attempts)
                        .await
                {
                    tracing::error!(
                        schedule = %schedule.name,
                        error = %e,
                        "scheduled emission failed"
                    );
                }
            })
        })?;
        scheduler.add(cron_job).await?;
    }

    scheduler.start().await?;
    info!(schedules = count, "cron schedules started");
    Ok(scheduler)
}

/// Emit one concrete job for a cron boundary. Safe to call twice for
/// the same boundary: the second insert is suppressed.
pub async fn emit_scheduled_job(
    store: &PgJobStore,
    engine: &JobEngine,
    schedule: &ScheduleRecord,
    default_image: &str,
    default_max_attempts: i32,
) -> Result<()> {
    let delivery_id = emission_key(schedule.id, Utc::now());
    let profile = ResourceProfile::by_name(&schedule.profile_name, default_image);

    let job = Job::builder()
        .id(db_id())
        .delivery_id(delivery_id.clone())
        .repository(schedule.repository.clone())
        .workflow(schedule.workflow.clone())
        .requested_labels(schedule.labels.clone())
        .priority(schedule.priority)
        .queue_name(schedule.queue_name.clone())
        .resource_profile(Json(profile))
        .max_attempts(effective_max_attempts(
            schedule.max_attempts,
            default_max_attempts,
        ))
        .build();

    // Uniqueness on delivery_id swallows boundary duplicates.
    let inserted = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO jobs (
            id, delivery_id, repository, workflow, platform_job_id, requested_labels,
            priority, queue_name, resource_profile, required_labels,
            state, attempts, max_attempts, next_attempt_at, delay_until,
            runner_id, container_id, failure_reason, error_kind,
            enqueued_at, started_at, finished_at, created_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4, 0, $5,
            $6, $7, $8, $9,
            'received', 0, $10, NULL, NULL,
            NULL, NULL, NULL, NULL,
            NOW(), NULL, NULL, NOW(), NOW()
        )
        ON CONFLICT (delivery_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(job.id)
    .bind(&job.delivery_id)
    .bind(&job.repository)
    .bind(&job.workflow)
    .bind(&job.requested_labels)
    .bind(job.priority)
    .bind(&job.queue_name)
    .bind(&job.resource_profile)
    .bind(&job.required_labels)
    .bind(job.max_attempts)
    .fetch_optional(store.pool())
    .await?;

    match inserted {
        Some(job_id) => {
            let entry = Entry::new(
                job_id,
                job.queue_name.clone(),
                job.priority.clamp(1, 5) as u8,
                job.max_attempts.max(1) as u32,
            );
            engine
                .enqueue(entry)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            info!(schedule = %schedule.name, job_id = %job_id, "scheduled job emitted");
        }
        None => {
            warn!(schedule = %schedule.name, key = %delivery_id, "boundary already emitted");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn emission_key_truncates_to_the_minute() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 59).unwrap();
        assert_eq!(emission_key(id, a), emission_key(id, b));
    }

    #[test]
    fn emission_keys_differ_across_boundaries() {
        let id = Uuid::new_v4();
        let a = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 6, 1, 12, 31, 0).unwrap();
        assert_ne!(emission_key(id, a), emission_key(id, b));
    }

    #[test]
    fn emission_keys_differ_across_templates() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        assert_ne!(
            emission_key(Uuid::new_v4(), at),
            emission_key(Uuid::new_v4(), at)
        );
    }

    #[test]
    fn template_attempt_budget_wins_when_set() {
        assert_eq!(effective_max_attempts(5, 3), 5);
        assert_eq!(effective_max_attempts(1, 3), 1);
    }

    #[test]
    fn unset_template_budget_inherits_the_default() {
        assert_eq!(effective_max_attempts(0, 3), 3);
        assert_eq!(effective_max_attempts(-1, 4), 4);
        // A nonsense default still leaves one attempt.
        assert_eq!(effective_max_attempts(0, 0), 1);
    }
}
