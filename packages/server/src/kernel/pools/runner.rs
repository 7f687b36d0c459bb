//! Runner model: one row per runner container slot.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::id::db_id;

/// Runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "runner_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[default]
    Provisioning,
    Idle,
    Assigned,
    Busy,
    Draining,
    Terminated,
    Failed,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Terminated | RunnerState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Provisioning => "provisioning",
            RunnerState::Idle => "idle",
            RunnerState::Assigned => "assigned",
            RunnerState::Busy => "busy",
            RunnerState::Draining => "draining",
            RunnerState::Terminated => "terminated",
            RunnerState::Failed => "failed",
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: Uuid,
    pub pool_key: String,
    pub repository: String,
    pub profile_name: String,
    pub labels: Vec<String>,
    pub state: RunnerState,
    pub current_job_id: Option<Uuid>,
    pub container_id: Option<String>,
    pub cpu_shares: i64,
    pub memory_bytes: i64,
    pub gpu_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = r#"
    id, pool_key, repository, profile_name, labels, state,
    current_job_id, container_id, cpu_shares, memory_bytes, gpu_count,
    created_at, updated_at, last_assigned_at
"#;

impl Runner {
    pub fn provisioning(
        repository: &str,
        profile_name: &str,
        labels: Vec<String>,
        cpu_shares: i64,
        memory_bytes: i64,
        gpu_count: i32,
    ) -> Self {
        Self {
            id: db_id(),
            pool_key: format!("{repository}:{profile_name}"),
            repository: repository.to_string(),
            profile_name: profile_name.to_string(),
            labels,
            state: RunnerState::Provisioning,
            current_job_id: None,
            container_id: None,
            cpu_shares,
            memory_bytes,
            gpu_count,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_assigned_at: None,
        }
    }

    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let runner = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO runner_state (
                id, pool_key, repository, profile_name, labels, state,
                current_job_id, container_id, cpu_shares, memory_bytes, gpu_count,
                created_at, updated_at, last_assigned_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.pool_key)
        .bind(&self.repository)
        .bind(&self.profile_name)
        .bind(&self.labels)
        .bind(self.state)
        .bind(self.current_job_id)
        .bind(&self.container_id)
        .bind(self.cpu_shares)
        .bind(self.memory_bytes)
        .bind(self.gpu_count)
        .bind(self.created_at)
        .bind(self.updated_at)
        .bind(self.last_assigned_at)
        .fetch_one(db)
        .await?;
        Ok(runner)
    }

    pub async fn find_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<Self> {
        let runner = sqlx::query_as::<_, Self>(&format!(
            "SELECT {COLUMNS} FROM runner_state WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(db)
        .await?;
        Ok(runner)
    }

    /// Atomically claim one idle runner from a pool.
    ///
    /// `FOR UPDATE SKIP LOCKED` guarantees two concurrent acquires
    /// never see the same idle runner.
    pub async fn claim_idle(
        pool_key: &str,
        job_id: Uuid,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let runner = sqlx::query_as::<_, Self>(&format!(
            r#"
            UPDATE runner_state SET
                state = 'assigned',
                current_job_id = $2,
                last_assigned_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM runner_state
                WHERE pool_key = $1 AND state = 'idle'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(pool_key)
        .bind(job_id)
        .fetch_optional(db)
        .await?;
        Ok(runner)
    }

    /// Conditional state flip. Returns false on a precondition miss.
    pub async fn set_state(
        id: Uuid,
        from: RunnerState,
        to: RunnerState,
        db: &sqlx::PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runner_state
            SET state = $3,
                current_job_id = CASE WHEN $4 THEN NULL ELSE current_job_id END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(matches!(to, RunnerState::Idle | RunnerState::Terminated))
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_container(id: Uuid, container_id: &str, db: &sqlx::PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE runner_state SET container_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(container_id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Counts by state for one pool.
    pub async fn counts_for_pool(
        pool_key: &str,
        db: &sqlx::PgPool,
    ) -> Result<Vec<(RunnerState, i64)>> {
        let rows = sqlx::query_as::<_, (RunnerState, i64)>(
            r#"
            SELECT state, COUNT(*) FROM runner_state
            WHERE pool_key = $1 AND state NOT IN ('terminated', 'failed')
            GROUP BY state
            "#,
        )
        .bind(pool_key)
        .fetch_all(db)
        .await?;
        Ok(rows)
    }

    /// All pool keys with at least one non-terminal runner.
    pub async fn live_pool_keys(db: &sqlx::PgPool) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT pool_key FROM runner_state
            WHERE state NOT IN ('terminated', 'failed')
            "#,
        )
        .fetch_all(db)
        .await?;
        Ok(keys)
    }

    /// Idle runners of a pool, oldest first, for scale-down.
    pub async fn idle_in_pool(
        pool_key: &str,
        limit: i64,
        db: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let runners = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {COLUMNS} FROM runner_state
            WHERE pool_key = $1 AND state = 'idle'
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(pool_key)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(runners)
    }

    /// Delete terminal runner rows older than `cutoff`. Reaper use.
    pub async fn purge_terminal_before(
        cutoff: DateTime<Utc>,
        db: &sqlx::PgPool,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM runner_state
            WHERE state IN ('terminated', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_runner_has_pool_key() {
        let runner = Runner::provisioning("acme/web", "default", vec![], 1_024, 1 << 30, 0);
        assert_eq!(runner.pool_key, "acme/web:default");
        assert_eq!(runner.state, RunnerState::Provisioning);
        assert!(runner.current_job_id.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(RunnerState::Terminated.is_terminal());
        assert!(RunnerState::Failed.is_terminal());
        assert!(!RunnerState::Draining.is_terminal());
        assert!(!RunnerState::Idle.is_terminal());
    }
}
