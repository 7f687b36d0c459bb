//! The durable container registry row.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Mirror of the engine-side container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "container_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Creating,
    Created,
    Running,
    Exited,
    Removing,
    Removed,
    Errored,
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Removed | ContainerState::Errored)
    }
}

/// One row per container the orchestrator created.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: String,
    pub job_id: Option<Uuid>,
    pub runner_id: Option<Uuid>,
    pub image: String,
    pub spec_hash: String,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = r#"
    container_id, job_id, runner_id, image, spec_hash,
    state, exit_code, oom_killed, created_at, updated_at
"#;

impl ContainerRecord {
    pub fn new(
        container_id: impl Into<String>,
        image: impl Into<String>,
        spec_hash: impl Into<String>,
        job_id: Option<Uuid>,
        runner_id: Option<Uuid>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            job_id,
            runner_id,
            image: image.into(),
            spec_hash: spec_hash.into(),
            state: ContainerState::Creating,
            exit_code: None,
            oom_killed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let record = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO container_registry (
                container_id, job_id, runner_id, image, spec_hash,
                state, exit_code, oom_killed, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&self.container_id)
        .bind(self.job_id)
        .bind(self.runner_id)
        .bind(&self.image)
        .bind(&self.spec_hash)
        .bind(self.state)
        .bind(self.exit_code)
        .bind(self.oom_killed)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;
        Ok(record)
    }

    pub async fn find(container_id: &str, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let record = sqlx::query_as::<_, Self>(&format!(
            "SELECT {COLUMNS} FROM container_registry WHERE container_id = $1"
        ))
        .bind(container_id)
        .fetch_optional(db)
        .await?;
        Ok(record)
    }

    pub async fn set_state(
        container_id: &str,
        state: ContainerState,
        db: &sqlx::PgPool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE container_registry SET state = $2, updated_at = NOW() WHERE container_id = $1",
        )
        .bind(container_id)
        .bind(state)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn set_exit(
        container_id: &str,
        exit_code: i64,
        oom_killed: bool,
        db: &sqlx::PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE container_registry
            SET state = 'exited', exit_code = $2, oom_killed = $3, updated_at = NOW()
            WHERE container_id = $1
            "#,
        )
        .bind(container_id)
        .bind(exit_code)
        .bind(oom_killed)
        .execute(db)
        .await?;
        Ok(())
    }

    /// All containers the monitor should sample.
    pub async fn list_live(db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let records = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {COLUMNS} FROM container_registry
            WHERE state IN ('creating', 'created', 'running', 'exited')
            ORDER BY created_at
            "#
        ))
        .fetch_all(db)
        .await?;
        Ok(records)
    }

    /// Exited containers older than `cutoff`, for the reaper.
    pub async fn exited_before(
        cutoff: DateTime<Utc>,
        limit: i64,
        db: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let records = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {COLUMNS} FROM container_registry
            WHERE state = 'exited' AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(records)
    }

    /// Drop the row once the container is gone. Idempotent.
    pub async fn delete(container_id: &str, db: &sqlx::PgPool) -> Result<bool> {
        let result = sqlx::query("DELETE FROM container_registry WHERE container_id = $1")
            .bind(container_id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_creating() {
        let record = ContainerRecord::new("abc123", "img:latest", "hash", None, None);
        assert_eq!(record.state, ContainerState::Creating);
        assert!(!record.oom_killed);
        assert!(record.exit_code.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(ContainerState::Removed.is_terminal());
        assert!(ContainerState::Errored.is_terminal());
        assert!(!ContainerState::Exited.is_terminal());
        assert!(!ContainerState::Running.is_terminal());
    }
}
