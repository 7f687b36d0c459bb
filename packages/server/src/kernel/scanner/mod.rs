//! Secret scanning for job log streams.
//!
//! Log bytes flow through a [`ScanSession`] on their way to the log
//! sink. Matches are redacted in place with an identical-length marker
//! and surface as [`SecretHit`] records; the matched bytes themselves
//! are never persisted, logged, or carried in events.

mod patterns;
mod scanner;

pub use patterns::{pattern_table, SecretPattern, MAX_PATTERN_WINDOW};
pub use scanner::{ScanSession, SecretHit, SecretScanner};

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

/// Persist a hit record (kind + location only, no matched bytes).
pub async fn record_hit(
    db: &PgPool,
    container_id: &str,
    job_id: Option<Uuid>,
    hit: &SecretHit,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO secret_hits (container_id, job_id, pattern_kind, byte_offset, severity, at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(container_id)
    .bind(job_id)
    .bind(&hit.kind)
    .bind(hit.byte_offset as i64)
    .bind(hit.severity.as_str())
    .execute(db)
    .await?;
    Ok(())
}
