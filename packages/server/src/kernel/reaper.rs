//! Cleanup reaper: periodic, idempotent garbage collection.
//!
//! Each pass reaps exited containers past their TTL, archives terminal
//! jobs past retention, purges expired dedup markers and stale hit
//! rows, drops terminal runner rows, and drains pools that have seen no
//! arrivals. Every step tolerates already-deleted targets; a failed
//! step logs and retries on the next tick.

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CleanupConfig;
use crate::kernel::docker::{ContainerMonitor, ContainerRecord, DockerClient};
use crate::kernel::jobs::PgJobStore;
use crate::kernel::pools::PoolManager;
use crate::telemetry::MetricsSink;

const REAP_BATCH: i64 = 200;

pub struct CleanupReaper {
    db: PgPool,
    docker: Arc<DockerClient>,
    store: Arc<PgJobStore>,
    pools: Arc<PoolManager>,
    monitor: Arc<ContainerMonitor>,
    config: CleanupConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl CleanupReaper {
    pub fn new(
        db: PgPool,
        docker: Arc<DockerClient>,
        store: Arc<PgJobStore>,
        pools: Arc<PoolManager>,
        monitor: Arc<ContainerMonitor>,
        config: CleanupConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            db,
            docker,
            store,
            pools,
            monitor,
            config,
            metrics,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "cleanup reaper started"
        );
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.pass().await,
            }
        }
        info!("cleanup reaper stopped");
    }

    /// One full cleanup pass. Every step is independent; a failing step
    /// does not stop the others.
    pub async fn pass(&self) {
        if let Err(e) = self.reap_containers().await {
            warn!(error = %e, "container reaping failed");
        }
        if let Err(e) = self.archive_jobs().await {
            warn!(error = %e, "job archival failed");
        }
        if let Err(e) = self.purge_dedup().await {
            warn!(error = %e, "dedup purge failed");
        }
        if let Err(e) = self.purge_hits().await {
            warn!(error = %e, "secret-hit purge failed");
        }
        if let Err(e) = self.purge_runners().await {
            warn!(error = %e, "runner purge failed");
        }
        if let Err(e) = self.drain_idle_pools().await {
            warn!(error = %e, "idle pool drain failed");
        }
    }

    /// Remove exited containers older than the TTL.
    async fn reap_containers(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.container_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let expired = ContainerRecord::exited_before(cutoff, REAP_BATCH, &self.db).await?;
        let mut reaped = 0u64;

        for record in expired {
            // A second pass over an already-removed container is a no-op.
            if let Err(e) = self.docker.remove(&record.container_id, true).await {
                debug!(container = %record.container_id, error = %e, "engine remove failed (may be gone)");
            }
            ContainerRecord::delete(&record.container_id, &self.db).await?;
            self.monitor.drop_container(&record.container_id);
            reaped += 1;
        }

        if reaped > 0 {
            self.metrics.counter("reaped_containers", reaped, &[]);
            debug!(count = reaped, "reaped exited containers");
        }
        Ok(())
    }

    /// Move terminal jobs past retention to the archive.
    async fn archive_jobs(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.job_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let expired = self.store.terminal_older_than(cutoff, REAP_BATCH).await?;
        let mut archived = 0u64;
        for job_id in expired {
            if self.store.archive(job_id).await? {
                archived += 1;
            }
        }
        if archived > 0 {
            self.metrics.counter("archived_jobs", archived, &[]);
            debug!(count = archived, "archived terminal jobs");
        }
        Ok(())
    }

    /// Drop expired delivery-id markers.
    async fn purge_dedup(&self) -> anyhow::Result<()> {
        let purged = sqlx::query("DELETE FROM intake_dedup WHERE expires_at < NOW()")
            .execute(&self.db)
            .await?
            .rows_affected();
        if purged > 0 {
            debug!(count = purged, "purged expired dedup markers");
        }
        Ok(())
    }

    /// Drop secret-hit rows past metrics retention.
    async fn purge_hits(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.metrics_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let purged = sqlx::query("DELETE FROM secret_hits WHERE at < $1")
            .bind(cutoff)
            .execute(&self.db)
            .await?
            .rows_affected();
        if purged > 0 {
            debug!(count = purged, "purged stale secret hits");
        }
        Ok(())
    }

    /// Drop terminal runner rows past retention.
    async fn purge_runners(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.job_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let purged =
            crate::kernel::pools::Runner::purge_terminal_before(cutoff, &self.db).await?;
        if purged > 0 {
            debug!(count = purged, "purged terminal runner rows");
        }
        Ok(())
    }

    /// Drain pools with no arrivals inside the idle TTL.
    async fn drain_idle_pools(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.pool_idle_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        for pool_key in self.pools.pools_idle_since(cutoff) {
            let drained = self.pools.drain_pool(&pool_key).await?;
            if drained > 0 {
                self.metrics
                    .counter("drained_idle_pools", 1, &[("pool", pool_key)]);
            }
        }
        Ok(())
    }
}
