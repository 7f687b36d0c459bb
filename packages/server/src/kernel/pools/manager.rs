//! The pool manager: hand-off, return, warm-up, and resize.
//!
//! Acquire is atomic per pool via the `FOR UPDATE SKIP LOCKED` claim in
//! the runner table. The manager owns runner records and container
//! teardown for its runners; desired sizes arrive from the auto-scaler
//! and are only applied here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PoolConfig, RunnerConfig};
use crate::kernel::docker::{
    ContainerRecord, ContainerSpec, ContainerState, DockerClient, LABEL_POOL,
};
use crate::kernel::jobs::{Job, ResourceProfile};
use crate::telemetry::MetricsSink;

use super::runner::{Runner, RunnerState};

/// How a runner came back from a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure,
}

/// Live counts for one pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolCounts {
    pub provisioning: usize,
    pub idle: usize,
    pub assigned: usize,
    pub busy: usize,
    pub draining: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.provisioning + self.idle + self.assigned + self.busy + self.draining
    }

    /// Runners that could take work now or soon.
    pub fn available(&self) -> usize {
        self.provisioning + self.idle
    }
}

/// Per-repository pools of warm runners.
pub struct PoolManager {
    db: PgPool,
    docker: Arc<DockerClient>,
    config: PoolConfig,
    runner_config: RunnerConfig,
    stop_grace: std::time::Duration,
    metrics: Arc<dyn MetricsSink>,
    /// Unmet acquires since the scaler last drained this map.
    demand: Mutex<HashMap<String, u64>>,
    /// Last job arrival per pool, for idle-pool draining.
    arrivals: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PoolManager {
    pub fn new(
        db: PgPool,
        docker: Arc<DockerClient>,
        config: PoolConfig,
        runner_config: RunnerConfig,
        stop_grace: std::time::Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            db,
            docker,
            config,
            runner_config,
            stop_grace,
            metrics,
            demand: Mutex::new(HashMap::new()),
            arrivals: Mutex::new(HashMap::new()),
        }
    }

    /// Hand an idle runner to a job, or record the unmet demand.
    pub async fn acquire(&self, job: &Job) -> Result<Option<Runner>> {
        let pool_key = job.pool_key();
        self.note_arrival(&pool_key);

        match Runner::claim_idle(&pool_key, job.id, &self.db).await? {
            Some(runner) => {
                debug!(runner = %runner.id, job = %job.id, pool = %pool_key, "runner acquired");
                Ok(Some(runner))
            }
            None => {
                let mut demand = self.lock_demand();
                *demand.entry(pool_key.clone()).or_insert(0) += 1;
                drop(demand);
                self.metrics
                    .counter("pool_acquire_misses", 1, &[("pool", pool_key)]);
                Ok(None)
            }
        }
    }

    /// Provision a runner on demand for a job that found the pool empty.
    pub async fn provision_for(&self, job: &Job) -> Result<Runner> {
        let profile = job.resource_profile.0.clone();
        let runner = self
            .provision(&job.repository, &profile, job.required_labels.clone())
            .await?;
        let claimed = Runner::claim_idle(&runner.pool_key, job.id, &self.db)
            .await?
            .ok_or_else(|| anyhow!("freshly provisioned runner {} was taken", runner.id))?;
        Ok(claimed)
    }

    /// Runner is now executing its job.
    pub async fn mark_busy(&self, runner_id: Uuid) -> Result<()> {
        if !Runner::set_state(runner_id, RunnerState::Assigned, RunnerState::Busy, &self.db).await? {
            return Err(anyhow!("runner {runner_id} was not assigned"));
        }
        Ok(())
    }

    /// Return a runner after its job.
    ///
    /// Ephemeral pools never reuse a runner: one job per runner, then
    /// drain and terminate. Non-ephemeral pools return successes to
    /// idle.
    pub async fn release(&self, runner_id: Uuid, outcome: ReleaseOutcome) -> Result<()> {
        let runner = Runner::find_by_id(runner_id, &self.db).await?;

        let reuse = !self.config.ephemeral && outcome == ReleaseOutcome::Success;
        if reuse {
            let from = runner.state;
            if !Runner::set_state(runner_id, from, RunnerState::Idle, &self.db).await? {
                warn!(runner = %runner_id, "release raced with another transition");
            }
            return Ok(());
        }

        // Drain: stop and remove the container, then terminate the slot.
        if !Runner::set_state(runner_id, runner.state, RunnerState::Draining, &self.db).await? {
            warn!(runner = %runner_id, "drain raced with another transition");
        }
        self.teardown_container(runner.container_id.as_deref()).await;
        Runner::set_state(runner_id, RunnerState::Draining, RunnerState::Terminated, &self.db)
            .await?;
        debug!(runner = %runner_id, pool = %runner.pool_key, "runner terminated");
        Ok(())
    }

    /// Mark a runner failed and tear its container down.
    pub async fn fail_runner(&self, runner_id: Uuid) -> Result<()> {
        let runner = Runner::find_by_id(runner_id, &self.db).await?;
        Runner::set_state(runner_id, runner.state, RunnerState::Failed, &self.db).await?;
        self.teardown_container(runner.container_id.as_deref()).await;
        Ok(())
    }

    /// Apply a desired size from the scaler. Creation and draining both
    /// happen here; the scaler never touches runner records.
    pub async fn scale(&self, pool_key: &str, desired: usize) -> Result<()> {
        let desired = desired.clamp(self.config.min, self.config.max);
        let counts = self.counts(pool_key).await?;
        let current = counts.total() - counts.draining;

        self.persist_pool_state(pool_key, desired).await?;

        if desired > current {
            let (repository, profile_name) = split_pool_key(pool_key)?;
            let profile =
                ResourceProfile::by_name(profile_name, &self.runner_config.default_image);
            for _ in 0..(desired - current) {
                if let Err(e) = self.provision(repository, &profile, Vec::new()).await {
                    warn!(pool = pool_key, error = %e, "provisioning failed");
                    break;
                }
            }
        } else if desired < current {
            let surplus = (current - desired) as i64;
            for runner in Runner::idle_in_pool(pool_key, surplus, &self.db).await? {
                self.drain_runner(&runner).await;
            }
        }
        Ok(())
    }

    /// Pre-provision `min` runners so the first job sees a warm pool.
    pub async fn warm_up(&self, pool_key: &str) -> Result<()> {
        self.scale(pool_key, self.config.min).await
    }

    /// Drain every idle runner of a pool (idle-pool reaping).
    pub async fn drain_pool(&self, pool_key: &str) -> Result<usize> {
        let idle = Runner::idle_in_pool(pool_key, i64::MAX, &self.db).await?;
        let count = idle.len();
        for runner in idle {
            self.drain_runner(&runner).await;
        }
        if count > 0 {
            info!(pool = pool_key, drained = count, "idle pool drained");
        }
        Ok(count)
    }

    pub async fn counts(&self, pool_key: &str) -> Result<PoolCounts> {
        let mut counts = PoolCounts::default();
        for (state, count) in Runner::counts_for_pool(pool_key, &self.db).await? {
            let count = count as usize;
            match state {
                RunnerState::Provisioning => counts.provisioning = count,
                RunnerState::Idle => counts.idle = count,
                RunnerState::Assigned => counts.assigned = count,
                RunnerState::Busy => counts.busy = count,
                RunnerState::Draining => counts.draining = count,
                RunnerState::Terminated | RunnerState::Failed => {}
            }
        }
        Ok(counts)
    }

    pub async fn live_pool_keys(&self) -> Result<Vec<String>> {
        Runner::live_pool_keys(&self.db).await
    }

    /// Drain and return the unmet-demand counters.
    pub fn take_demand(&self) -> HashMap<String, u64> {
        std::mem::take(&mut *self.lock_demand())
    }

    pub fn note_arrival(&self, pool_key: &str) {
        self.arrivals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pool_key.to_string(), Utc::now());
    }

    /// Pools whose last arrival is older than `cutoff`.
    pub fn pools_idle_since(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.arrivals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(pool, _)| pool.clone())
            .collect()
    }

    // -- internals --

    async fn provision(
        &self,
        repository: &str,
        profile: &ResourceProfile,
        labels: Vec<String>,
    ) -> Result<Runner> {
        let runner = Runner::provisioning(
            repository,
            &profile.name,
            labels,
            profile.cpu_shares,
            profile.memory_bytes,
            profile.gpu_count,
        )
        .insert(&self.db)
        .await?;

        let spec = ContainerSpec::for_profile(format!("runner-{}", runner.id), profile)
            .label(LABEL_POOL, runner.pool_key.clone());

        let container_id = match self.docker.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                Runner::set_state(runner.id, RunnerState::Provisioning, RunnerState::Failed, &self.db)
                    .await?;
                return Err(anyhow!(e).context("runner container creation failed"));
            }
        };

        ContainerRecord::new(&container_id, &profile.image, spec.hash(), None, Some(runner.id))
            .insert(&self.db)
            .await?;
        ContainerRecord::set_state(&container_id, ContainerState::Created, &self.db).await?;
        Runner::set_container(runner.id, &container_id, &self.db).await?;
        Runner::set_state(runner.id, RunnerState::Provisioning, RunnerState::Idle, &self.db)
            .await?;

        self.metrics
            .counter("runners_provisioned", 1, &[("pool", runner.pool_key.clone())]);
        debug!(runner = %runner.id, container = %container_id, "runner provisioned");
        Runner::find_by_id(runner.id, &self.db)
            .await
            .context("provisioned runner vanished")
    }

    async fn drain_runner(&self, runner: &Runner) {
        if !matches!(
            Runner::set_state(runner.id, RunnerState::Idle, RunnerState::Draining, &self.db).await,
            Ok(true)
        ) {
            // Someone acquired it between listing and draining; leave it.
            return;
        }
        self.teardown_container(runner.container_id.as_deref()).await;
        if let Err(e) =
            Runner::set_state(runner.id, RunnerState::Draining, RunnerState::Terminated, &self.db)
                .await
        {
            warn!(runner = %runner.id, error = %e, "failed to terminate drained runner");
        }
    }

    /// Best-effort stop + remove; cleanup retries anything left behind.
    async fn teardown_container(&self, container_id: Option<&str>) {
        let Some(container_id) = container_id else {
            return;
        };
        if let Err(e) = self.docker.stop(container_id, self.stop_grace).await {
            debug!(container = container_id, error = %e, "stop failed (may already be gone)");
        }
        if let Err(e) = self.docker.remove(container_id, true).await {
            warn!(container = container_id, error = %e, "remove failed, reaper will retry");
            return;
        }
        if let Err(e) = ContainerRecord::set_state(container_id, ContainerState::Removed, &self.db).await
        {
            warn!(container = container_id, error = %e, "failed to record container removal");
        }
    }

    async fn persist_pool_state(&self, pool_key: &str, desired: usize) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pool_state (pool_key, min_size, max_size, desired, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (pool_key) DO UPDATE SET
                desired = EXCLUDED.desired,
                min_size = EXCLUDED.min_size,
                max_size = EXCLUDED.max_size,
                updated_at = NOW()
            "#,
        )
        .bind(pool_key)
        .bind(self.config.min as i32)
        .bind(self.config.max as i32)
        .bind(desired as i32)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    fn lock_demand(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.demand.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Split `repository:profile` back into its parts.
fn split_pool_key(pool_key: &str) -> Result<(&str, &str)> {
    pool_key
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("malformed pool key '{pool_key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_counts_roll_up() {
        let counts = PoolCounts {
            provisioning: 1,
            idle: 2,
            assigned: 1,
            busy: 3,
            draining: 1,
        };
        assert_eq!(counts.total(), 8);
        assert_eq!(counts.available(), 3);
    }

    #[test]
    fn pool_key_splits_on_last_colon() {
        let (repo, profile) = split_pool_key("acme/web:default").unwrap();
        assert_eq!(repo, "acme/web");
        assert_eq!(profile, "default");

        // Repository names never contain ':'; profile names never do
        // either, so the last colon is unambiguous.
        assert!(split_pool_key("no-colon").is_err());
    }
}
