//! Orchestrator wiring: construct every component against the shared
//! dependencies, bridge the queue engine's tap onto the event sink,
//! own startup recovery, and expose the service list in dependency
//! order for the host.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conveyor::{Dispatch, Engine, EngineConfig, QueueConfig, QueueEvent, QueueTap, RetryPolicy};

use crate::config::Config;
use crate::kernel::docker::{ContainerMonitor, DockerClient, EventWatcher};
use crate::kernel::intake::Intake;
use crate::kernel::jobs::{
    JobEngine, JobState, JobWorker, PgJobStore, RetryClassifier, RunningJobs, StatePatch,
};
use crate::kernel::pools::PoolManager;
use crate::kernel::reaper::CleanupReaper;
use crate::kernel::router::Router;
use crate::kernel::scaler::AutoScaler;
use crate::kernel::scanner::SecretScanner;
use crate::kernel::service_host::{Service, ServiceHost};
use crate::telemetry::{EventSink, MetricsSink, OrchestratorEvent};

/// Bridges conveyor's tap onto the orchestrator event sink.
struct EngineTap {
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl QueueTap for EngineTap {
    fn on_event(&self, event: &QueueEvent) {
        let kind = match event {
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::Promoted { .. } => "promoted",
            QueueEvent::Dispatched { .. } => "dispatched",
            QueueEvent::HandoffTimedOut { .. } => "handoff_timed_out",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::RetryScheduled { .. } => "retry_scheduled",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::DeadLettered { .. } => "dead_lettered",
            QueueEvent::Cancelled { .. } => "cancelled",
            QueueEvent::Recovered { .. } => "recovered",
        };
        self.metrics
            .counter("queue_events", 1, &[("kind", kind.to_string())]);
        let mapped = match event {
            QueueEvent::Promoted { id, .. } => Some(("scheduled", "queued", *id, "delay_elapsed")),
            QueueEvent::Dispatched { id, .. } => Some(("queued", "routed", *id, "dispatched")),
            QueueEvent::RetryScheduled { id, .. } => {
                Some(("failed", "scheduled", *id, "retry_scheduled"))
            }
            QueueEvent::Recovered { id, .. } => Some(("running", "queued", *id, "recovered")),
            _ => None,
        };
        if let Some((from, to, job_id, reason)) = mapped {
            self.events.emit(OrchestratorEvent::JobStateChanged {
                job_id,
                from: from.to_string(),
                to: to.to_string(),
                reason: Some(reason.to_string()),
            });
        }
    }
}

/// The assembled core. One per process.
pub struct Orchestrator {
    pub config: Config,
    pub db: PgPool,
    pub store: Arc<PgJobStore>,
    pub engine: Arc<JobEngine>,
    pub router: Arc<Router>,
    pub docker: Arc<DockerClient>,
    pub pools: Arc<PoolManager>,
    pub monitor: Arc<ContainerMonitor>,
    pub watcher: Arc<EventWatcher>,
    pub scaler: Arc<AutoScaler>,
    pub reaper: Arc<CleanupReaper>,
    pub worker: Arc<JobWorker>,
    pub intake: Arc<Intake>,
    pub running: RunningJobs,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<dyn MetricsSink>,
    dispatches: Mutex<Option<tokio::sync::mpsc::Receiver<Dispatch>>>,
}

impl Orchestrator {
    /// Wire every component. No loops start here; the service host
    /// owns lifecycles.
    pub fn build(
        config: Config,
        db: PgPool,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Arc<Self>> {
        let docker = Arc::new(
            DockerClient::connect(config.docker.clone(), config.runner.clone())
                .context("container engine connection failed")?,
        );
        let store = Arc::new(PgJobStore::new(db.clone()));

        let tap = Arc::new(EngineTap {
            events: Arc::clone(&events),
            metrics: Arc::clone(&metrics),
        });
        let mut builder = Engine::builder(Arc::clone(&store), tap as Arc<dyn QueueTap>).config(
            EngineConfig {
                tick_interval: config.dispatch.tick,
                handoff_timeout: config.dispatch.handoff_timeout,
                handoff_capacity: config.dispatch.handoff_capacity,
            },
        );
        for queue in &config.queues {
            builder = builder.queue(
                QueueConfig::new(queue.name.clone())
                    .concurrency_limit(queue.concurrency_limit)
                    .retry(RetryPolicy {
                        base: queue.retry_base,
                        factor: queue.retry_factor,
                        cap: queue.retry_cap,
                        jitter_min: queue.retry_jitter_min,
                        jitter_max: queue.retry_jitter_max,
                    })
                    .dead_letter_name(queue.dead_letter_name.clone())
                    .retention_window(queue.retention_window)
                    .weight(queue.weight)
                    .maybe_rate_limit(queue.rate_limit),
            );
        }
        let (engine, dispatches) = builder.build();
        let engine = Arc::new(engine);

        let router = Arc::new(Router::new(&config.router, &config.runner));
        let pools = Arc::new(PoolManager::new(
            db.clone(),
            Arc::clone(&docker),
            config.pools.clone(),
            config.runner.clone(),
            config.docker.stop_grace,
            Arc::clone(&metrics),
        ));
        let scanner = Arc::new(SecretScanner::new(&config.scanner.extra_patterns));
        let monitor = Arc::new(ContainerMonitor::new(
            db.clone(),
            Arc::clone(&docker),
            config.monitor.clone(),
            config.cleanup.metrics_retention,
            Arc::clone(&events),
            Arc::clone(&metrics),
        ));
        let watcher = Arc::new(EventWatcher::new(
            db.clone(),
            Arc::clone(&docker),
            Arc::clone(&events),
        ));
        let scaler = Arc::new(AutoScaler::new(
            db.clone(),
            Arc::clone(&pools),
            config.scaler.clone(),
            Arc::clone(&events),
            Arc::clone(&metrics),
        ));
        let reaper = Arc::new(CleanupReaper::new(
            db.clone(),
            Arc::clone(&docker),
            Arc::clone(&store),
            Arc::clone(&pools),
            Arc::clone(&monitor),
            config.cleanup.clone(),
            Arc::clone(&metrics),
        ));

        let running = RunningJobs::new();
        let worker = Arc::new(JobWorker::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&pools),
            Arc::clone(&docker),
            Arc::clone(&scanner),
            RetryClassifier::with_overrides(&config.retry_classification),
            running.clone(),
            Arc::clone(&events),
            Arc::clone(&metrics),
            config.docker.stop_grace,
        ));
        let intake = Arc::new(Intake::new(
            config.intake.clone(),
            config.dispatch.max_attempts_default as i32,
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&router),
            running.clone(),
            Arc::clone(&events),
            Arc::clone(&metrics),
        ));

        Ok(Arc::new(Self {
            config,
            db,
            store,
            engine,
            router,
            docker,
            pools,
            monitor,
            watcher,
            scaler,
            reaper,
            worker,
            intake,
            running,
            events,
            metrics,
            dispatches: Mutex::new(Some(dispatches)),
        }))
    }

    /// Startup recovery (runs after the store is reachable, before the
    /// engine dispatches):
    ///
    /// - Failed jobs with budget left go back to Scheduled; exhausted
    ///   ones dead-letter.
    /// - The engine reloads queued/scheduled entries and requeues
    ///   anything that was in flight when the process died.
    /// - Received jobs that never made it into a queue are enqueued.
    pub async fn recover(&self) -> Result<()> {
        let grouped = self.store.recover().await?;

        if let Some(failed) = grouped.get(&JobState::Failed) {
            for job in failed {
                if job.attempts < job.max_attempts {
                    let now = chrono::Utc::now();
                    let patch = StatePatch {
                        next_attempt_at: Some(now),
                        delay_until: Some(now),
                        ..StatePatch::default()
                    };
                    if let Err(e) = self
                        .store
                        .update_state(
                            job.id,
                            JobState::Failed,
                            JobState::Scheduled,
                            patch,
                            Some("recovery_retry"),
                        )
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "recovery retry scheduling failed");
                    }
                } else {
                    let patch = StatePatch {
                        set_finished: true,
                        ..StatePatch::default()
                    };
                    if let Err(e) = self
                        .store
                        .update_state(
                            job.id,
                            JobState::Failed,
                            JobState::DeadLettered,
                            patch,
                            Some("recovery_budget_exhausted"),
                        )
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "recovery dead-letter failed");
                    }
                }
            }
        }

        let reloaded = self
            .engine
            .recover()
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let mut rerouted = 0usize;
        if let Some(received) = grouped.get(&JobState::Received) {
            for job in received {
                let entry = conveyor::Entry::new(
                    job.id,
                    job.queue_name.clone(),
                    job.priority.clamp(1, 5) as u8,
                    job.max_attempts.max(1) as u32,
                );
                match self.engine.enqueue(entry).await {
                    Ok(()) => rerouted += 1,
                    Err(e) => warn!(job_id = %job.id, error = %e, "recovery re-route failed"),
                }
            }
        }

        info!(reloaded, rerouted, "startup recovery complete");
        Ok(())
    }

    /// Build the service host with components in dependency order.
    pub fn into_host(self: &Arc<Self>) -> Result<ServiceHost> {
        let dispatches = self
            .dispatches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("service host already built")?;

        let mut host = ServiceHost::new(
            self.config.control.shutdown_timeout,
            self.config.control.auto_restart,
            Arc::clone(&self.events),
        );
        host.register(Arc::new(EngineService {
            engine: Arc::clone(&self.engine),
        }));
        host.register(Arc::new(DockerHealthService {
            docker: Arc::clone(&self.docker),
        }));
        host.register(Arc::new(WorkerService {
            worker: Arc::clone(&self.worker),
            dispatches: Mutex::new(Some(dispatches)),
        }));
        host.register(Arc::new(MonitorService {
            monitor: Arc::clone(&self.monitor),
        }));
        host.register(Arc::new(EventWatcherService {
            watcher: Arc::clone(&self.watcher),
        }));
        host.register(Arc::new(ScalerService {
            scaler: Arc::clone(&self.scaler),
        }));
        host.register(Arc::new(ReaperService {
            reaper: Arc::clone(&self.reaper),
        }));
        Ok(host)
    }
}

// -- Service adapters --

struct EngineService {
    engine: Arc<JobEngine>,
}

#[async_trait]
impl Service for EngineService {
    fn name(&self) -> &'static str {
        "queue-engine"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.engine.run(shutdown).await;
        Ok(())
    }
}

struct DockerHealthService {
    docker: Arc<DockerClient>,
}

#[async_trait]
impl Service for DockerHealthService {
    fn name(&self) -> &'static str {
        "container-engine"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

struct WorkerService {
    worker: Arc<JobWorker>,
    dispatches: Mutex<Option<tokio::sync::mpsc::Receiver<Dispatch>>>,
}

#[async_trait]
impl Service for WorkerService {
    fn name(&self) -> &'static str {
        "job-worker"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let dispatches = self
            .dispatches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("job worker restarted without its channel")?;
        Arc::clone(&self.worker).run(dispatches, shutdown).await;
        Ok(())
    }
}

struct MonitorService {
    monitor: Arc<ContainerMonitor>,
}

#[async_trait]
impl Service for MonitorService {
    fn name(&self) -> &'static str {
        "container-monitor"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.monitor.run(shutdown).await;
        Ok(())
    }
}

struct EventWatcherService {
    watcher: Arc<EventWatcher>,
}

#[async_trait]
impl Service for EventWatcherService {
    fn name(&self) -> &'static str {
        "engine-event-watcher"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.watcher.run(shutdown).await;
        Ok(())
    }
}

struct ScalerService {
    scaler: Arc<AutoScaler>,
}

#[async_trait]
impl Service for ScalerService {
    fn name(&self) -> &'static str {
        "auto-scaler"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.scaler.run(shutdown).await;
        Ok(())
    }
}

struct ReaperService {
    reaper: Arc<CleanupReaper>,
}

#[async_trait]
impl Service for ReaperService {
    fn name(&self) -> &'static str {
        "cleanup-reaper"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.reaper.run(shutdown).await;
        Ok(())
    }
}
