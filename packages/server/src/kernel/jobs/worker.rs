//! Job worker: drives one dispatched job through its runner container.
//!
//! # Architecture
//!
//! ```text
//! conveyor hand-off channel
//!     │
//!     └─► JobWorker::run (one receiver, one task per dispatch)
//!             ├─► acquire runner (pool hit or on-demand provision)
//!             ├─► start container, stream logs through the scanner
//!             ├─► wait for exit / cancellation / execution timeout
//!             └─► report complete / fail back to the engine,
//!                 release the runner, record the outcome
//! ```
//!
//! The worker never mutates queue indexes directly; every scheduling
//! consequence of an outcome flows through the engine, and every job
//! state change goes through the store's conditional transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conveyor::Dispatch;

use crate::common::{ErrorCode, OrchestratorError};
use crate::kernel::docker::{ContainerRecord, ContainerState, DockerClient};
use crate::kernel::pools::{PoolManager, ReleaseOutcome, Runner};
use crate::kernel::scanner::{record_hit, SecretScanner};
use crate::telemetry::{EventSink, MetricsSink, OrchestratorEvent};

use super::classifier::{FailureCategory, RetryClassifier};
use super::job::{ErrorKind, Job, JobState};
use super::store::{PgJobStore, StatePatch};
use super::JobEngine;

/// Cancellation tokens for jobs currently executing, shared with the
/// intake (platform-side cancellation) and the control loop.
#[derive(Clone, Default)]
pub struct RunningJobs {
    inner: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, job_id: Uuid, token: CancellationToken) {
        self.lock().insert(job_id, token);
    }

    fn remove(&self, job_id: Uuid) {
        self.lock().remove(&job_id);
    }

    /// Request cooperative cancellation of a running job.
    pub fn request_cancel(&self, job_id: Uuid) -> bool {
        match self.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// How one execution attempt ended.
enum ExecOutcome {
    Completed,
    Failed {
        category: FailureCategory,
        detail: String,
    },
    Cancelled,
}

pub struct JobWorker {
    store: Arc<PgJobStore>,
    engine: Arc<JobEngine>,
    pools: Arc<PoolManager>,
    docker: Arc<DockerClient>,
    scanner: Arc<SecretScanner>,
    classifier: RetryClassifier,
    running: RunningJobs,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    stop_grace: Duration,
}

impl JobWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PgJobStore>,
        engine: Arc<JobEngine>,
        pools: Arc<PoolManager>,
        docker: Arc<DockerClient>,
        scanner: Arc<SecretScanner>,
        classifier: RetryClassifier,
        running: RunningJobs,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            pools,
            docker,
            scanner,
            classifier,
            running,
            events,
            metrics,
            stop_grace,
        }
    }

    /// Drain the hand-off channel until shutdown, one task per job.
    pub async fn run(
        self: Arc<Self>,
        mut dispatches: tokio::sync::mpsc::Receiver<Dispatch>,
        shutdown: CancellationToken,
    ) {
        info!("job worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                dispatch = dispatches.recv() => {
                    let Some(dispatch) = dispatch else { break };
                    let worker = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        worker.process(dispatch, shutdown).await;
                    });
                }
            }
        }

        // Let in-flight jobs wind down, bounded.
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while !self.running.is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let stranded = self.running.len();
        if stranded > 0 {
            warn!(count = stranded, "jobs still running at worker shutdown");
        }
        info!("job worker stopped");
    }

    /// Process one dispatch end to end.
    async fn process(&self, dispatch: Dispatch, shutdown: CancellationToken) {
        let job = match self.store.get(dispatch.id).await {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %dispatch.id, error = %e, "dispatched job could not be loaded");
                let _ = self
                    .engine
                    .fail(dispatch.id, true, "job_load_failed")
                    .await;
                return;
            }
        };

        let cancel = shutdown.child_token();
        self.running.register(job.id, cancel.clone());
        let started = std::time::Instant::now();

        let outcome = self.execute(&job, &cancel).await;

        match outcome {
            ExecOutcome::Completed => {
                self.metrics.counter("jobs_completed", 1, &[]);
                self.metrics.histogram(
                    "job_duration_ms",
                    started.elapsed().as_millis() as f64,
                    &[("queue", job.queue_name.clone())],
                );
                if let Err(e) = self.engine.complete(job.id).await {
                    error!(job_id = %job.id, error = %e, "failed to record completion");
                }
                self.emit_state_change(&job, JobState::Completed, None);
            }
            ExecOutcome::Failed { category, detail } => {
                let retryable = self.classifier.is_retryable(category);
                let reason = category.as_str();
                warn!(
                    job_id = %job.id,
                    category = reason,
                    retryable,
                    detail = %detail,
                    "job attempt failed"
                );
                self.metrics
                    .counter("jobs_failed", 1, &[("category", reason.to_string())]);

                self.mark_failed(&job, reason, retryable).await;
                match self.engine.fail(job.id, retryable, reason).await {
                    Ok(()) => {}
                    Err(e) => error!(job_id = %job.id, error = %e, "failed to record failure"),
                }
                self.maybe_emit_dead_letter(&job, reason).await;
            }
            ExecOutcome::Cancelled if shutdown.is_cancelled() => {
                // Interrupted by graceful shutdown, not by anyone's
                // intent: the attempt goes back to the queue.
                info!(job_id = %job.id, "job interrupted by shutdown, will retry");
                self.mark_failed_with(&job, "shutdown", ErrorKind::Shutdown).await;
                if let Err(e) = self.engine.fail(job.id, true, "shutdown").await {
                    error!(job_id = %job.id, error = %e, "failed to reschedule after shutdown");
                }
            }
            ExecOutcome::Cancelled => {
                info!(job_id = %job.id, "job cancelled");
                self.metrics.counter("jobs_cancelled", 1, &[]);
                if let Err(e) = self.engine.confirm_cancelled(job.id).await {
                    // The entry may already be gone if the cancel landed
                    // before dispatch; that is fine.
                    debug!(job_id = %job.id, error = %e, "cancel confirmation conflict");
                }
                self.emit_state_change(&job, JobState::Cancelled, Some("cancelled"));
            }
        }

        self.running.remove(job.id);
    }

    /// Drive one attempt: runner, container, logs, exit.
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> ExecOutcome {
        // 1. A runner, warm or on demand.
        let runner = match self.pools.acquire(job).await {
            Ok(Some(runner)) => runner,
            Ok(None) => match self.pools.provision_for(job).await {
                Ok(runner) => runner,
                Err(e) => {
                    // Allow-list rejections must not retry; everything
                    // else is capacity trouble.
                    let category = match e.downcast_ref::<OrchestratorError>() {
                        Some(err)
                            if matches!(
                                err.code(),
                                ErrorCode::Validation | ErrorCode::Security
                            ) =>
                        {
                            FailureCategory::CreateRejected
                        }
                        _ => FailureCategory::NoRunner,
                    };
                    return ExecOutcome::Failed {
                        category,
                        detail: e.to_string(),
                    };
                }
            },
            Err(e) => {
                return ExecOutcome::Failed {
                    category: FailureCategory::EngineUnavailable,
                    detail: e.to_string(),
                };
            }
        };

        if let Err(e) = self
            .store
            .update_state(
                job.id,
                JobState::Routed,
                JobState::Assigned,
                StatePatch::runner(runner.id),
                Some("runner_assigned"),
            )
            .await
        {
            // Most likely a cancellation race; put the runner back.
            warn!(job_id = %job.id, error = %e, "assignment transition failed");
            let _ = self.pools.release(runner.id, ReleaseOutcome::Success).await;
            return ExecOutcome::Cancelled;
        }
        self.emit_state_change(job, JobState::Assigned, Some("runner_assigned"));

        let Some(container_id) = runner.container_id.clone() else {
            let _ = self.pools.fail_runner(runner.id).await;
            return ExecOutcome::Failed {
                category: FailureCategory::StartFailed,
                detail: format!("runner {} has no container", runner.id),
            };
        };

        // 2. Start the container.
        if let Err(e) = self.docker.start(&container_id).await {
            let _ = self.pools.fail_runner(runner.id).await;
            return classify_start_error(e);
        }
        let _ = ContainerRecord::set_state(&container_id, ContainerState::Running, self.store.pool())
            .await;
        let _ = sqlx::query(
            "UPDATE container_registry SET job_id = $2, updated_at = NOW() WHERE container_id = $1",
        )
        .bind(&container_id)
        .bind(job.id)
        .execute(self.store.pool())
        .await;

        if let Err(e) = self
            .store
            .update_state(
                job.id,
                JobState::Assigned,
                JobState::Running,
                StatePatch::container(container_id.clone()),
                Some("container_started"),
            )
            .await
        {
            warn!(job_id = %job.id, error = %e, "running transition failed");
            self.teardown(&runner, &container_id, ReleaseOutcome::Failure).await;
            return ExecOutcome::Cancelled;
        }
        if let Err(e) = self.pools.mark_busy(runner.id).await {
            warn!(runner = %runner.id, error = %e, "busy transition failed");
        }
        self.emit_state_change(job, JobState::Running, Some("container_started"));
        self.events.emit(OrchestratorEvent::ContainerStarted {
            container_id: container_id.clone(),
            job_id: Some(job.id),
            image: job.resource_profile.image.clone(),
        });

        // 3. Logs through the scanner while we wait for the exit.
        let log_task = self.spawn_log_scanner(job.id, container_id.clone());

        let max_execution =
            Duration::from_millis(job.resource_profile.max_execution_ms.max(1) as u64);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.stop_container(&container_id).await;
                ExecOutcome::Cancelled
            }
            _ = tokio::time::sleep(max_execution) => {
                self.stop_container(&container_id).await;
                ExecOutcome::Failed {
                    category: FailureCategory::ExecutionTimeout,
                    detail: format!("exceeded {}ms", max_execution.as_millis()),
                }
            }
            exit = self.docker.wait_exit(&container_id) => match exit {
                Ok(0) => ExecOutcome::Completed,
                Ok(code) => self.exit_outcome(job, &container_id, code).await,
                Err(e) => ExecOutcome::Failed {
                    category: FailureCategory::EngineUnavailable,
                    detail: e.to_string(),
                },
            }
        };

        log_task.abort();
        let _ = log_task.await;

        // 4. Record the exit and give the runner back.
        let release = match &outcome {
            ExecOutcome::Completed => ReleaseOutcome::Success,
            _ => ReleaseOutcome::Failure,
        };
        self.teardown(&runner, &container_id, release).await;
        outcome
    }

    /// Classify a non-zero exit, emitting the death event.
    async fn exit_outcome(&self, job: &Job, container_id: &str, code: i64) -> ExecOutcome {
        let oom = match self.docker.exit_status(container_id).await {
            Ok((_, _, oom)) => oom,
            Err(e) => {
                debug!(container = container_id, error = %e, "exit inspection failed");
                false
            }
        };
        let _ = ContainerRecord::set_exit(container_id, code, oom, self.store.pool()).await;

        self.events.emit(OrchestratorEvent::ContainerDied {
            container_id: container_id.to_string(),
            job_id: Some(job.id),
            exit_code: code,
            oom,
        });

        let category = if oom {
            FailureCategory::OomKilled
        } else {
            FailureCategory::NonZeroExit
        };
        ExecOutcome::Failed {
            category,
            detail: format!("exit code {code}"),
        }
    }

    /// Stream container logs through a scan session, forwarding
    /// redacted bytes to the log sink and recording hits.
    fn spawn_log_scanner(
        &self,
        job_id: Uuid,
        container_id: String,
    ) -> tokio::task::JoinHandle<()> {
        let scanner = Arc::clone(&self.scanner);
        let docker = Arc::clone(&self.docker);
        let events = Arc::clone(&self.events);
        let metrics = Arc::clone(&self.metrics);
        let db = self.store.pool().clone();

        tokio::spawn(async move {
            let mut session = scanner.session();
            let mut stream = docker.logs(&container_id);

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(container = %container_id, error = %e, "log stream ended");
                        break;
                    }
                };
                let redacted = session.feed(&chunk);
                forward_logs(job_id, &redacted);

                for hit in session.take_hits() {
                    metrics.counter(
                        "secrets_detected",
                        1,
                        &[("kind", hit.kind.clone())],
                    );
                    events.emit(OrchestratorEvent::SecretDetected {
                        container_id: container_id.clone(),
                        job_id: Some(job_id),
                        pattern_kind: hit.kind.clone(),
                        severity: hit.severity,
                        byte_offset: hit.byte_offset,
                    });
                    if let Err(e) = record_hit(&db, &container_id, Some(job_id), &hit).await {
                        warn!(container = %container_id, error = %e, "failed to persist secret hit");
                    }
                }
            }

            let tail = session.finish();
            forward_logs(job_id, &tail);
        })
    }

    async fn stop_container(&self, container_id: &str) {
        if let Err(e) = self.docker.stop(container_id, self.stop_grace).await {
            debug!(container = container_id, error = %e, "stop during teardown failed");
            if let Err(e) = self.docker.remove(container_id, true).await {
                warn!(container = container_id, error = %e, "forced removal failed");
            }
        }
    }

    async fn teardown(&self, runner: &Runner, container_id: &str, release: ReleaseOutcome) {
        let _ = ContainerRecord::set_state(container_id, ContainerState::Exited, self.store.pool())
            .await;
        if let Err(e) = self.pools.release(runner.id, release).await {
            warn!(runner = %runner.id, error = %e, "runner release failed");
        }
    }

    /// Flip the job to Failed with its reason, tolerating races.
    async fn mark_failed(&self, job: &Job, reason: &str, retryable: bool) {
        let kind = if retryable {
            ErrorKind::Retryable
        } else {
            ErrorKind::NonRetryable
        };
        self.mark_failed_with(job, reason, kind).await;
    }

    async fn mark_failed_with(&self, job: &Job, reason: &str, kind: ErrorKind) {
        for from in [JobState::Running, JobState::Assigned, JobState::Routed] {
            match self
                .store
                .update_state(
                    job.id,
                    from,
                    JobState::Failed,
                    StatePatch::failure(reason, kind),
                    Some(reason),
                )
                .await
            {
                Ok(_) => {
                    self.emit_state_change(job, JobState::Failed, Some(reason));
                    return;
                }
                Err(OrchestratorError::Conflict(_)) => continue,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to mark job failed");
                    return;
                }
            }
        }
        warn!(job_id = %job.id, "job left its active band before failure marking");
    }

    /// Emit the dead-letter alert when the engine just dead-lettered.
    async fn maybe_emit_dead_letter(&self, job: &Job, reason: &str) {
        match self.store.get(job.id).await {
            Ok(current) if current.state == JobState::DeadLettered => {
                self.events.emit(OrchestratorEvent::JobDeadLettered {
                    job_id: job.id,
                    queue: current.queue_name.clone(),
                    attempts: current.attempts,
                    reason: reason.to_string(),
                });
                self.events.emit(OrchestratorEvent::AlertTriggered {
                    container_id: current.container_id.unwrap_or_default(),
                    kind: "job_dead_lettered".to_string(),
                    severity: crate::telemetry::AlertSeverity::Critical,
                    value: current.attempts as f64,
                });
            }
            Ok(_) => {}
            Err(e) => debug!(job_id = %job.id, error = %e, "dead-letter check failed"),
        }
    }

    fn emit_state_change(&self, job: &Job, to: JobState, reason: Option<&str>) {
        self.events.emit(OrchestratorEvent::JobStateChanged {
            job_id: job.id,
            from: job.state.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: reason.map(String::from),
        });
    }
}

/// Engine-call timeouts mean the engine, not the spec, is the problem.
fn classify_start_error(error: anyhow::Error) -> ExecOutcome {
    let category = if error.to_string().contains("timed out") {
        FailureCategory::EngineUnavailable
    } else {
        FailureCategory::StartFailed
    };
    ExecOutcome::Failed {
        category,
        detail: error.to_string(),
    }
}

/// The redacted log sink: structured lines on the log tap.
fn forward_logs(job_id: Uuid, redacted: &[u8]) {
    if redacted.is_empty() {
        return;
    }
    for line in redacted.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        info!(
            target: "runner_logs",
            job = %job_id,
            line = %String::from_utf8_lossy(line),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_jobs_registry_cancel() {
        let running = RunningJobs::new();
        let job_id = Uuid::new_v4();
        let token = CancellationToken::new();

        running.register(job_id, token.clone());
        assert_eq!(running.len(), 1);

        assert!(running.request_cancel(job_id));
        assert!(token.is_cancelled());

        running.remove(job_id);
        assert!(running.is_empty());
        assert!(!running.request_cancel(job_id));
    }

    #[test]
    fn log_forwarding_skips_empty_chunks() {
        // Exercises the fast path; output itself goes to tracing.
        forward_logs(Uuid::new_v4(), b"");
        forward_logs(Uuid::new_v4(), b"\n\n");
        forward_logs(Uuid::new_v4(), b"one line\nand another\n");
    }
}
