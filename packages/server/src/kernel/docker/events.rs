//! Engine event watcher.
//!
//! Subscribes to the engine's container events, filtered to the
//! orchestrator's label set, and mirrors them into the container
//! registry. This catches state changes the worker did not drive
//! itself: out-of-band kills, engine restarts, OOM deaths. Events
//! arrive per container in engine order; the stream is re-opened with
//! backoff when the engine drops it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::telemetry::{EventSink, OrchestratorEvent};

use super::client::{DockerClient, EngineEvent};
use super::container::{ContainerRecord, ContainerState};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

pub struct EventWatcher {
    db: PgPool,
    client: Arc<DockerClient>,
    events: Arc<dyn EventSink>,
}

impl EventWatcher {
    pub fn new(db: PgPool, client: Arc<DockerClient>, events: Arc<dyn EventSink>) -> Self {
        Self { db, client, events }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!("engine event watcher started");
        loop {
            let mut stream = self.client.events();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("engine event watcher stopped");
                        return;
                    }
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.handle(event).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "engine event stream error");
                            break;
                        }
                        None => {
                            warn!("engine event stream closed");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    async fn handle(&self, event: EngineEvent) {
        debug!(container = %event.container_id, action = %event.action, "engine event");
        match event.action.as_str() {
            "start" => {
                if let Err(e) = ContainerRecord::set_state(
                    &event.container_id,
                    ContainerState::Running,
                    &self.db,
                )
                .await
                {
                    warn!(container = %event.container_id, error = %e, "failed to mirror start");
                }
            }
            "die" => self.handle_death(&event).await,
            "destroy" => {
                if let Err(e) = ContainerRecord::set_state(
                    &event.container_id,
                    ContainerState::Removed,
                    &self.db,
                )
                .await
                {
                    debug!(container = %event.container_id, error = %e, "destroy for unknown container");
                }
            }
            _ => {}
        }
    }

    /// A death seen from the engine side. The worker usually gets there
    /// first through `wait_exit`; this path covers kills it never saw.
    async fn handle_death(&self, event: &EngineEvent) {
        let exit_code: i64 = event
            .attributes
            .get("exitCode")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(-1);

        let oom = match self.client.exit_status(&event.container_id).await {
            Ok((_, _, oom)) => oom,
            Err(e) => {
                debug!(container = %event.container_id, error = %e, "death inspection failed");
                false
            }
        };
        let job_id = ContainerRecord::find(&event.container_id, &self.db)
            .await
            .ok()
            .flatten()
            .and_then(|record| record.job_id);

        if let Err(e) =
            ContainerRecord::set_exit(&event.container_id, exit_code, oom, &self.db).await
        {
            debug!(container = %event.container_id, error = %e, "death for unknown container");
            return;
        }

        if exit_code != 0 {
            self.events.emit(OrchestratorEvent::ContainerDied {
                container_id: event.container_id.clone(),
                job_id,
                exit_code,
                oom,
            });
        }
    }
}
