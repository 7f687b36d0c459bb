//! The engine-socket wrapper.
//!
//! All calls to the container engine go through this client. The socket
//! is one shared resource: a semaphore bounds in-flight calls, and every
//! call carries the RPC timeout. Security defaults are applied at
//! creation and are not optional: all capabilities dropped,
//! `no-new-privileges`, a non-root user, resource caps from the spec,
//! and the orchestrator's label set for event filtering and cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::service::{DeviceRequest, EventMessage, HostConfig};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::{Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::common::OrchestratorError;
use crate::config::{DockerConfig, RunnerConfig};

use super::spec::ContainerSpec;
use super::stats::RawStats;

/// Label marking containers this orchestrator owns.
pub const LABEL_MANAGED: &str = "io.runfleet.managed";
pub const MANAGED_VALUE: &str = "true";
/// Label carrying the pool key.
pub const LABEL_POOL: &str = "io.runfleet.pool";

/// A container lifecycle event from the engine, already filtered to the
/// orchestrator's label set.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub container_id: String,
    pub action: String,
    pub attributes: HashMap<String, String>,
}

/// Semaphore-bounded engine client.
pub struct DockerClient {
    docker: Docker,
    permits: Arc<Semaphore>,
    config: DockerConfig,
    allow: RunnerConfig,
}

impl DockerClient {
    /// Connect over the local control socket.
    pub fn connect(config: DockerConfig, allow: RunnerConfig) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to container engine")?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_inflight.max(1))),
            docker,
            config,
            allow,
        })
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("engine client closed"))
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, bollard::errors::Error>>,
    ) -> Result<T> {
        let result = tokio::time::timeout(self.config.rpc_timeout, fut)
            .await
            .context("engine call timed out")?;
        result.map_err(Into::into)
    }

    /// Validate the spec and create the container with security
    /// defaults applied. Returns the engine's container id.
    pub async fn create(&self, spec: &ContainerSpec) -> Result<String, OrchestratorError> {
        spec.validate(&self.allow)?;

        let mut labels: HashMap<String, String> = spec.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), MANAGED_VALUE.to_string());

        let device_requests = (spec.gpu_count > 0).then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(spec.gpu_count as i64),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            cpu_shares: Some(spec.cpu_shares),
            pids_limit: Some(spec.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(spec.read_only_rootfs),
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            device_requests,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            labels: Some(labels),
            user: Some("runner".to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let _permit = self
            .permit()
            .await
            .map_err(OrchestratorError::transient)?;
        let response = self
            .with_timeout(self.docker.create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            ))
            .await
            .map_err(OrchestratorError::transient)?;

        debug!(container = %response.id, image = %spec.image, "container created");
        Ok(response.id)
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        let _permit = self.permit().await?;
        self.with_timeout(
            self.docker
                .start_container::<String>(container_id, None),
        )
        .await?;
        Ok(())
    }

    /// Stop with a grace window, then the engine kills.
    pub async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        let _permit = self.permit().await?;
        self.with_timeout(self.docker.stop_container(
            container_id,
            Some(StopContainerOptions {
                t: grace.as_secs() as i64,
            }),
        ))
        .await?;
        Ok(())
    }

    pub async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let _permit = self.permit().await?;
        self.with_timeout(self.docker.remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force,
                v: true,
                ..Default::default()
            }),
        ))
        .await?;
        Ok(())
    }

    /// Block until the container stops; returns its exit code.
    ///
    /// No RPC timeout here: jobs legitimately run for a long time. The
    /// caller bounds this with the job's execution budget.
    pub async fn wait_exit(&self, container_id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running".to_string(),
            }),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The engine reports a non-zero exit as a wait "error" that
            // still carries the status code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Err(anyhow!("wait stream ended for container {container_id}")),
        }
    }

    /// Inspect exit status: `(running, exit_code, oom_killed)`.
    pub async fn exit_status(&self, container_id: &str) -> Result<(bool, Option<i64>, bool)> {
        let _permit = self.permit().await?;
        let inspect = self
            .with_timeout(self.docker.inspect_container(container_id, None))
            .await?;
        let state = inspect.state.unwrap_or_default();
        Ok((
            state.running.unwrap_or(false),
            state.exit_code,
            state.oom_killed.unwrap_or(false),
        ))
    }

    /// One-shot stats sample plus the elapsed time of the call itself.
    pub async fn stats_once(&self, container_id: &str) -> Result<(RawStats, Duration)> {
        let _permit = self.permit().await?;
        let started = std::time::Instant::now();

        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = tokio::time::timeout(self.config.rpc_timeout, stream.next())
            .await
            .context("stats call timed out")?
            .ok_or_else(|| anyhow!("stats stream ended without a sample"))??;
        let elapsed = started.elapsed();

        let raw = RawStats {
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
            cpu_system_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1) as u32,
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            networks: stats
                .networks
                .map(|nets| {
                    nets.values()
                        .map(|net| (net.rx_bytes, net.tx_bytes))
                        .collect()
                })
                .unwrap_or_default(),
            blkio: stats
                .blkio_stats
                .io_service_bytes_recursive
                .map(|entries| {
                    entries
                        .into_iter()
                        .map(|entry| (entry.op, entry.value))
                        .collect()
                })
                .unwrap_or_default(),
            pids: stats.pids_stats.current.unwrap_or(0),
        };
        Ok((raw, elapsed))
    }

    /// Tailing log stream as raw byte chunks.
    ///
    /// The permit is held only for call setup; the stream itself is
    /// demand-driven and must not pin a socket slot.
    pub fn logs(&self, container_id: &str) -> impl Stream<Item = Result<Vec<u8>>> + Unpin {
        self.docker
            .logs(
                container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    tail: "all".to_string(),
                    ..Default::default()
                }),
            )
            .map(|chunk| match chunk {
                Ok(output) => Ok(log_bytes(output)),
                Err(e) => Err(anyhow!(e)),
            })
            .boxed()
    }

    /// Engine events for containers carrying the managed label.
    pub fn events(&self) -> impl Stream<Item = Result<EngineEvent>> + Unpin {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}={MANAGED_VALUE}")],
        );
        filters.insert("type".to_string(), vec!["container".to_string()]);

        self.docker
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|message| async move {
                match message {
                    Ok(msg) => engine_event(msg).map(Ok),
                    Err(e) => Some(Err(anyhow!(e))),
                }
            })
            .boxed()
    }

    /// All managed containers known to the engine, for reconciliation.
    pub async fn list_managed(&self) -> Result<Vec<String>> {
        let _permit = self.permit().await?;
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}={MANAGED_VALUE}")],
        );
        let containers = self
            .with_timeout(self.docker.list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            })))
            .await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.id)
            .collect())
    }

    pub async fn ping(&self) -> Result<()> {
        let _permit = self.permit().await?;
        self.with_timeout(self.docker.ping()).await?;
        Ok(())
    }
}

fn log_bytes(output: LogOutput) -> Vec<u8> {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => message.to_vec(),
    }
}

fn engine_event(message: EventMessage) -> Option<EngineEvent> {
    let actor = message.actor?;
    let container_id = actor.id?;
    let action = message.action?;
    let attributes = actor.attributes.unwrap_or_default();
    if attributes.get(LABEL_MANAGED).map(String::as_str) != Some(MANAGED_VALUE) {
        warn!(container = %container_id, "unmanaged container slipped through event filter");
        return None;
    }
    Some(EngineEvent {
        container_id,
        action,
        attributes,
    })
}
