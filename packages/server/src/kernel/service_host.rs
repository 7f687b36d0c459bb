//! The service host: ordered startup, supervised health, bounded
//! reverse-order shutdown.
//!
//! Components register in dependency order. Startup walks that order;
//! shutdown walks it in reverse, giving each service a bounded window
//! before its task is aborted. The supervisor polls health between the
//! two and can restart an unhealthy service in place when
//! `auto_restart` is on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::telemetry::{EventSink, OrchestratorEvent};

/// A long-running component managed by the host.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` fires. Returning early without shutdown is
    /// treated as a failure.
    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()>;

    /// Self-reported health. Polled by the supervisor.
    async fn healthy(&self) -> bool {
        true
    }
}

/// Shared view of per-service health for the HTTP health endpoint.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<Mutex<HashMap<&'static str, bool>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, name: &'static str, healthy: bool) {
        self.lock().insert(name, healthy);
    }

    pub fn snapshot(&self) -> HashMap<&'static str, bool> {
        self.lock().clone()
    }

    /// Aggregate health: every registered service healthy.
    pub fn all_healthy(&self) -> bool {
        self.lock().values().all(|h| *h)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, bool>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Managed {
    service: Arc<dyn Service>,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Owns component lifecycles. See module docs.
pub struct ServiceHost {
    services: Vec<Arc<dyn Service>>,
    shutdown_timeout: Duration,
    auto_restart: bool,
    health_poll: Duration,
    health: HealthRegistry,
    events: Arc<dyn EventSink>,
}

impl ServiceHost {
    pub fn new(
        shutdown_timeout: Duration,
        auto_restart: bool,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            services: Vec::new(),
            shutdown_timeout,
            auto_restart,
            health_poll: Duration::from_secs(10),
            health: HealthRegistry::new(),
            events,
        }
    }

    /// Register a service. Startup follows registration order.
    pub fn register(&mut self, service: Arc<dyn Service>) -> &mut Self {
        self.services.push(service);
        self
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// Start everything, supervise until `shutdown`, then stop in
    /// reverse order with the bounded per-phase timeout.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let mut managed: Vec<Managed> = Vec::with_capacity(self.services.len());
        for service in &self.services {
            managed.push(start_service(Arc::clone(service), &self.health));
            info!(service = service.name(), "service started");
        }

        let mut poll = tokio::time::interval(self.health_poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    for slot in managed.iter_mut() {
                        self.check_service(slot).await;
                    }
                }
            }
        }

        // Reverse-order shutdown, each phase bounded.
        for slot in managed.into_iter().rev() {
            let name = slot.service.name();
            slot.token.cancel();
            let mut handle = slot.handle;
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(Ok(()))) => info!(service = name, "service stopped"),
                Ok(Ok(Err(e))) => warn!(service = name, error = %e, "service stopped with error"),
                Ok(Err(join)) => warn!(service = name, error = %join, "service task panicked"),
                Err(_) => {
                    // Timed out; escalate to force-stop.
                    warn!(service = name, "shutdown timed out, aborting");
                    handle.abort();
                }
            }
        }
        info!("service host stopped");
        Ok(())
    }

    async fn check_service(&self, slot: &mut Managed) {
        let name = slot.service.name();

        let died = slot.handle.is_finished();
        let healthy = !died && slot.service.healthy().await;
        self.health.set(name, healthy);

        if healthy {
            return;
        }

        self.events.emit(OrchestratorEvent::ComponentUnhealthy {
            component: name.to_string(),
            detail: if died {
                "task exited".to_string()
            } else {
                "health check failed".to_string()
            },
            at: chrono::Utc::now(),
        });

        if !self.auto_restart {
            error!(service = name, died, "service unhealthy");
            return;
        }

        warn!(service = name, died, "restarting unhealthy service in place");
        slot.token.cancel();
        slot.handle.abort();
        *slot = start_service(Arc::clone(&slot.service), &self.health);
    }
}

fn start_service(service: Arc<dyn Service>, health: &HealthRegistry) -> Managed {
    let token = CancellationToken::new();
    let child = token.clone();
    let name = service.name();
    health.set(name, true);

    let runner = Arc::clone(&service);
    let handle = tokio::spawn(async move { runner.run(child).await });

    Managed {
        service,
        token,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingEventSink;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Well {
        starts: AtomicUsize,
        order_log: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    }

    #[async_trait]
    impl Service for Well {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            shutdown.cancelled().await;
            self.order_log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(self.name);
            Ok(())
        }
    }

    struct Sick {
        healthy: AtomicBool,
        starts: AtomicUsize,
    }

    #[async_trait]
    impl Service for Sick {
        fn name(&self) -> &'static str {
            "sick"
        }

        async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            shutdown.cancelled().await;
            Ok(())
        }

        async fn healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn well(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Well> {
        Arc::new(Well {
            starts: AtomicUsize::new(0),
            order_log: log,
            name,
        })
    }

    #[tokio::test]
    async fn shutdown_runs_in_reverse_registration_order() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let first = well("first", Arc::clone(&log));
        let second = well("second", Arc::clone(&log));

        let sink = Arc::new(CollectingEventSink::new());
        let mut host = ServiceHost::new(Duration::from_secs(1), false, sink);
        host.register(first.clone()).register(second.clone());

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let host_task = tokio::spawn(host.run_until(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
        host_task.await.unwrap().unwrap();

        let order = log.lock().unwrap().clone();
        assert_eq!(order, vec!["second", "first"]);
        assert_eq!(first.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhealthy_service_restarts_when_enabled() {
        let sick = Arc::new(Sick {
            healthy: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        });

        let sink = Arc::new(CollectingEventSink::new());
        let mut host = ServiceHost::new(Duration::from_secs(1), true, sink.clone());
        host.health_poll = Duration::from_millis(20);
        host.register(sick.clone());

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let host_task = tokio::spawn(host.run_until(shutdown));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sick.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
        host_task.await.unwrap().unwrap();

        assert!(sick.starts.load(Ordering::SeqCst) >= 2);
        assert!(sink.count_of("component_unhealthy") >= 1);
    }

    #[tokio::test]
    async fn health_registry_aggregates() {
        let registry = HealthRegistry::new();
        registry.set("a", true);
        registry.set("b", true);
        assert!(registry.all_healthy());

        registry.set("b", false);
        assert!(!registry.all_healthy());
        assert_eq!(registry.snapshot().len(), 2);
    }
}
