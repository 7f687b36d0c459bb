//! Container monitoring loop: stats sampling, the metrics ring, and
//! threshold alerts.
//!
//! Every interval the monitor samples stats for all live containers,
//! stores derived snapshots in a bounded per-container ring, and
//! evaluates the alert predicates. A predicate firing for a pair
//! `(container, kind)` creates one active alert and emits
//! `alertTriggered`; further firings bump the count. A predicate that
//! stays quiet for the cooldown resolves the alert.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::telemetry::{AlertSeverity, EventSink, MetricsSink, OrchestratorEvent};

use super::client::DockerClient;
use super::container::{ContainerRecord, ContainerState};
use super::stats::{derive, CpuBaseline, StatsSnapshot};

/// The four monitoring predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    HighCpu,
    HighMemory,
    SlowResponse,
    ContainerState,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighCpu => "high_cpu",
            AlertKind::HighMemory => "high_memory",
            AlertKind::SlowResponse => "slow_response",
            AlertKind::ContainerState => "container_state",
        }
    }

    fn severity(&self) -> AlertSeverity {
        match self {
            AlertKind::HighCpu | AlertKind::SlowResponse => AlertSeverity::Warning,
            AlertKind::HighMemory | AlertKind::ContainerState => AlertSeverity::Critical,
        }
    }
}

/// One active or resolved alert for `(container, kind)`.
#[derive(Debug, Clone)]
pub struct AlertState {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub active: bool,
}

/// Alert bookkeeping, pure so it tests without an engine socket.
#[derive(Debug, Default)]
struct AlertBook {
    alerts: HashMap<(String, AlertKind), AlertState>,
}

impl AlertBook {
    /// Record a firing predicate. Returns true when a new alert became
    /// active (caller emits `alertTriggered`).
    fn trigger(&mut self, container_id: &str, kind: AlertKind, now: DateTime<Utc>) -> bool {
        let alert = self
            .alerts
            .entry((container_id.to_string(), kind))
            .or_insert_with(|| AlertState {
                kind,
                severity: kind.severity(),
                first_seen: now,
                last_seen: now,
                count: 0,
                active: false,
            });
        alert.count += 1;
        alert.last_seen = now;
        let newly_active = !alert.active;
        if newly_active {
            alert.active = true;
            alert.first_seen = now;
        }
        newly_active
    }

    /// Deactivate alerts quiet past the cooldown. Returns the resolved
    /// `(container, kind, active_for_ms)` triples.
    fn resolve_quiet(
        &mut self,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) -> Vec<(String, AlertKind, u64)> {
        let mut resolved = Vec::new();
        for ((container_id, kind), alert) in self.alerts.iter_mut() {
            if alert.active && now - alert.last_seen >= cooldown {
                alert.active = false;
                let active_for =
                    (alert.last_seen - alert.first_seen).num_milliseconds().max(0) as u64;
                resolved.push((container_id.clone(), *kind, active_for));
            }
        }
        resolved
    }

    fn retain_containers(&mut self, live: &HashSet<&str>) {
        self.alerts.retain(|(id, _), _| live.contains(id.as_str()));
    }

    fn drop_container(&mut self, container_id: &str) {
        self.alerts.retain(|(id, _), _| id != container_id);
    }

    fn active(&self) -> Vec<(String, AlertState)> {
        self.alerts
            .iter()
            .filter(|(_, alert)| alert.active)
            .map(|((id, _), alert)| (id.clone(), alert.clone()))
            .collect()
    }
}

#[derive(Default)]
struct MonitorState {
    baselines: HashMap<String, CpuBaseline>,
    rings: HashMap<String, VecDeque<StatsSnapshot>>,
    book: AlertBook,
}

/// The monitoring loop. See module docs.
pub struct ContainerMonitor {
    db: PgPool,
    client: Arc<DockerClient>,
    config: MonitorConfig,
    metrics_retention: Duration,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<MonitorState>,
}

impl ContainerMonitor {
    pub fn new(
        db: PgPool,
        client: Arc<DockerClient>,
        config: MonitorConfig,
        metrics_retention: Duration,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            db,
            client,
            config,
            metrics_retention,
            events,
            metrics,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "container monitor started"
        );
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.sample_all().await {
                        warn!(error = %e, "monitoring pass failed");
                    }
                }
            }
        }
        info!("container monitor stopped");
    }

    /// One monitoring pass over all live containers.
    pub async fn sample_all(&self) -> anyhow::Result<()> {
        let live = ContainerRecord::list_live(&self.db).await?;
        let now = Utc::now();

        for record in &live {
            // State predicate applies to every live record.
            if !matches!(
                record.state,
                ContainerState::Running | ContainerState::Exited
            ) {
                self.trigger(&record.container_id, AlertKind::ContainerState, 0.0, now);
            }

            if record.state != ContainerState::Running {
                continue;
            }

            match self.client.stats_once(&record.container_id).await {
                Ok((raw, elapsed)) => {
                    let baseline = {
                        let state = self.lock();
                        state.baselines.get(&record.container_id).copied()
                    };
                    let (snapshot, new_baseline) = derive(&raw, baseline, elapsed);
                    self.evaluate(&record.container_id, &snapshot, now);
                    self.store(&record.container_id, snapshot, new_baseline);
                }
                Err(e) => {
                    debug!(container = %record.container_id, error = %e, "stats sample failed");
                    self.trigger(
                        &record.container_id,
                        AlertKind::SlowResponse,
                        self.config.response_threshold.as_millis() as f64,
                        now,
                    );
                }
            }
        }

        self.resolve_quiet(now);
        self.evict_expired(now, &live);

        self.metrics
            .gauge("monitored_containers", live.len() as f64, &[]);
        Ok(())
    }

    fn evaluate(&self, container_id: &str, snapshot: &StatsSnapshot, now: DateTime<Utc>) {
        if snapshot.cpu_percent > self.config.cpu_threshold {
            self.trigger(container_id, AlertKind::HighCpu, snapshot.cpu_percent, now);
        }
        if snapshot.memory_percent > self.config.memory_threshold {
            self.trigger(
                container_id,
                AlertKind::HighMemory,
                snapshot.memory_percent,
                now,
            );
        }
        if snapshot.stat_call_ms > self.config.response_threshold.as_millis() as u64 {
            self.trigger(
                container_id,
                AlertKind::SlowResponse,
                snapshot.stat_call_ms as f64,
                now,
            );
        }
    }

    fn trigger(&self, container_id: &str, kind: AlertKind, value: f64, now: DateTime<Utc>) {
        let newly_active = self.lock().book.trigger(container_id, kind, now);
        if newly_active {
            self.events.emit(OrchestratorEvent::AlertTriggered {
                container_id: container_id.to_string(),
                kind: kind.as_str().to_string(),
                severity: kind.severity(),
                value,
            });
        }
    }

    fn resolve_quiet(&self, now: DateTime<Utc>) {
        let cooldown = chrono::Duration::from_std(self.config.alert_cooldown)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        let resolved = self.lock().book.resolve_quiet(now, cooldown);
        for (container_id, kind, active_for_ms) in resolved {
            self.events.emit(OrchestratorEvent::AlertResolved {
                container_id,
                kind: kind.as_str().to_string(),
                active_for_ms,
            });
        }
    }

    fn store(&self, container_id: &str, snapshot: StatsSnapshot, baseline: CpuBaseline) {
        let mut state = self.lock();
        state.baselines.insert(container_id.to_string(), baseline);
        let capacity = self.config.ring_capacity.max(1);
        let ring = state.rings.entry(container_id.to_string()).or_default();
        if ring.len() >= capacity {
            ring.pop_front();
        }
        ring.push_back(snapshot);
    }

    /// Drop samples past retention and all state for gone containers.
    fn evict_expired(&self, now: DateTime<Utc>, live: &[ContainerRecord]) {
        let retention = chrono::Duration::from_std(self.metrics_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = now - retention;

        let mut state = self.lock();
        for ring in state.rings.values_mut() {
            while matches!(ring.front(), Some(s) if s.at < cutoff) {
                ring.pop_front();
            }
        }

        let live_ids: HashSet<&str> = live.iter().map(|r| r.container_id.as_str()).collect();
        state.rings.retain(|id, _| live_ids.contains(id.as_str()));
        state
            .baselines
            .retain(|id, _| live_ids.contains(id.as_str()));
        state.book.retain_containers(&live_ids);
    }

    /// Metrics and alerts for a container are discarded on removal.
    pub fn drop_container(&self, container_id: &str) {
        let mut state = self.lock();
        state.baselines.remove(container_id);
        state.rings.remove(container_id);
        state.book.drop_container(container_id);
    }

    /// The newest sample for a container, if any.
    pub fn latest(&self, container_id: &str) -> Option<StatsSnapshot> {
        self.lock()
            .rings
            .get(container_id)
            .and_then(|ring| ring.back().cloned())
    }

    /// All currently active alerts.
    pub fn active_alerts(&self) -> Vec<(String, AlertState)> {
        self.lock().book.active()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn first_trigger_activates_later_triggers_count() {
        let mut book = AlertBook::default();
        let now = Utc::now();

        assert!(book.trigger("c1", AlertKind::HighCpu, now));
        assert!(!book.trigger("c1", AlertKind::HighCpu, now));
        assert!(!book.trigger("c1", AlertKind::HighCpu, now));

        let active = book.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1.count, 3);
    }

    #[test]
    fn distinct_kinds_track_independently() {
        let mut book = AlertBook::default();
        let now = Utc::now();
        assert!(book.trigger("c1", AlertKind::HighCpu, now));
        assert!(book.trigger("c1", AlertKind::HighMemory, now));
        assert_eq!(book.active().len(), 2);
    }

    #[test]
    fn quiet_alert_resolves_after_cooldown() {
        let mut book = AlertBook::default();
        let start = Utc::now();
        book.trigger("c1", AlertKind::HighCpu, start);

        // Still inside cooldown: nothing resolves.
        let early = book.resolve_quiet(
            start + ChronoDuration::seconds(30),
            ChronoDuration::seconds(60),
        );
        assert!(early.is_empty());

        let resolved = book.resolve_quiet(
            start + ChronoDuration::seconds(61),
            ChronoDuration::seconds(60),
        );
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1, AlertKind::HighCpu);
        assert!(book.active().is_empty());
    }

    #[test]
    fn retrigger_after_resolution_is_newly_active() {
        let mut book = AlertBook::default();
        let start = Utc::now();
        book.trigger("c1", AlertKind::HighMemory, start);
        book.resolve_quiet(
            start + ChronoDuration::minutes(5),
            ChronoDuration::minutes(2),
        );

        assert!(book.trigger(
            "c1",
            AlertKind::HighMemory,
            start + ChronoDuration::minutes(6)
        ));
    }

    #[test]
    fn dropping_a_container_clears_its_alerts() {
        let mut book = AlertBook::default();
        let now = Utc::now();
        book.trigger("c1", AlertKind::HighCpu, now);
        book.trigger("c2", AlertKind::HighCpu, now);

        book.drop_container("c1");
        let active = book.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, "c2");
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(AlertKind::HighMemory.severity(), AlertSeverity::Critical);
        assert_eq!(AlertKind::HighCpu.severity(), AlertSeverity::Warning);
        assert_eq!(AlertKind::ContainerState.severity(), AlertSeverity::Critical);
    }

    #[test]
    fn alert_kind_names_are_stable() {
        assert_eq!(AlertKind::HighCpu.as_str(), "high_cpu");
        assert_eq!(AlertKind::SlowResponse.as_str(), "slow_response");
        assert_eq!(AlertKind::ContainerState.as_str(), "container_state");
    }
}
