//! Sink traits and their default implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use super::events::OrchestratorEvent;

/// Receives committed orchestrator facts.
///
/// Implementations must not block: hand off to a channel if delivery
/// does real I/O. Errors stay inside the sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Receives metric samples.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &'static str, value: u64, labels: &[(&'static str, String)]);
    fn gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]);
    fn histogram(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]);
}

/// Default event sink: structured log lines.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => {
                if event.is_security() {
                    warn!(kind = event.kind(), payload = %json, "security event");
                } else {
                    info!(kind = event.kind(), payload = %json, "event");
                }
            }
            Err(e) => warn!(kind = event.kind(), error = %e, "failed to serialize event"),
        }
    }
}

/// Default metrics sink: debug-level log lines.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn counter(&self, name: &'static str, value: u64, labels: &[(&'static str, String)]) {
        tracing::debug!(metric = name, value, ?labels, "counter");
    }

    fn gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]) {
        tracing::debug!(metric = name, value, ?labels, "gauge");
    }

    fn histogram(&self, name: &'static str, value: f64, labels: &[(&'static str, String)]) {
        tracing::debug!(metric = name, value, ?labels, "histogram");
    }
}

/// Test sink that records every event.
#[derive(Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<OrchestratorEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Test sink that records counter totals keyed by metric name.
#[derive(Default)]
pub struct CollectingMetricsSink {
    counters: Mutex<HashMap<&'static str, u64>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
}

impl CollectingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| **k == name)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(k, _)| **k == name)
            .map(|(_, v)| *v)
    }
}

impl MetricsSink for CollectingMetricsSink {
    fn counter(&self, name: &'static str, value: u64, _labels: &[(&'static str, String)]) {
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name)
            .or_insert(0) += value;
    }

    fn gauge(&self, name: &'static str, value: f64, _labels: &[(&'static str, String)]) {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, value);
    }

    fn histogram(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, String)]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::AlertSeverity;

    #[test]
    fn collecting_sink_counts_by_kind() {
        let sink = CollectingEventSink::new();
        sink.emit(OrchestratorEvent::AlertTriggered {
            container_id: "c1".into(),
            kind: "high_cpu".into(),
            severity: AlertSeverity::Warning,
            value: 92.0,
        });
        sink.emit(OrchestratorEvent::AlertResolved {
            container_id: "c1".into(),
            kind: "high_cpu".into(),
            active_for_ms: 30_000,
        });

        assert_eq!(sink.count_of("alert_triggered"), 1);
        assert_eq!(sink.count_of("alert_resolved"), 1);
        assert_eq!(sink.count_of("secret_detected"), 0);
    }

    #[test]
    fn collecting_metrics_accumulate() {
        let sink = CollectingMetricsSink::new();
        sink.counter("jobs_enqueued", 1, &[]);
        sink.counter("jobs_enqueued", 2, &[]);
        sink.gauge("pool_desired", 4.0, &[]);

        assert_eq!(sink.counter_total("jobs_enqueued"), 3);
        assert_eq!(sink.gauge_value("pool_desired"), Some(4.0));
    }
}
