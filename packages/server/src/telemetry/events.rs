//! Named orchestrator events.
//!
//! These are facts, not commands: they flow outward to the event sink
//! after the underlying change is committed. Consumers (dashboards,
//! alerting) key on the serialized variant name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How urgent an alert or security event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Every named event the orchestrator emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A job changed state.
    JobStateChanged {
        job_id: Uuid,
        from: String,
        to: String,
        reason: Option<String>,
    },

    /// A job exhausted its retries or failed non-retryably.
    JobDeadLettered {
        job_id: Uuid,
        queue: String,
        attempts: i32,
        reason: String,
    },

    /// A monitoring predicate started firing for a container.
    AlertTriggered {
        container_id: String,
        kind: String,
        severity: AlertSeverity,
        value: f64,
    },

    /// A previously active alert stopped firing.
    AlertResolved {
        container_id: String,
        kind: String,
        active_for_ms: u64,
    },

    /// A runner container was created and started.
    ContainerStarted {
        container_id: String,
        job_id: Option<Uuid>,
        image: String,
    },

    /// A runner container exited.
    ContainerDied {
        container_id: String,
        job_id: Option<Uuid>,
        exit_code: i64,
        oom: bool,
    },

    /// The scanner matched a secret pattern in a log stream.
    SecretDetected {
        container_id: String,
        job_id: Option<Uuid>,
        pattern_kind: String,
        severity: AlertSeverity,
        byte_offset: u64,
    },

    /// The intake saw repeated signature mismatches.
    SignatureFlood {
        source: String,
        mismatches: u32,
        window_ms: u64,
    },

    /// The auto-scaler changed a pool's desired size.
    PoolScaled {
        pool_key: String,
        from: usize,
        to: usize,
        reason: String,
    },

    /// A component reported unhealthy to the control loop.
    ComponentUnhealthy {
        component: String,
        detail: String,
        at: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    /// The serialized variant name, for counters keyed by event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorEvent::JobStateChanged { .. } => "job_state_changed",
            OrchestratorEvent::JobDeadLettered { .. } => "job_dead_lettered",
            OrchestratorEvent::AlertTriggered { .. } => "alert_triggered",
            OrchestratorEvent::AlertResolved { .. } => "alert_resolved",
            OrchestratorEvent::ContainerStarted { .. } => "container_started",
            OrchestratorEvent::ContainerDied { .. } => "container_died",
            OrchestratorEvent::SecretDetected { .. } => "secret_detected",
            OrchestratorEvent::SignatureFlood { .. } => "signature_flood",
            OrchestratorEvent::PoolScaled { .. } => "pool_scaled",
            OrchestratorEvent::ComponentUnhealthy { .. } => "component_unhealthy",
        }
    }

    /// Whether the event belongs on the security tap as well.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            OrchestratorEvent::SecretDetected { .. }
                | OrchestratorEvent::SignatureFlood { .. }
                | OrchestratorEvent::ContainerDied { oom: true, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = OrchestratorEvent::SecretDetected {
            container_id: "abc".into(),
            job_id: None,
            pattern_kind: "github_token".into(),
            severity: AlertSeverity::Critical,
            byte_offset: 42,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"secret_detected\""));
        let _: OrchestratorEvent = serde_json::from_str(&json).unwrap();
    }

    #[test]
    fn oom_death_is_a_security_event() {
        let oom = OrchestratorEvent::ContainerDied {
            container_id: "abc".into(),
            job_id: None,
            exit_code: 137,
            oom: true,
        };
        let clean = OrchestratorEvent::ContainerDied {
            container_id: "abc".into(),
            job_id: None,
            exit_code: 0,
            oom: false,
        };
        assert!(oom.is_security());
        assert!(!clean.is_security());
    }

    #[test]
    fn kind_matches_variant() {
        let event = OrchestratorEvent::PoolScaled {
            pool_key: "acme/web:default".into(),
            from: 1,
            to: 3,
            reason: "queue_pressure".into(),
        };
        assert_eq!(event.kind(), "pool_scaled");
    }

    #[test]
    fn severities_order() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
    }
}
