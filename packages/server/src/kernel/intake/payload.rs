//! Platform webhook payload shapes.
//!
//! Only the fields the orchestrator consumes are modeled; everything
//! else in the delivery is ignored by serde.

use serde::{Deserialize, Serialize};

/// The headers the intake needs, already extracted from the request.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    /// Event kind, e.g. `workflow_job`.
    pub event: Option<String>,
    /// Unique delivery id, the idempotency key.
    pub delivery: Option<String>,
    /// `sha256=<hex>` HMAC over the raw body.
    pub signature: Option<String>,
}

/// Parsed body of a `workflow_job` delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub action: String,
    pub workflow_job: WorkflowJob,
    pub repository: Repository,
    #[serde(default)]
    pub installation: Option<Installation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
}

/// What the intake decided a delivery means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    /// A new job was requested; provision and run it.
    JobRequested,
    /// The platform finished or cancelled the job upstream.
    JobFinished,
    /// Counted and dropped.
    Ignored,
}

impl WebhookPayload {
    pub fn classify(&self, event_kind: &str) -> WebhookEvent {
        if event_kind != "workflow_job" {
            return WebhookEvent::Ignored;
        }
        match self.action.as_str() {
            "queued" => WebhookEvent::JobRequested,
            "completed" => WebhookEvent::JobFinished,
            _ => WebhookEvent::Ignored,
        }
    }

    /// Whether the job targets the repository's default branch.
    pub fn on_default_branch(&self) -> Option<bool> {
        match (
            self.workflow_job.head_branch.as_deref(),
            self.repository.default_branch.as_deref(),
        ) {
            (Some(head), Some(default)) => Some(head == default),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(action: &str) -> WebhookPayload {
        serde_json::from_value(serde_json::json!({
            "action": action,
            "workflow_job": {
                "id": 123,
                "run_id": 9,
                "name": "build",
                "labels": ["self-hosted", "x64"],
                "head_branch": "main"
            },
            "repository": {
                "full_name": "acme/web",
                "default_branch": "main"
            },
            "installation": { "id": 7 }
        }))
        .unwrap()
    }

    #[test]
    fn queued_workflow_job_is_a_request() {
        assert_eq!(
            payload("queued").classify("workflow_job"),
            WebhookEvent::JobRequested
        );
    }

    #[test]
    fn completed_workflow_job_finishes() {
        assert_eq!(
            payload("completed").classify("workflow_job"),
            WebhookEvent::JobFinished
        );
    }

    #[test]
    fn other_event_kinds_are_ignored() {
        assert_eq!(payload("queued").classify("push"), WebhookEvent::Ignored);
        assert_eq!(
            payload("in_progress").classify("workflow_job"),
            WebhookEvent::Ignored
        );
    }

    #[test]
    fn default_branch_detection() {
        assert_eq!(payload("queued").on_default_branch(), Some(true));

        let mut p = payload("queued");
        p.workflow_job.head_branch = Some("feature/x".into());
        assert_eq!(p.on_default_branch(), Some(false));

        p.workflow_job.head_branch = None;
        assert_eq!(p.on_default_branch(), None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let parsed: Result<WebhookPayload, _> = serde_json::from_value(serde_json::json!({
            "action": "queued",
            "workflow_job": { "id": 1, "run_id": 2, "name": "x", "extra": true },
            "repository": { "full_name": "a/b", "private": false },
            "sender": { "login": "someone" }
        }));
        assert!(parsed.is_ok());
    }
}
