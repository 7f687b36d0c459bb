//! Queue event taps - observe engine facts without participating in them.
//!
//! A tap receives committed facts after the store accepted them. Taps
//! cannot veto or mutate; errors are logged and dropped. The caller wires
//! one tap at engine construction and fans events out from there, so the
//! engine needs no pub/sub machinery of its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Facts emitted by the engine as entries move through their lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// An entry was accepted and durably recorded.
    Enqueued {
        id: Uuid,
        queue: String,
        priority: u8,
        delayed_until: Option<DateTime<Utc>>,
    },

    /// A delayed entry became eligible for dispatch.
    Promoted { id: Uuid, queue: String },

    /// An entry was handed to a worker.
    Dispatched {
        id: Uuid,
        queue: String,
        attempt: u32,
    },

    /// A worker hand-off timed out and the entry returned to waiting.
    HandoffTimedOut { id: Uuid, queue: String },

    /// A worker reported success.
    Completed { id: Uuid, queue: String, attempts: u32 },

    /// A worker reported failure; a retry is scheduled.
    RetryScheduled {
        id: Uuid,
        queue: String,
        attempts: u32,
        delay_until: DateTime<Utc>,
        reason: String,
    },

    /// A worker reported failure and no retry will happen.
    Failed {
        id: Uuid,
        queue: String,
        attempts: u32,
        reason: String,
    },

    /// The entry moved to the dead-letter queue.
    DeadLettered {
        id: Uuid,
        queue: String,
        dead_letter_queue: String,
        attempts: u32,
        reason: String,
    },

    /// The entry was cancelled before completion.
    Cancelled { id: Uuid, queue: String },

    /// An in-flight entry from a previous process returned to waiting.
    Recovered { id: Uuid, queue: String, attempts: u32 },
}

impl QueueEvent {
    /// The entry this event concerns.
    pub fn entry_id(&self) -> Uuid {
        match self {
            QueueEvent::Enqueued { id, .. }
            | QueueEvent::Promoted { id, .. }
            | QueueEvent::Dispatched { id, .. }
            | QueueEvent::HandoffTimedOut { id, .. }
            | QueueEvent::Completed { id, .. }
            | QueueEvent::RetryScheduled { id, .. }
            | QueueEvent::Failed { id, .. }
            | QueueEvent::DeadLettered { id, .. }
            | QueueEvent::Cancelled { id, .. }
            | QueueEvent::Recovered { id, .. } => *id,
        }
    }
}

/// Observer for [`QueueEvent`]s.
///
/// Called synchronously after the fact is durable; implementations that
/// do real I/O should hand off to their own channel and return.
pub trait QueueTap: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}

/// A tap that ignores everything.
#[derive(Debug, Default)]
pub struct NoopTap;

impl QueueTap for NoopTap {
    fn on_event(&self, _event: &QueueEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize() {
        let event = QueueEvent::Dispatched {
            id: Uuid::new_v4(),
            queue: "default".to_string(),
            attempt: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Dispatched"));
        let _: QueueEvent = serde_json::from_str(&json).unwrap();
    }

    #[test]
    fn entry_id_is_uniform() {
        let id = Uuid::new_v4();
        let event = QueueEvent::Cancelled {
            id,
            queue: "default".to_string(),
        };
        assert_eq!(event.entry_id(), id);
    }
}
