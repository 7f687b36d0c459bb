//! Queue entries and their ordering key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an entry currently sits inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Ordered by `(priority, enqueued_at, id)`, eligible for dispatch.
    Waiting,
    /// Parked until `delay_until`; promoted to waiting by the scheduler tick.
    Delayed,
    /// Handed to a worker; counted against the queue's concurrency limit.
    Active,
    /// Terminal: the worker reported success.
    Completed,
    /// Terminal: the worker reported a non-recoverable failure.
    Failed,
    /// Terminal: retry budget exhausted or failure was not retryable.
    DeadLettered,
    /// Terminal: cancelled before or during execution.
    Cancelled,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryState::Completed
                | EntryState::Failed
                | EntryState::DeadLettered
                | EntryState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Waiting => "waiting",
            EntryState::Delayed => "delayed",
            EntryState::Active => "active",
            EntryState::Completed => "completed",
            EntryState::Failed => "failed",
            EntryState::DeadLettered => "dead_lettered",
            EntryState::Cancelled => "cancelled",
        }
    }
}

/// A unit of work tracked by the engine.
///
/// The engine holds scheduling metadata only. Payloads stay in the
/// caller's store, keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub queue: String,
    /// 1 = critical … 5 = bulk. Lower dispatches first.
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub delay_until: Option<DateTime<Utc>>,
    /// Number of times this entry has been handed to a worker.
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: EntryState,
}

impl Entry {
    /// Create a waiting entry for immediate dispatch.
    pub fn new(id: Uuid, queue: impl Into<String>, priority: u8, max_attempts: u32) -> Self {
        Self {
            id,
            queue: queue.into(),
            priority,
            enqueued_at: Utc::now(),
            delay_until: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            state: EntryState::Waiting,
        }
    }

    /// Create a delayed entry parked until `delay_until`.
    pub fn delayed(
        id: Uuid,
        queue: impl Into<String>,
        priority: u8,
        max_attempts: u32,
        delay_until: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self::new(id, queue, priority, max_attempts);
        entry.delay_until = Some(delay_until);
        entry.state = EntryState::Delayed;
        entry
    }

    /// The dispatch ordering key for this entry.
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            priority: self.priority,
            enqueued_at: self.enqueued_at,
            id: self.id,
        }
    }

    /// Whether another dispatch is allowed after a retryable failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Total dispatch order within a queue.
///
/// Lower priority number wins; ties resolve by earliest `enqueued_at`,
/// then lexicographic id so the order is total and stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry_with(priority: u8, offset_ms: i64, id: Uuid) -> Entry {
        let mut e = Entry::new(id, "default", priority, 3);
        e.enqueued_at = Utc::now() + Duration::milliseconds(offset_ms);
        e
    }

    #[test]
    fn lower_priority_number_dispatches_first() {
        let a = entry_with(1, 100, Uuid::new_v4());
        let b = entry_with(3, 0, Uuid::new_v4());
        assert!(a.order_key() < b.order_key());
    }

    #[test]
    fn earlier_enqueue_wins_within_priority() {
        let a = entry_with(3, 0, Uuid::new_v4());
        let b = entry_with(3, 50, Uuid::new_v4());
        assert!(a.order_key() < b.order_key());
    }

    #[test]
    fn id_breaks_exact_ties() {
        let at = Utc::now();
        let low = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let high = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        let mut a = Entry::new(low, "default", 3, 3);
        let mut b = Entry::new(high, "default", 3, 3);
        a.enqueued_at = at;
        b.enqueued_at = at;
        assert!(a.order_key() < b.order_key());
    }

    #[test]
    fn max_attempts_floor_is_one() {
        let e = Entry::new(Uuid::new_v4(), "default", 3, 0);
        assert_eq!(e.max_attempts, 1);
    }

    #[test]
    fn terminal_states() {
        assert!(EntryState::Completed.is_terminal());
        assert!(EntryState::DeadLettered.is_terminal());
        assert!(!EntryState::Waiting.is_terminal());
        assert!(!EntryState::Active.is_terminal());
    }

    #[test]
    fn fresh_entry_has_attempts_left() {
        let e = Entry::new(Uuid::new_v4(), "default", 3, 3);
        assert!(e.has_attempts_left());
    }
}
