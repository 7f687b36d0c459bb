//! Per-queue configuration and in-memory state.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::entry::OrderKey;

/// Configuration for one named queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Upper bound on entries in the active set.
    pub concurrency_limit: usize,
    /// Dispatches admitted per second; `None` is unmetered.
    pub rate_limit: Option<u32>,
    pub retry: RetryPolicy,
    /// Queue that receives entries whose retry budget is exhausted.
    pub dead_letter_name: String,
    /// How long terminal entries stay indexed before eviction.
    pub retention_window: Duration,
    /// Weight in the cross-queue round-robin. Higher drains more per round.
    pub weight: u32,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            dead_letter_name: format!("{name}-dead-letter"),
            name,
            concurrency_limit: 10,
            rate_limit: None,
            retry: RetryPolicy::default(),
            retention_window: Duration::from_secs(24 * 60 * 60),
            weight: 1,
        }
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = Some(per_second);
        self
    }

    pub fn maybe_rate_limit(mut self, per_second: Option<u32>) -> Self {
        self.rate_limit = per_second;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dead_letter_name(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_name = name.into();
        self
    }

    pub fn retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }
}

/// The four ordered collections that make up one queue.
///
/// Indexes only: the durable record of each entry lives in the store.
/// All operations here are pure and non-suspending; the engine guards
/// them with its state mutex and never holds that lock across I/O.
#[derive(Debug, Default)]
pub struct QueueState {
    /// Eligible for dispatch, ordered by `(priority, enqueued_at, id)`.
    waiting: BTreeSet<OrderKey>,
    /// Parked entries ordered by due time.
    delayed: BTreeMap<(DateTime<Utc>, Uuid), OrderKey>,
    /// Currently handed to workers.
    active: HashSet<Uuid>,
    /// Terminal entries awaiting retention expiry, with when they ended.
    terminal: BTreeMap<(DateTime<Utc>, Uuid), ()>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_waiting(&mut self, key: OrderKey) {
        self.waiting.insert(key);
    }

    pub fn push_delayed(&mut self, key: OrderKey, due: DateTime<Utc>) {
        self.delayed.insert((due, key.id), key);
    }

    /// Remove and return every delayed entry due at or before `now`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<OrderKey> {
        let mut due = Vec::new();
        while let Some((&(at, id), _)) = self.delayed.first_key_value() {
            if at > now {
                break;
            }
            if let Some(key) = self.delayed.remove(&(at, id)) {
                due.push(key);
            }
        }
        due
    }

    /// Head of the waiting set without removing it.
    pub fn peek_waiting(&self) -> Option<&OrderKey> {
        self.waiting.first()
    }

    /// Pop the dispatch-ordered head of the waiting set.
    pub fn pop_waiting(&mut self) -> Option<OrderKey> {
        self.waiting.pop_first()
    }

    pub fn remove_waiting(&mut self, key: &OrderKey) -> bool {
        self.waiting.remove(key)
    }

    pub fn remove_delayed(&mut self, due: DateTime<Utc>, id: Uuid) -> bool {
        self.delayed.remove(&(due, id)).is_some()
    }

    pub fn mark_active(&mut self, id: Uuid) {
        self.active.insert(id);
    }

    pub fn release_active(&mut self, id: Uuid) -> bool {
        self.active.remove(&id)
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.active.contains(&id)
    }

    pub fn mark_terminal(&mut self, id: Uuid, at: DateTime<Utc>) {
        self.terminal.insert((at, id), ());
    }

    /// Evict terminal markers older than `cutoff`, returning their ids.
    pub fn evict_terminal_before(&mut self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let mut evicted = Vec::new();
        while let Some((&(at, id), _)) = self.terminal.first_key_value() {
            if at >= cutoff {
                break;
            }
            self.terminal.remove(&(at, id));
            evicted.push(id);
        }
        evicted
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self, limit: usize) -> bool {
        self.active.len() < limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use chrono::Duration as ChronoDuration;

    fn key(priority: u8, offset_ms: i64) -> OrderKey {
        let mut e = Entry::new(Uuid::new_v4(), "q", priority, 3);
        e.enqueued_at = Utc::now() + ChronoDuration::milliseconds(offset_ms);
        e.order_key()
    }

    #[test]
    fn pop_respects_priority_then_age() {
        let mut q = QueueState::new();
        let bulk = key(5, 0);
        let critical = key(1, 100);
        let old_normal = key(3, -100);
        q.push_waiting(bulk);
        q.push_waiting(critical);
        q.push_waiting(old_normal);

        assert_eq!(q.pop_waiting(), Some(critical));
        assert_eq!(q.pop_waiting(), Some(old_normal));
        assert_eq!(q.pop_waiting(), Some(bulk));
        assert_eq!(q.pop_waiting(), None);
    }

    #[test]
    fn take_due_only_returns_elapsed() {
        let mut q = QueueState::new();
        let now = Utc::now();
        let past = key(3, 0);
        let future = key(3, 1);
        q.push_delayed(past, now - ChronoDuration::seconds(1));
        q.push_delayed(future, now + ChronoDuration::seconds(60));

        let due = q.take_due(now);
        assert_eq!(due, vec![past]);
        assert_eq!(q.delayed_len(), 1);
    }

    #[test]
    fn active_set_tracks_capacity() {
        let mut q = QueueState::new();
        let id = Uuid::new_v4();
        assert!(q.has_capacity(1));
        q.mark_active(id);
        assert!(!q.has_capacity(1));
        assert!(q.release_active(id));
        assert!(q.has_capacity(1));
        assert!(!q.release_active(id));
    }

    #[test]
    fn terminal_eviction_respects_cutoff() {
        let mut q = QueueState::new();
        let now = Utc::now();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        q.mark_terminal(old, now - ChronoDuration::hours(48));
        q.mark_terminal(fresh, now);

        let evicted = q.evict_terminal_before(now - ChronoDuration::hours(24));
        assert_eq!(evicted, vec![old]);
    }

    #[test]
    fn default_dead_letter_name_derives_from_queue() {
        let config = QueueConfig::new("builds");
        assert_eq!(config.dead_letter_name, "builds-dead-letter");
    }
}
