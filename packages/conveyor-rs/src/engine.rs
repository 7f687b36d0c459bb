//! The dispatch engine.
//!
//! One engine instance owns a set of named queues. A single scheduler
//! task (`run`) ticks at a bounded interval, promotes due delayed
//! entries, and drains waiting entries to workers in weighted
//! round-robin order across queues. Worker outcomes come back through
//! [`Engine::complete`], [`Engine::fail`], and [`Engine::cancel`].
//!
//! Locking discipline: all index mutations happen under one `std` mutex
//! and are pure. The lock is never held across an await; persistence
//! happens before index mutation so an acknowledged mutation is durable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entry::{Entry, EntryState};
use crate::error::ConveyorError;
use crate::queue::{QueueConfig, QueueState};
use crate::rate::RateBudget;
use crate::store::QueueStore;
use crate::tap::{QueueEvent, QueueTap};

/// A convenience alias for sharing the engine between producers,
/// workers, and the scheduler task.
pub type EngineHandle<S> = Arc<Engine<S>>;

/// Engine-wide tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduler tick. Delayed entries are promoted within one tick of
    /// their due time.
    pub tick_interval: Duration,
    /// How long a dispatch waits for a worker slot before the entry
    /// returns to waiting.
    pub handoff_timeout: Duration,
    /// Capacity of the bounded worker hand-off channel.
    pub handoff_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            handoff_timeout: Duration::from_secs(5),
            handoff_capacity: 64,
        }
    }
}

/// What a worker receives when an entry is handed off.
///
/// Carries ids only; the worker loads the full record from its own
/// store.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: Uuid,
    pub queue: String,
    pub attempt: u32,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The entry was still queued and has been removed.
    Removed,
    /// The entry is with a worker; the caller must stop the work and
    /// then call [`Engine::confirm_cancelled`].
    InFlight,
}

/// Queue depths reported to observers (the auto-scaler reads these).
#[derive(Debug, Clone)]
pub struct QueueDepth {
    pub queue: String,
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
}

struct QueueSlot {
    config: QueueConfig,
    state: QueueState,
    rate: RateBudget,
    /// Remaining round-robin credit this round.
    credit: u32,
}

struct EngineState {
    /// Queue slots in registration order; the round-robin walks this.
    slots: Vec<QueueSlot>,
    by_name: HashMap<String, usize>,
    entries: HashMap<Uuid, Entry>,
    closed: bool,
}

impl EngineState {
    fn slot(&mut self, queue: &str) -> Option<&mut QueueSlot> {
        let idx = *self.by_name.get(queue)?;
        self.slots.get_mut(idx)
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S> {
    store: Arc<S>,
    tap: Arc<dyn QueueTap>,
    config: EngineConfig,
    queues: Vec<QueueConfig>,
}

impl<S: QueueStore> EngineBuilder<S> {
    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.queues.push(config);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine and the worker side of the hand-off channel.
    pub fn build(self) -> (Engine<S>, mpsc::Receiver<Dispatch>) {
        let (tx, rx) = mpsc::channel(self.config.handoff_capacity.max(1));

        let mut slots = Vec::with_capacity(self.queues.len());
        let mut by_name = HashMap::new();
        for config in self.queues {
            by_name.insert(config.name.clone(), slots.len());
            slots.push(QueueSlot {
                rate: RateBudget::new(config.rate_limit),
                state: QueueState::new(),
                credit: 0,
                config,
            });
        }

        let engine = Engine {
            store: self.store,
            tap: self.tap,
            config: self.config,
            dispatch_tx: tx,
            state: Mutex::new(EngineState {
                slots,
                by_name,
                entries: HashMap::new(),
                closed: false,
            }),
        };
        (engine, rx)
    }
}

/// The dispatch engine. See the module docs for the locking discipline.
pub struct Engine<S> {
    store: Arc<S>,
    tap: Arc<dyn QueueTap>,
    config: EngineConfig,
    dispatch_tx: mpsc::Sender<Dispatch>,
    state: Mutex<EngineState>,
}

impl<S: QueueStore> Engine<S> {
    pub fn builder(store: Arc<S>, tap: Arc<dyn QueueTap>) -> EngineBuilder<S> {
        EngineBuilder {
            store,
            tap,
            config: EngineConfig::default(),
            queues: Vec::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        // A poisoned engine mutex means a panic mid-mutation; indexes
        // may be stale but the durable store is still authoritative.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept an entry. Durable before this returns `Ok`.
    pub async fn enqueue(&self, entry: Entry) -> Result<(), ConveyorError> {
        {
            let state = self.lock();
            if state.closed {
                return Err(ConveyorError::Closed);
            }
            if !state.by_name.contains_key(&entry.queue) {
                return Err(ConveyorError::UnknownQueue(entry.queue));
            }
            if state.entries.contains_key(&entry.id) {
                return Err(ConveyorError::DuplicateEntry(entry.id));
            }
        }

        self.store
            .persist_enqueued(&entry)
            .await
            .map_err(ConveyorError::Persistence)?;

        let event = QueueEvent::Enqueued {
            id: entry.id,
            queue: entry.queue.clone(),
            priority: entry.priority,
            delayed_until: entry.delay_until,
        };

        {
            let mut state = self.lock();
            let key = entry.order_key();
            let delay = entry.delay_until;
            let queue = entry.queue.clone();
            let entry_state = entry.state;
            state.entries.insert(entry.id, entry);
            if let Some(slot) = state.slot(&queue) {
                // Index by declared state; an already-due delayed entry
                // is promoted on the next tick.
                match entry_state {
                    EntryState::Delayed => {
                        slot.state.push_delayed(key, delay.unwrap_or_else(Utc::now))
                    }
                    _ => slot.state.push_waiting(key),
                }
            }
        }

        self.tap.on_event(&event);
        Ok(())
    }

    /// Worker success. The entry leaves the active set for terminal
    /// retention.
    pub async fn complete(&self, id: Uuid) -> Result<(), ConveyorError> {
        let (queue, attempts) = self.expect_active(id)?;

        self.store
            .persist_transition(id, EntryState::Active, EntryState::Completed, "succeeded")
            .await
            .map_err(ConveyorError::Persistence)?;

        self.finish(id, &queue, EntryState::Completed);
        self.tap.on_event(&QueueEvent::Completed {
            id,
            queue,
            attempts,
        });
        Ok(())
    }

    /// Worker failure. Retryable failures with budget left schedule a
    /// retry; everything else dead-letters.
    pub async fn fail(&self, id: Uuid, retryable: bool, reason: &str) -> Result<(), ConveyorError> {
        let (queue, attempts) = self.expect_active(id)?;
        let (retry_policy, dead_letter_queue, max_attempts) = {
            let mut state = self.lock();
            let max = state
                .entries
                .get(&id)
                .map(|e| e.max_attempts)
                .ok_or(ConveyorError::UnknownEntry(id))?;
            let slot = state
                .slot(&queue)
                .ok_or_else(|| ConveyorError::UnknownQueue(queue.clone()))?;
            (
                slot.config.retry.clone(),
                slot.config.dead_letter_name.clone(),
                max,
            )
        };

        if retryable && attempts < max_attempts {
            let delay = retry_policy.delay(attempts);
            let delay_until = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));

            self.store
                .persist_retry(id, attempts, delay_until, reason)
                .await
                .map_err(ConveyorError::Persistence)?;

            {
                let mut state = self.lock();
                let key = if let Some(entry) = state.entries.get_mut(&id) {
                    entry.state = EntryState::Delayed;
                    entry.delay_until = Some(delay_until);
                    Some(entry.order_key())
                } else {
                    None
                };
                if let (Some(key), Some(slot)) = (key, state.slot(&queue)) {
                    slot.state.release_active(id);
                    slot.state.push_delayed(key, delay_until);
                }
            }

            self.tap.on_event(&QueueEvent::RetryScheduled {
                id,
                queue,
                attempts,
                delay_until,
                reason: reason.to_string(),
            });
        } else {
            self.store
                .persist_dead_letter(id, &dead_letter_queue, reason)
                .await
                .map_err(ConveyorError::Persistence)?;

            self.finish(id, &queue, EntryState::DeadLettered);
            self.tap.on_event(&QueueEvent::DeadLettered {
                id,
                queue,
                dead_letter_queue,
                attempts,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Cancel an entry. Queued entries are removed here; in-flight
    /// entries need the caller to stop the work first.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, ConveyorError> {
        let (queue, from, key, due) = {
            let state = self.lock();
            let entry = state
                .entries
                .get(&id)
                .ok_or(ConveyorError::UnknownEntry(id))?;
            if entry.state == EntryState::Active {
                return Ok(CancelOutcome::InFlight);
            }
            if entry.state.is_terminal() {
                return Err(ConveyorError::Conflict {
                    id,
                    expected: "waiting or delayed",
                    actual: entry.state.as_str(),
                });
            }
            (
                entry.queue.clone(),
                entry.state,
                entry.order_key(),
                entry.delay_until,
            )
        };

        self.store
            .persist_transition(id, from, EntryState::Cancelled, "cancelled")
            .await
            .map_err(ConveyorError::Persistence)?;

        {
            let mut state = self.lock();
            if let Some(slot) = state.slot(&queue) {
                match from {
                    EntryState::Waiting => {
                        slot.state.remove_waiting(&key);
                    }
                    EntryState::Delayed => {
                        if let Some(due) = due {
                            slot.state.remove_delayed(due, id);
                        }
                    }
                    _ => {}
                }
            }
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.state = EntryState::Cancelled;
            }
            let now = Utc::now();
            if let Some(slot) = state.slot(&queue) {
                slot.state.mark_terminal(id, now);
            }
        }

        self.tap.on_event(&QueueEvent::Cancelled { id, queue });
        Ok(CancelOutcome::Removed)
    }

    /// Finish cancelling an in-flight entry after its work was stopped.
    pub async fn confirm_cancelled(&self, id: Uuid) -> Result<(), ConveyorError> {
        let (queue, _) = self.expect_active(id)?;

        self.store
            .persist_transition(id, EntryState::Active, EntryState::Cancelled, "cancelled")
            .await
            .map_err(ConveyorError::Persistence)?;

        self.finish(id, &queue, EntryState::Cancelled);
        self.tap.on_event(&QueueEvent::Cancelled { id, queue });
        Ok(())
    }

    /// Rebuild in-memory indexes from the store at startup.
    ///
    /// Entries found active return to waiting with their attempt count
    /// unchanged (the crash, not the entry, is at fault).
    pub async fn recover(&self) -> Result<usize, ConveyorError> {
        let persisted = self
            .store
            .load_open()
            .await
            .map_err(ConveyorError::Persistence)?;
        let mut recovered = 0usize;

        for record in persisted {
            let mut entry = record.entry;
            if !self.known_queue(&entry.queue) {
                warn!(
                    entry = %entry.id,
                    queue = %entry.queue,
                    "recovered entry references an unregistered queue, skipping"
                );
                continue;
            }

            let was_in_flight = entry.state == EntryState::Active;
            if was_in_flight {
                self.store
                    .persist_requeue(entry.id, entry.attempts, "recovered_in_flight")
                    .await
                    .map_err(ConveyorError::Persistence)?;
                entry.state = EntryState::Waiting;
                entry.delay_until = None;
            }

            let event = QueueEvent::Recovered {
                id: entry.id,
                queue: entry.queue.clone(),
                attempts: entry.attempts,
            };

            {
                let mut state = self.lock();
                let key = entry.order_key();
                let queue = entry.queue.clone();
                let delay = entry.delay_until;
                let entry_state = entry.state;
                state.entries.insert(entry.id, entry);
                if let Some(slot) = state.slot(&queue) {
                    match entry_state {
                        EntryState::Delayed => {
                            let due = delay.unwrap_or_else(Utc::now);
                            slot.state.push_delayed(key, due);
                        }
                        _ => slot.state.push_waiting(key),
                    }
                }
            }

            if was_in_flight {
                self.tap.on_event(&event);
            }
            recovered += 1;
        }

        info!(count = recovered, "queue engine recovered durable entries");
        Ok(recovered)
    }

    /// Current depths for every queue.
    pub fn depths(&self) -> Vec<QueueDepth> {
        let state = self.lock();
        state
            .slots
            .iter()
            .map(|slot| QueueDepth {
                queue: slot.config.name.clone(),
                waiting: slot.state.waiting_len(),
                delayed: slot.state.delayed_len(),
                active: slot.state.active_len(),
            })
            .collect()
    }

    /// Scheduler loop. Runs until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "queue engine started"
        );
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.promote_due().await;
                    self.dispatch_round().await;
                    self.evict_expired();
                }
            }
        }

        self.lock().closed = true;
        info!("queue engine stopped");
    }

    // -- internals --

    fn known_queue(&self, queue: &str) -> bool {
        self.lock().by_name.contains_key(queue)
    }

    fn expect_active(&self, id: Uuid) -> Result<(String, u32), ConveyorError> {
        let state = self.lock();
        let entry = state
            .entries
            .get(&id)
            .ok_or(ConveyorError::UnknownEntry(id))?;
        if entry.state != EntryState::Active {
            return Err(ConveyorError::Conflict {
                id,
                expected: "active",
                actual: entry.state.as_str(),
            });
        }
        Ok((entry.queue.clone(), entry.attempts))
    }

    /// Move a terminal entry out of the active set and into retention.
    fn finish(&self, id: Uuid, queue: &str, to: EntryState) {
        let mut state = self.lock();
        if let Some(slot) = state.slot(queue) {
            slot.state.release_active(id);
            slot.state.mark_terminal(id, Utc::now());
        }
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.state = to;
        }
    }

    /// Promote delayed entries whose due time has elapsed.
    async fn promote_due(&self) {
        let now = Utc::now();
        let due: Vec<(String, crate::entry::OrderKey)> = {
            let mut state = self.lock();
            let mut due = Vec::new();
            for slot in state.slots.iter_mut() {
                for key in slot.state.take_due(now) {
                    due.push((slot.config.name.clone(), key));
                }
            }
            due
        };

        for (queue, key) in due {
            let result = self
                .store
                .persist_transition(key.id, EntryState::Delayed, EntryState::Waiting, "delay_elapsed")
                .await;

            let mut state = self.lock();
            match result {
                Ok(()) => {
                    if let Some(entry) = state.entries.get_mut(&key.id) {
                        entry.state = EntryState::Waiting;
                        entry.delay_until = None;
                    }
                    if let Some(slot) = state.slot(&queue) {
                        slot.state.push_waiting(key);
                    }
                    drop(state);
                    self.tap.on_event(&QueueEvent::Promoted { id: key.id, queue });
                }
                Err(e) => {
                    // Re-park; the next tick tries again.
                    if let Some(slot) = state.slot(&queue) {
                        slot.state.push_delayed(key, now);
                    }
                    drop(state);
                    warn!(entry = %key.id, error = %e, "failed to persist delay promotion");
                }
            }
        }
    }

    /// Drain dispatchable work in weighted round-robin order.
    ///
    /// Each pass gives every queue up to `weight` dispatches, so a
    /// busy queue interleaves with the others at its configured ratio.
    /// Passes repeat until concurrency limits, rate budgets, and empty
    /// waiting sets leave nothing to do.
    async fn dispatch_round(&self) {
        let queue_count = self.lock().slots.len();
        if queue_count == 0 {
            return;
        }

        loop {
            let mut progressed = false;
            for idx in 0..queue_count {
                {
                    let mut state = self.lock();
                    if let Some(slot) = state.slots.get_mut(idx) {
                        slot.credit = slot.config.weight;
                    }
                }
                while let Some(entry) = self.pop_candidate(idx) {
                    progressed = true;
                    if !self.dispatch_one(entry).await {
                        // Hand-off channel saturated; stop this round.
                        return;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Pop the next dispatchable entry for the queue at `idx`, spending
    /// one pass credit. Pure; holds the lock once.
    fn pop_candidate(&self, idx: usize) -> Option<Entry> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let slot = state.slots.get_mut(idx)?;
        if slot.credit == 0 {
            return None;
        }
        if !slot.state.has_capacity(slot.config.concurrency_limit) {
            slot.credit = 0;
            return None;
        }
        if slot.state.peek_waiting().is_none() {
            slot.credit = 0;
            return None;
        }
        if !slot.rate.try_admit(now) {
            slot.credit = 0;
            return None;
        }
        let key = slot.state.pop_waiting()?;
        slot.credit -= 1;
        state.entries.get(&key.id).cloned()
    }

    /// Persist and hand off one popped entry. Returns `false` when the
    /// hand-off channel is saturated and the round should stop.
    async fn dispatch_one(&self, entry: Entry) -> bool {
        let id = entry.id;
        let queue = entry.queue.clone();
        let attempt = entry.attempts + 1;

        if let Err(e) = self.store.persist_dispatch(id, attempt).await {
            error!(entry = %id, queue = %queue, error = %e, "failed to persist dispatch");
            self.reindex_waiting(id, &queue);
            return true;
        }

        {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.attempts = attempt;
                entry.state = EntryState::Active;
            }
            if let Some(slot) = state.slot(&queue) {
                slot.state.mark_active(id);
            }
        }

        let dispatch = Dispatch {
            id,
            queue: queue.clone(),
            attempt,
        };

        let sent = tokio::time::timeout(
            self.config.handoff_timeout,
            self.dispatch_tx.send(dispatch),
        )
        .await;

        match sent {
            Ok(Ok(())) => {
                debug!(entry = %id, queue = %queue, attempt, "dispatched");
                self.tap.on_event(&QueueEvent::Dispatched { id, queue, attempt });
                true
            }
            Ok(Err(_)) | Err(_) => {
                // No worker took it; undo the attempt.
                let reverted_attempts = attempt - 1;
                if let Err(e) = self
                    .store
                    .persist_requeue(id, reverted_attempts, "handoff_timeout")
                    .await
                {
                    error!(entry = %id, error = %e, "failed to persist hand-off revert");
                }
                {
                    let mut state = self.lock();
                    let key = if let Some(entry) = state.entries.get_mut(&id) {
                        entry.attempts = reverted_attempts;
                        entry.state = EntryState::Waiting;
                        Some(entry.order_key())
                    } else {
                        None
                    };
                    if let Some(slot) = state.slot(&queue) {
                        slot.state.release_active(id);
                        if let Some(key) = key {
                            slot.state.push_waiting(key);
                        }
                    }
                }
                warn!(entry = %id, queue = %queue, "dispatch hand-off timed out");
                self.tap.on_event(&QueueEvent::HandoffTimedOut { id, queue });
                false
            }
        }
    }

    /// Put a popped-but-unpersisted entry back at its ordered position.
    fn reindex_waiting(&self, id: Uuid, queue: &str) {
        let mut state = self.lock();
        let key = state.entries.get(&id).map(|e| e.order_key());
        if let (Some(key), Some(slot)) = (key, state.slot(queue)) {
            slot.state.push_waiting(key);
        }
    }

    /// Drop terminal entries older than each queue's retention window.
    fn evict_expired(&self) {
        let now = Utc::now();
        let mut state = self.lock();
        let mut expired = Vec::new();
        for slot in state.slots.iter_mut() {
            let window = chrono::Duration::from_std(slot.config.retention_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
            expired.extend(slot.state.evict_terminal_before(now - window));
        }
        for id in expired {
            state.entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::testing::{CollectingTap, MemoryStore};

    fn engine_with(
        configs: Vec<QueueConfig>,
    ) -> (Engine<MemoryStore>, mpsc::Receiver<Dispatch>, Arc<CollectingTap>) {
        let store = Arc::new(MemoryStore::new());
        let tap = Arc::new(CollectingTap::new());
        let mut builder = Engine::builder(store, tap.clone() as Arc<dyn QueueTap>);
        for config in configs {
            builder = builder.queue(config);
        }
        let (engine, rx) = builder.build();
        (engine, rx, tap)
    }

    fn default_queue() -> QueueConfig {
        QueueConfig::new("default").concurrency_limit(4)
    }

    #[tokio::test]
    async fn enqueue_to_unknown_queue_is_rejected() {
        let (engine, _rx, _tap) = engine_with(vec![default_queue()]);
        let entry = Entry::new(Uuid::new_v4(), "nope", 3, 3);
        let err = engine.enqueue(entry).await.unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let (engine, _rx, _tap) = engine_with(vec![default_queue()]);
        let id = Uuid::new_v4();
        engine
            .enqueue(Entry::new(id, "default", 3, 3))
            .await
            .unwrap();
        let err = engine
            .enqueue(Entry::new(id, "default", 3, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::DuplicateEntry(_)));
    }

    #[tokio::test]
    async fn dispatch_follows_priority_order() {
        let (engine, mut rx, _tap) = engine_with(vec![default_queue()]);
        let bulk = Uuid::new_v4();
        let critical = Uuid::new_v4();
        engine.enqueue(Entry::new(bulk, "default", 5, 3)).await.unwrap();
        engine
            .enqueue(Entry::new(critical, "default", 1, 3))
            .await
            .unwrap();

        engine.dispatch_round().await;

        assert_eq!(rx.recv().await.unwrap().id, critical);
        assert_eq!(rx.recv().await.unwrap().id, bulk);
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_active_set() {
        let (engine, mut rx, _tap) =
            engine_with(vec![QueueConfig::new("default").concurrency_limit(1)]);
        engine
            .enqueue(Entry::new(Uuid::new_v4(), "default", 3, 3))
            .await
            .unwrap();
        engine
            .enqueue(Entry::new(Uuid::new_v4(), "default", 3, 3))
            .await
            .unwrap();

        engine.dispatch_round().await;
        let first = rx.recv().await.unwrap();

        // Second entry must not dispatch while the first is active.
        engine.dispatch_round().await;
        assert!(rx.try_recv().is_err());

        engine.complete(first.id).await.unwrap();
        engine.dispatch_round().await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn delayed_entry_waits_for_due_time() {
        let (engine, mut rx, _tap) = engine_with(vec![default_queue()]);
        let id = Uuid::new_v4();
        let due = Utc::now() + chrono::Duration::milliseconds(40);
        engine
            .enqueue(Entry::delayed(id, "default", 3, 3, due))
            .await
            .unwrap();

        engine.promote_due().await;
        engine.dispatch_round().await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.promote_due().await;
        engine.dispatch_round().await;
        assert_eq!(rx.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn retryable_failure_schedules_retry_then_dead_letters() {
        let retry = RetryPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(2));
        let (engine, mut rx, tap) =
            engine_with(vec![QueueConfig::new("default").retry(retry)]);
        let id = Uuid::new_v4();
        engine.enqueue(Entry::new(id, "default", 3, 2)).await.unwrap();

        // Attempt 1 fails retryably.
        engine.dispatch_round().await;
        assert_eq!(rx.recv().await.unwrap().attempt, 1);
        engine.fail(id, true, "boom").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.promote_due().await;
        engine.dispatch_round().await;
        assert_eq!(rx.recv().await.unwrap().attempt, 2);

        // Attempt 2 exhausts the budget.
        engine.fail(id, true, "boom again").await.unwrap();
        assert!(tap
            .events()
            .iter()
            .any(|e| matches!(e, QueueEvent::DeadLettered { id: d, .. } if *d == id)));
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let (engine, mut rx, tap) = engine_with(vec![default_queue()]);
        let id = Uuid::new_v4();
        engine.enqueue(Entry::new(id, "default", 3, 5)).await.unwrap();

        engine.dispatch_round().await;
        rx.recv().await.unwrap();
        engine.fail(id, false, "validation").await.unwrap();

        assert!(tap
            .events()
            .iter()
            .any(|e| matches!(e, QueueEvent::DeadLettered { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn store_reflects_every_acknowledged_mutation() {
        let store = Arc::new(MemoryStore::new());
        let tap = Arc::new(CollectingTap::new());
        let (engine, mut rx) = Engine::builder(store.clone(), tap as Arc<dyn QueueTap>)
            .queue(QueueConfig::new("default").dead_letter_name("default-dlq"))
            .build();

        let done = Uuid::new_v4();
        let doomed = Uuid::new_v4();
        engine.enqueue(Entry::new(done, "default", 3, 1)).await.unwrap();
        engine.enqueue(Entry::new(doomed, "default", 3, 1)).await.unwrap();
        assert_eq!(store.state_of(done), Some(EntryState::Waiting));

        engine.dispatch_round().await;
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(store.state_of(done), Some(EntryState::Active));

        engine.complete(done).await.unwrap();
        assert_eq!(store.state_of(done), Some(EntryState::Completed));

        engine.fail(doomed, true, "exit code 2").await.unwrap();
        assert_eq!(store.state_of(doomed), Some(EntryState::DeadLettered));
        assert_eq!(
            store.dead_letter_queue_of(doomed).as_deref(),
            Some("default-dlq")
        );
        assert_eq!(store.last_reason_of(doomed).as_deref(), Some("exit code 2"));
    }

    #[tokio::test]
    async fn persistence_failure_rejects_enqueue_without_indexing() {
        let store = Arc::new(MemoryStore::new());
        let tap = Arc::new(CollectingTap::new());
        let (engine, mut rx) = Engine::builder(store.clone(), tap as Arc<dyn QueueTap>)
            .queue(default_queue())
            .build();

        store.set_fail_writes(true);
        let id = Uuid::new_v4();
        let err = engine
            .enqueue(Entry::new(id, "default", 3, 3))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Nothing was acknowledged, so nothing dispatches.
        store.set_fail_writes(false);
        engine.dispatch_round().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_removes_queued_entry() {
        let (engine, mut rx, _tap) = engine_with(vec![default_queue()]);
        let id = Uuid::new_v4();
        engine.enqueue(Entry::new(id, "default", 3, 3)).await.unwrap();

        assert_eq!(engine.cancel(id).await.unwrap(), CancelOutcome::Removed);
        engine.dispatch_round().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_of_in_flight_entry_defers_to_caller() {
        let (engine, mut rx, _tap) = engine_with(vec![default_queue()]);
        let id = Uuid::new_v4();
        engine.enqueue(Entry::new(id, "default", 3, 3)).await.unwrap();
        engine.dispatch_round().await;
        rx.recv().await.unwrap();

        assert_eq!(engine.cancel(id).await.unwrap(), CancelOutcome::InFlight);
        engine.confirm_cancelled(id).await.unwrap();
    }

    #[tokio::test]
    async fn recovery_requeues_in_flight_entries() {
        let store = Arc::new(MemoryStore::new());
        let tap = Arc::new(CollectingTap::new());

        // First engine dispatches and then "crashes".
        let id = Uuid::new_v4();
        {
            let (engine, mut rx) =
                Engine::builder(store.clone(), tap.clone() as Arc<dyn QueueTap>)
                    .queue(default_queue())
                    .build();
            engine.enqueue(Entry::new(id, "default", 3, 3)).await.unwrap();
            engine.dispatch_round().await;
            rx.recv().await.unwrap();
        }

        // Second engine recovers from the same store.
        let (engine, mut rx) = Engine::builder(store, tap as Arc<dyn QueueTap>)
            .queue(default_queue())
            .build();
        assert_eq!(engine.recover().await.unwrap(), 1);
        engine.dispatch_round().await;
        let redispatched = rx.recv().await.unwrap();
        assert_eq!(redispatched.id, id);
        // Attempt count survives recovery: the crash consumed attempt 1.
        assert_eq!(redispatched.attempt, 2);
    }

    #[tokio::test]
    async fn weighted_round_robin_interleaves_queues() {
        let (engine, mut rx, _tap) = engine_with(vec![
            QueueConfig::new("heavy").weight(2).concurrency_limit(16),
            QueueConfig::new("light").weight(1).concurrency_limit(16),
        ]);

        for _ in 0..4 {
            engine
                .enqueue(Entry::new(Uuid::new_v4(), "heavy", 3, 3))
                .await
                .unwrap();
        }
        for _ in 0..2 {
            engine
                .enqueue(Entry::new(Uuid::new_v4(), "light", 3, 3))
                .await
                .unwrap();
        }

        engine.dispatch_round().await;

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(rx.recv().await.unwrap().queue);
        }
        // The light queue is served before heavy finishes draining.
        let first_light = order.iter().position(|q| q == "light").unwrap();
        let last_heavy = order.iter().rposition(|q| q == "heavy").unwrap();
        assert!(first_light < last_heavy);
    }

    #[tokio::test]
    async fn rate_limit_caps_dispatches_per_round() {
        let (engine, mut rx, _tap) = engine_with(vec![
            QueueConfig::new("default").concurrency_limit(100).rate_limit(2),
        ]);
        for _ in 0..5 {
            engine
                .enqueue(Entry::new(Uuid::new_v4(), "default", 3, 3))
                .await
                .unwrap();
        }

        engine.dispatch_round().await;
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn depths_reflect_index_state() {
        let (engine, mut rx, _tap) = engine_with(vec![default_queue()]);
        engine
            .enqueue(Entry::new(Uuid::new_v4(), "default", 3, 3))
            .await
            .unwrap();
        engine
            .enqueue(Entry::delayed(
                Uuid::new_v4(),
                "default",
                3,
                3,
                Utc::now() + chrono::Duration::hours(1),
            ))
            .await
            .unwrap();

        let depths = engine.depths();
        assert_eq!(depths[0].waiting, 1);
        assert_eq!(depths[0].delayed, 1);
        assert_eq!(depths[0].active, 0);

        engine.dispatch_round().await;
        rx.recv().await.unwrap();
        let depths = engine.depths();
        assert_eq!(depths[0].waiting, 0);
        assert_eq!(depths[0].active, 1);
    }
}
