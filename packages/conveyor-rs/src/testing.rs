//! In-memory doubles for engine tests.
//!
//! `MemoryStore` keeps entries in a mutex-guarded map with the same
//! conditional-transition semantics a real store must provide.
//! `CollectingTap` records every event for assertions.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entry::{Entry, EntryState};
use crate::store::{PersistedEntry, QueueStore};
use crate::tap::{QueueEvent, QueueTap};

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: Entry,
    updated_at: DateTime<Utc>,
    dead_letter_queue: Option<String>,
    last_reason: Option<String>,
}

/// A `QueueStore` backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Uuid, StoredEntry>>,
    /// When set, every persistence call fails. For durability tests.
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    fn check_writable(&self) -> Result<()> {
        if *self.fail_writes.lock().unwrap_or_else(|e| e.into_inner()) {
            bail!("simulated persistence failure");
        }
        Ok(())
    }

    /// The stored state of an entry, for assertions.
    pub fn state_of(&self, id: Uuid) -> Option<EntryState> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|s| s.entry.state)
    }

    /// The dead-letter queue an entry was routed to, if any.
    pub fn dead_letter_queue_of(&self, id: Uuid) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .and_then(|s| s.dead_letter_queue.clone())
    }

    /// The last persisted reason for an entry, if any.
    pub fn last_reason_of(&self, id: Uuid) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .and_then(|s| s.last_reason.clone())
    }

    fn with_entry<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut StoredEntry) -> Result<T>,
    ) -> Result<T> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let stored = entries
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("no stored entry {id}"))?;
        f(stored)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn persist_enqueued(&self, entry: &Entry) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&entry.id) {
            bail!("entry {} already stored", entry.id);
        }
        entries.insert(
            entry.id,
            StoredEntry {
                entry: entry.clone(),
                updated_at: Utc::now(),
                dead_letter_queue: None,
                last_reason: None,
            },
        );
        Ok(())
    }

    async fn persist_transition(
        &self,
        id: Uuid,
        from: EntryState,
        to: EntryState,
        reason: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.with_entry(id, |stored| {
            if stored.entry.state != from {
                bail!(
                    "transition conflict for {id}: stored {:?}, expected {:?}",
                    stored.entry.state,
                    from
                );
            }
            stored.entry.state = to;
            stored.updated_at = Utc::now();
            stored.last_reason = Some(reason.to_string());
            Ok(())
        })
    }

    async fn persist_dispatch(&self, id: Uuid, attempts: u32) -> Result<()> {
        self.check_writable()?;
        self.with_entry(id, |stored| {
            stored.entry.state = EntryState::Active;
            stored.entry.attempts = attempts;
            stored.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn persist_requeue(&self, id: Uuid, attempts: u32, reason: &str) -> Result<()> {
        self.check_writable()?;
        self.with_entry(id, |stored| {
            stored.entry.state = EntryState::Waiting;
            stored.entry.attempts = attempts;
            stored.entry.delay_until = None;
            stored.updated_at = Utc::now();
            stored.last_reason = Some(reason.to_string());
            Ok(())
        })
    }

    async fn persist_retry(
        &self,
        id: Uuid,
        attempts: u32,
        delay_until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.with_entry(id, |stored| {
            stored.entry.state = EntryState::Delayed;
            stored.entry.attempts = attempts;
            stored.entry.delay_until = Some(delay_until);
            stored.updated_at = Utc::now();
            stored.last_reason = Some(reason.to_string());
            Ok(())
        })
    }

    async fn persist_dead_letter(
        &self,
        id: Uuid,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.with_entry(id, |stored| {
            stored.entry.state = EntryState::DeadLettered;
            stored.updated_at = Utc::now();
            stored.dead_letter_queue = Some(dead_letter_queue.to_string());
            stored.last_reason = Some(reason.to_string());
            Ok(())
        })
    }

    async fn load_open(&self) -> Result<Vec<PersistedEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .values()
            .filter(|s| !s.entry.state.is_terminal())
            .map(|s| PersistedEntry {
                entry: s.entry.clone(),
                updated_at: s.updated_at,
            })
            .collect())
    }
}

/// A tap that records events for assertions.
#[derive(Default)]
pub struct CollectingTap {
    events: Mutex<Vec<QueueEvent>>,
}

impl CollectingTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl QueueTap for CollectingTap {
    fn on_event(&self, event: &QueueEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transition_conflict_is_rejected() {
        let store = MemoryStore::new();
        let entry = Entry::new(Uuid::new_v4(), "default", 3, 3);
        store.persist_enqueued(&entry).await.unwrap();

        let err = store
            .persist_transition(entry.id, EntryState::Active, EntryState::Completed, "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn fail_writes_simulates_outage() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let entry = Entry::new(Uuid::new_v4(), "default", 3, 3);
        assert!(store.persist_enqueued(&entry).await.is_err());

        store.set_fail_writes(false);
        assert!(store.persist_enqueued(&entry).await.is_ok());
    }

    #[tokio::test]
    async fn load_open_skips_terminal_entries() {
        let store = MemoryStore::new();
        let open = Entry::new(Uuid::new_v4(), "default", 3, 3);
        let done = Entry::new(Uuid::new_v4(), "default", 3, 3);
        store.persist_enqueued(&open).await.unwrap();
        store.persist_enqueued(&done).await.unwrap();
        store.persist_dispatch(done.id, 1).await.unwrap();
        store
            .persist_transition(done.id, EntryState::Active, EntryState::Completed, "ok")
            .await
            .unwrap();

        let loaded = store.load_open().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].entry.id, open.id);
    }
}
