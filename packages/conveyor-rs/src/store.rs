//! The durability seam.
//!
//! Conveyor persists every mutation through [`QueueStore`] *before*
//! acknowledging it to the caller or reflecting it in the in-memory
//! indexes. The store decides where the bytes live; the engine only
//! requires that a successful return means the mutation survives a crash.
//!
//! Implementers map these calls onto their job table. The engine never
//! sees payloads, only scheduling metadata.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entry::{Entry, EntryState};

/// An entry as reloaded from durable storage during recovery.
#[derive(Debug, Clone)]
pub struct PersistedEntry {
    pub entry: Entry,
    /// When the entry last changed state, used to order recovery work.
    pub updated_at: DateTime<Utc>,
}

/// Durable persistence for queue entries.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a newly enqueued entry (waiting or delayed).
    async fn persist_enqueued(&self, entry: &Entry) -> Result<()>;

    /// Persist a state flip with a reason, conditional on the old state.
    ///
    /// Implementations must fail if the stored state no longer matches
    /// `from` so concurrent engines cannot double-apply a transition.
    async fn persist_transition(
        &self,
        id: Uuid,
        from: EntryState,
        to: EntryState,
        reason: &str,
    ) -> Result<()>;

    /// Persist a dispatch: the entry becomes active and its attempt
    /// count becomes `attempts`.
    async fn persist_dispatch(&self, id: Uuid, attempts: u32) -> Result<()>;

    /// Persist a return to waiting with an explicit attempt count.
    ///
    /// Used when a hand-off times out (the attempt never happened) and
    /// when recovery reclaims an entry that was in flight at crash time.
    async fn persist_requeue(&self, id: Uuid, attempts: u32, reason: &str) -> Result<()>;

    /// Persist a retry schedule: entry parked until `delay_until` with
    /// its attempt count unchanged at `attempts`.
    async fn persist_retry(
        &self,
        id: Uuid,
        attempts: u32,
        delay_until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()>;

    /// Persist a move to the named dead-letter queue.
    async fn persist_dead_letter(
        &self,
        id: Uuid,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<()>;

    /// Load all non-terminal entries for index reconstruction at startup.
    async fn load_open(&self) -> Result<Vec<PersistedEntry>>;
}
