//! Conveyor - a durable multi-queue dispatch engine.
//!
//! Conveyor owns the mechanics of getting queued work to workers in the
//! right order, at the right time, at a bounded rate:
//!
//! - Named queues with priority ordering `(priority, enqueued_at, id)`
//! - Delayed delivery (`delay_until`) promoted on every scheduler tick
//! - Retries with capped exponential backoff and jitter
//! - Dead-lettering when the retry budget is exhausted
//! - Per-queue concurrency limits and per-second rate budgets
//! - Weighted round-robin across queues so no queue starves the rest
//! - Bounded worker hand-off with a timeout; a timed-out hand-off puts
//!   the entry back at the head of the queue
//! - Crash recovery: in-memory indexes are rebuilt from the store, and
//!   entries that were in flight when the process died return to waiting
//!
//! # Architecture
//!
//! ```text
//! enqueue(request)
//!     │ persist via QueueStore (durable before ack)
//!     └─► waiting / delayed index
//!
//! Engine::run (tick ≤ 100ms)
//!     ├─► promote due delayed entries
//!     ├─► weighted round-robin over queues
//!     │       └─► pop head of waiting while slots + rate budget allow
//!     └─► hand off Dispatch over a bounded channel (5s timeout)
//!
//! worker calls complete / fail / cancel
//!     └─► persist, reindex (retry / dead-letter), notify tap
//! ```
//!
//! Conveyor owns ordering and scheduling policy only. What a dispatched
//! entry *means* (payloads, containers, runners) belongs to the caller:
//! the hand-off carries ids, and the durable record lives behind the
//! [`QueueStore`] trait.

mod backoff;
mod engine;
mod entry;
mod error;
mod queue;
mod rate;
mod store;
mod tap;

pub mod testing;

pub use backoff::RetryPolicy;
pub use engine::{
    CancelOutcome, Dispatch, Engine, EngineBuilder, EngineConfig, EngineHandle, QueueDepth,
};
pub use entry::{Entry, EntryState, OrderKey};
pub use error::ConveyorError;
pub use queue::QueueConfig;
pub use rate::RateBudget;
pub use store::{PersistedEntry, QueueStore};
pub use tap::{NoopTap, QueueEvent, QueueTap};
