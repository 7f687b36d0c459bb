//! Job infrastructure: the durable model, the Postgres store behind
//! the queue engine, and the worker that executes dispatched jobs.
//!
//! # Architecture
//!
//! ```text
//! intake inserts Job (received)
//!     └─► conveyor::Engine::enqueue (PgJobStore persists: queued)
//!
//! Engine dispatch
//!     └─► JobWorker (runner + container + logs)
//!             └─► complete / fail back into the engine
//!                     └─► PgJobStore persists the consequence
//! ```

mod classifier;
mod job;
mod store;
mod worker;

pub use classifier::{FailureCategory, RetryClassifier};
pub use job::{ErrorKind, Job, JobState, JobTransition, ResourceProfile};
pub use store::{PgJobStore, StatePatch};
pub use worker::{JobWorker, RunningJobs};

/// The queue engine specialized to the Postgres store.
pub type JobEngine = conveyor::Engine<PgJobStore>;
