//! Structured error types for the dispatch engine.
//!
//! `ConveyorError` keeps engine failures pattern-matchable instead of
//! collapsing everything into `anyhow::Error`. Persistence failures carry
//! their source so callers can decide whether the store is worth retrying.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the dispatch engine.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The named queue was never registered with the engine.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// An entry with this id is already tracked by the engine.
    #[error("entry {0} already enqueued")]
    DuplicateEntry(Uuid),

    /// The entry is not in the state the operation requires.
    ///
    /// Conflicts are recoverable: the caller re-reads and retries, or
    /// treats the operation as already done.
    #[error("entry {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: &'static str,
        actual: &'static str,
    },

    /// The entry id is not tracked by the engine at all.
    #[error("unknown entry: {0}")]
    UnknownEntry(Uuid),

    /// The durable store rejected a mutation. Nothing was acknowledged.
    #[error("queue persistence failed")]
    Persistence(#[source] anyhow::Error),

    /// No worker accepted the hand-off within the timeout window.
    #[error("dispatch hand-off timed out for entry {0}")]
    HandoffTimeout(Uuid),

    /// The engine is shutting down and no longer accepts work.
    #[error("engine is shut down")]
    Closed,
}

impl ConveyorError {
    /// Whether the failed operation is worth retrying as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConveyorError::Persistence(_) | ConveyorError::HandoffTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_are_transient() {
        let err = ConveyorError::Persistence(anyhow::anyhow!("connection reset"));
        assert!(err.is_transient());
    }

    #[test]
    fn conflict_is_not_transient() {
        let err = ConveyorError::Conflict {
            id: Uuid::new_v4(),
            expected: "waiting",
            actual: "active",
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn display_includes_queue_name() {
        let err = ConveyorError::UnknownQueue("gpu".to_string());
        assert!(err.to_string().contains("gpu"));
    }
}
