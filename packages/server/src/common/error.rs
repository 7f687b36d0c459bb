//! The orchestrator error taxonomy.
//!
//! Components never swallow errors: they classify into one of five kinds
//! and pass a structured error upward. The kind decides the recovery
//! path - validation and security failures dead-letter immediately,
//! conflicts retry the transition locally, transients respect the retry
//! policy, fatals bypass retry and mark the component unhealthy.

use thiserror::Error;

/// Stable machine-readable codes for the webhook edge and event taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    Conflict,
    Transient,
    Fatal,
    Security,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Transient => "transient",
            ErrorCode::Fatal => "fatal",
            ErrorCode::Security => "security",
        }
    }
}

/// Classified orchestrator errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad signature, bad payload, allow-list violation. Never retried.
    #[error("validation failure: {0}")]
    Validation(String),

    /// A state-transition precondition failed; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Engine unavailable, store timeout, back-pressure. Retried with
    /// backoff.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Unrecoverable. The owning component reports unhealthy.
    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),

    /// Secret detected, forbidden capability, signature flood.
    #[error("security violation: {0}")]
    Security(String),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::Validation(_) => ErrorCode::Validation,
            OrchestratorError::Conflict(_) => ErrorCode::Conflict,
            OrchestratorError::Transient(_) => ErrorCode::Transient,
            OrchestratorError::Fatal(_) => ErrorCode::Fatal,
            OrchestratorError::Security(_) => ErrorCode::Security,
        }
    }

    /// Whether the retry policy applies to this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transient(_) | OrchestratorError::Conflict(_)
        )
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        OrchestratorError::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        OrchestratorError::Fatal(err.into())
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                OrchestratorError::Conflict("record not found".to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => OrchestratorError::transient(err),
            other => OrchestratorError::fatal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            OrchestratorError::Validation("x".into()).code().as_str(),
            "validation"
        );
        assert_eq!(
            OrchestratorError::Security("x".into()).code().as_str(),
            "security"
        );
    }

    #[test]
    fn retry_applies_to_transient_and_conflict_only() {
        assert!(OrchestratorError::transient(anyhow::anyhow!("t")).is_retryable());
        assert!(OrchestratorError::Conflict("c".into()).is_retryable());
        assert!(!OrchestratorError::Validation("v".into()).is_retryable());
        assert!(!OrchestratorError::fatal(anyhow::anyhow!("f")).is_retryable());
        assert!(!OrchestratorError::Security("s".into()).is_retryable());
    }

    #[test]
    fn row_not_found_maps_to_conflict() {
        let err: OrchestratorError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }
}
