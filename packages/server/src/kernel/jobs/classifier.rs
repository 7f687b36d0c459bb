//! Externalized retryability classification.
//!
//! Whether a failure category is worth retrying is policy, not code:
//! the defaults below are overridable from configuration, so operators
//! can flip a category without a deploy.

use std::collections::HashMap;

/// Failure categories the worker can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// The container engine was unreachable or timed out.
    EngineUnavailable,
    /// The spec failed allow-list validation.
    CreateRejected,
    /// Creation or start failed for engine-side reasons.
    StartFailed,
    /// The runner exited non-zero.
    NonZeroExit,
    /// The kernel killed the container for memory.
    OomKilled,
    /// The job outran its execution budget.
    ExecutionTimeout,
    /// No runner could be provisioned for the pool.
    NoRunner,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::EngineUnavailable => "engine_unavailable",
            FailureCategory::CreateRejected => "create_rejected",
            FailureCategory::StartFailed => "start_failed",
            FailureCategory::NonZeroExit => "nonzero_exit",
            FailureCategory::OomKilled => "container_oom",
            FailureCategory::ExecutionTimeout => "execution_timeout",
            FailureCategory::NoRunner => "no_runner",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "engine_unavailable" => Some(Self::EngineUnavailable),
            "create_rejected" => Some(Self::CreateRejected),
            "start_failed" => Some(Self::StartFailed),
            "nonzero_exit" => Some(Self::NonZeroExit),
            "container_oom" => Some(Self::OomKilled),
            "execution_timeout" => Some(Self::ExecutionTimeout),
            "no_runner" => Some(Self::NoRunner),
            _ => None,
        }
    }
}

/// The classification table.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    table: HashMap<FailureCategory, bool>,
}

impl Default for RetryClassifier {
    fn default() -> Self {
        let mut table = HashMap::new();
        // Infrastructure trouble retries; user and policy failures do not.
        table.insert(FailureCategory::EngineUnavailable, true);
        table.insert(FailureCategory::CreateRejected, false);
        table.insert(FailureCategory::StartFailed, true);
        table.insert(FailureCategory::NonZeroExit, false);
        table.insert(FailureCategory::OomKilled, true);
        table.insert(FailureCategory::ExecutionTimeout, true);
        table.insert(FailureCategory::NoRunner, true);
        Self { table }
    }
}

impl RetryClassifier {
    /// Apply `category=bool` overrides from configuration. Unknown
    /// categories and non-boolean values are ignored with a warning.
    pub fn with_overrides(overrides: &[(String, String)]) -> Self {
        let mut classifier = Self::default();
        for (raw_category, raw_value) in overrides {
            let Some(category) = FailureCategory::parse(raw_category) else {
                tracing::warn!(category = %raw_category, "unknown retry-classification category");
                continue;
            };
            let Ok(retryable) = raw_value.parse::<bool>() else {
                tracing::warn!(category = %raw_category, value = %raw_value, "bad retry-classification value");
                continue;
            };
            classifier.table.insert(category, retryable);
        }
        classifier
    }

    pub fn is_retryable(&self, category: FailureCategory) -> bool {
        self.table.get(&category).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_retry_infrastructure_not_users() {
        let c = RetryClassifier::default();
        assert!(c.is_retryable(FailureCategory::EngineUnavailable));
        assert!(c.is_retryable(FailureCategory::StartFailed));
        assert!(c.is_retryable(FailureCategory::OomKilled));
        assert!(!c.is_retryable(FailureCategory::NonZeroExit));
        assert!(!c.is_retryable(FailureCategory::CreateRejected));
    }

    #[test]
    fn overrides_flip_a_category() {
        let c = RetryClassifier::with_overrides(&[(
            "container_oom".to_string(),
            "false".to_string(),
        )]);
        assert!(!c.is_retryable(FailureCategory::OomKilled));
        // Others untouched.
        assert!(c.is_retryable(FailureCategory::StartFailed));
    }

    #[test]
    fn bad_overrides_are_ignored() {
        let c = RetryClassifier::with_overrides(&[
            ("warp_core_breach".to_string(), "true".to_string()),
            ("nonzero_exit".to_string(), "maybe".to_string()),
        ]);
        assert!(!c.is_retryable(FailureCategory::NonZeroExit));
    }

    #[test]
    fn category_names_round_trip() {
        for category in [
            FailureCategory::EngineUnavailable,
            FailureCategory::CreateRejected,
            FailureCategory::StartFailed,
            FailureCategory::NonZeroExit,
            FailureCategory::OomKilled,
            FailureCategory::ExecutionTimeout,
            FailureCategory::NoRunner,
        ] {
            assert_eq!(FailureCategory::parse(category.as_str()), Some(category));
        }
    }
}
