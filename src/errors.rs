//! Typed error hierarchy for the factory backend.
//!
//! Two enums cover the two failure families the orchestrator distinguishes:
//! - `StoreError` — persistence failures, including the hard not-found cases
//! - `OrchestratorError` — logic-invariant violations that signal a defect,
//!   never a recoverable runtime condition
//!
//! Expected external-system failures (webhook re-registration, LLM declining
//! to produce a fix, a single app's sweep step) stay as `anyhow` errors and
//! are caught at per-application granularity.

use thiserror::Error;

/// Errors from the application document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("app {id} not found")]
    AppNotFound { id: String },

    #[error("app with display id '{display_id}' not found")]
    DisplayIdNotFound { display_id: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt app document: {0}")]
    CorruptDocument(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this is a lookup miss rather than an infrastructure failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AppNotFound { .. } | Self::DisplayIdNotFound { .. }
        )
    }
}

/// Internal-consistency violations in the orchestrator. Hitting one of these
/// means the logic is wrong, so the enclosing operation aborts loudly.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("retry attempted on app '{display_id}' which is {status}, not running")]
    RetryOnNonRunning {
        display_id: String,
        status: &'static str,
    },

    #[error(
        "retry bookkeeping out of sync for app '{display_id}': {retried} retries recorded but no failing run in the log"
    )]
    MissingFailedRun { display_id: String, retried: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_variants_are_detectable() {
        let err = StoreError::AppNotFound {
            id: "abc".to_string(),
        };
        assert!(err.is_not_found());

        let err = StoreError::DisplayIdNotFound {
            display_id: "app-1".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "app with display id 'app-1' not found");
    }

    #[test]
    fn sqlite_errors_are_not_not_found() {
        let err = StoreError::Sqlite(rusqlite::Error::InvalidQuery);
        assert!(!err.is_not_found());
    }

    #[test]
    fn orchestrator_errors_survive_anyhow_downcast() {
        let err: anyhow::Error = OrchestratorError::RetryOnNonRunning {
            display_id: "app-9".to_string(),
            status: "init",
        }
        .into();
        let back = err.downcast_ref::<OrchestratorError>();
        assert!(matches!(
            back,
            Some(OrchestratorError::RetryOnNonRunning { .. })
        ));
    }
}
