//! Error taxonomy (§7).
//!
//! Every failure the core can surface reduces to one of these variants.
//! The step graph converts lower-level errors into `WorkflowState.error`
//! using `Display`; the taxonomy itself is what the Runner and the
//! PRD-Set Orchestrator pattern-match on to decide retry vs. block vs. fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("JSON_UNPARSEABLE: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("apply error: {0}")]
    Apply(String),

    #[error("test error: {0}")]
    Test(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("io error: {0}")]
    Io(String),
}

impl CoreError {
    /// Exit code per §6: 0 success, 1 blocked/max-iterations/stalled/failed,
    /// 2 configuration or input validation error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Dependency(_) => 2,
            _ => 1,
        }
    }

    /// Whether this error counts against a task's retry ledger (§7).
    pub fn counts_toward_retry(&self) -> bool {
        matches!(self, Self::Agent(_) | Self::Parse(_) | Self::Validation(_) | Self::Test(_))
    }

    /// Whether a fix-task should be derived from this failure.
    pub fn creates_fix_task(&self) -> bool {
        matches!(self, Self::Test(_))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io(format!("JSON serialization failed: {e}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_dependency_errors_exit_2() {
        assert_eq!(CoreError::Config("x".into()).exit_code(), 2);
        assert_eq!(CoreError::Dependency("x".into()).exit_code(), 2);
    }

    #[test]
    fn other_errors_exit_1() {
        assert_eq!(CoreError::Agent("x".into()).exit_code(), 1);
        assert_eq!(CoreError::Apply("x".into()).exit_code(), 1);
    }

    #[test]
    fn only_test_errors_create_fix_tasks() {
        assert!(CoreError::Test("x".into()).creates_fix_task());
        assert!(!CoreError::Apply("x".into()).creates_fix_task());
        assert!(!CoreError::Validation("x".into()).creates_fix_task());
    }

    #[test]
    fn retry_counting_matches_taxonomy() {
        assert!(CoreError::Agent("x".into()).counts_toward_retry());
        assert!(CoreError::Parse("x".into()).counts_toward_retry());
        assert!(CoreError::Test("x".into()).counts_toward_retry());
        assert!(!CoreError::Apply("x".into()).counts_toward_retry());
        assert!(!CoreError::Dependency("x".into()).counts_toward_retry());
    }
}
