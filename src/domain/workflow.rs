//! Transient value types that flow through one inner workflow iteration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Task;

/// Snapshot built at the start of each outer-loop iteration (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffContext {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub completed_task_ids: Vec<String>,
    pub pending_task_ids: Vec<String>,
    pub blocked_task_ids: Vec<String>,
    pub recent_learnings: Vec<String>,
    pub recent_patterns: Vec<String>,
    pub files_modified: Vec<String>,
    pub estimated_context_usage_percent: f64,
}

/// Inputs handed to the `CodeAgent` for a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task: Task,
    pub codebase_context: String,
    pub prd_id: Option<String>,
    pub phase_id: Option<String>,
    pub prd_set_id: Option<String>,
    pub target_module: Option<String>,
}

/// What a file change requests (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Update,
    Delete,
    Patch,
}

/// One `{search, replace}` pair within a `patch` file change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub search: String,
    pub replace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub operation: FileOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Vec<Patch>>,
}

impl FileChange {
    /// A `patch` file must provide a non-empty `patches` array (§4.E).
    pub fn is_well_formed(&self) -> bool {
        match self.operation {
            FileOperation::Patch => self.patches.as_ref().is_some_and(|p| !p.is_empty()),
            _ => true,
        }
    }
}

/// The document an agent call is expected to produce, after JSON recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChanges {
    pub files: Vec<FileChange>,
    pub summary: String,
}

/// Per-file outcome of requesting an apply from the external apply primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    BoundaryViolation,
    PatchFailed,
    IoError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    pub path: String,
    pub outcome: ApplyOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.outcome == ApplyOutcome::Applied
    }
}

/// Outcome of invoking the black-box test runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Output of the log analyser when a test run fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogAnalysis {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub summary: String,
    pub recommendations: Vec<String>,
}

/// Terminal/non-terminal state of one inner-workflow iteration (§3, §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Complete,
    Failed,
    Stalled,
}

/// The value the step graph threads through `fetching-task` → ... → a
/// terminal state, and what the Iteration Runner reads back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_changes: Option<CodeChanges>,
    #[serde(default)]
    pub apply_results: Vec<ApplyResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_analysis: Option<LogAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_fix_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub learnings: Vec<String>,
    #[serde(default)]
    pub discovered_patterns: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub no_tasks: bool,
}

impl WorkflowState {
    pub fn running() -> Self {
        Self {
            status: WorkflowStatus::Running,
            task: None,
            code_changes: None,
            apply_results: Vec::new(),
            test_result: None,
            log_analysis: None,
            derived_fix_task_id: None,
            error: None,
            tokens_in: 0,
            tokens_out: 0,
            learnings: Vec::new(),
            discovered_patterns: Vec::new(),
            files_modified: Vec::new(),
            no_tasks: false,
        }
    }

    pub fn idle_complete() -> Self {
        Self {
            no_tasks: true,
            status: WorkflowStatus::Complete,
            ..Self::running()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: WorkflowStatus::Failed,
            error: Some(error.into()),
            ..Self::running()
        }
    }
}
