//! Task record and the small value types that hang off it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Task priority, used both for display and for `getPendingTasks` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Done => write!(f, "done"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// What kind of work a task represents; drives prompt construction and
/// influences the store's sort order (non-fix before fix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Generate,
    Fix,
    Investigate,
    Analysis,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Fix => write!(f, "fix"),
            Self::Investigate => write!(f, "investigate"),
            Self::Analysis => write!(f, "analysis"),
        }
    }
}

impl TaskType {
    /// Infer a task type from title + description using the fixed keyword
    /// table in §4.B. Only called when a task omits `taskType`.
    pub fn infer(title: &str, description: &str) -> Self {
        let haystack = format!("{title} {description}").to_lowercase();
        let title_lower = title.to_lowercase();

        const INVESTIGATE_WORDS: &[&str] = &["investigate", "analyze", "root cause", "diagnose", "debug", "why"];
        const FAILURE_WORDS: &[&str] = &["failure", "error", "issue"];
        const FIX_WORDS: &[&str] = &["fix", "resolve", "correct", "repair", "patch"];

        let has_investigate_word = INVESTIGATE_WORDS.iter().any(|w| haystack.contains(w));
        if has_investigate_word {
            let has_failure_word = FAILURE_WORDS.iter().any(|w| haystack.contains(w));
            return if has_failure_word { Self::Investigate } else { Self::Analysis };
        }

        let has_fix_word = FIX_WORDS.iter().any(|w| haystack.contains(w));
        if has_fix_word || title_lower.starts_with("fix") {
            return Self::Fix;
        }

        Self::Generate
    }
}

/// A unit of work tracked by the Task Store.
///
/// `details` is kept as an opaque JSON-encoded string because its producer
/// is external (PRD parsing, phase annotation); only the code paths that
/// actually need a particular key (e.g. `prdSetId`) parse it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(rename = "taskType")]
    pub task_type: TaskType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "prdSetId")]
    pub prd_set_id: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            title: title.clone(),
            description: String::new(),
            priority: Priority::default(),
            status: TaskStatus::default(),
            task_type: TaskType::Generate,
            dependencies: Vec::new(),
            parent: None,
            details: None,
            prd_set_id: None,
        }
    }

    /// Parse a single string field out of the opaque `details` JSON blob,
    /// e.g. `task.detail_field("prdSetId")`.
    pub fn detail_field(&self, key: &str) -> Option<String> {
        let raw = self.details.as_ref()?;
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        value.get(key)?.as_str().map(str::to_owned)
    }

    pub fn is_fix_task(&self) -> bool {
        self.task_type == TaskType::Fix
    }
}

/// Persisted map from base-task-id to retry count (`retry-counts.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryLedger {
    #[serde(flatten)]
    pub counts: HashMap<String, u32>,
}

impl RetryLedger {
    pub fn get(&self, base_id: &str) -> u32 {
        self.counts.get(base_id).copied().unwrap_or(0)
    }

    /// Returns the new count.
    pub fn increment(&mut self, base_id: &str) -> u32 {
        let entry = self.counts.entry(base_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn reset(&mut self, base_id: &str) {
        self.counts.remove(base_id);
    }

    pub fn has_exceeded(&self, base_id: &str, max_retries: u32) -> bool {
        self.get(base_id) >= max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_fix_from_title_prefix() {
        assert_eq!(TaskType::infer("Fix login bug", "unrelated text"), TaskType::Fix);
    }

    #[test]
    fn infers_investigate_from_failure_context() {
        assert_eq!(
            TaskType::infer("Investigate build", "why did the failure happen"),
            TaskType::Investigate
        );
    }

    #[test]
    fn infers_analysis_without_failure_context() {
        assert_eq!(
            TaskType::infer("Analyze performance", "diagnose throughput"),
            TaskType::Analysis
        );
    }

    #[test]
    fn infers_generate_as_default() {
        assert_eq!(TaskType::infer("Add helper function", "create a utility"), TaskType::Generate);
    }

    #[test]
    fn priority_orders_low_to_critical() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn retry_ledger_round_trip() {
        let mut ledger = RetryLedger::default();
        assert_eq!(ledger.increment("T1"), 1);
        assert_eq!(ledger.increment("T1"), 2);
        assert_eq!(ledger.get("T1"), 2);
        assert!(!ledger.has_exceeded("T1", 3));
        ledger.increment("T1");
        assert!(ledger.has_exceeded("T1", 3));
        ledger.reset("T1");
        assert_eq!(ledger.get("T1"), 0);
    }

    #[test]
    fn detail_field_reads_opaque_json() {
        let mut task = Task::new("T1", "Title");
        task.details = Some(r#"{"prdSetId": "set-1"}"#.to_string());
        assert_eq!(task.detail_field("prdSetId"), Some("set-1".to_string()));
        assert_eq!(task.detail_field("missing"), None);
    }
}
