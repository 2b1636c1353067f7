//! Task Store: canonical persistence over `tasks.json` (§4.B).
//!
//! Reads tolerate three at-rest shapes (flat array, `{tasks: [...]}`, or a
//! tagged `{<tag>: {tasks: [...] , metadata}}`); writes always normalise to
//! the tagged `{master: {...}}` shape for tool compatibility.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::domain::{base_task_id, generate_fix_task_id, substitute_id_pattern, Priority, Task, TaskStatus, TaskType};
use crate::error::CoreResult;

use super::atomic::write_json_atomic;
use super::retry_ledger::PersistedRetryLedger;

/// Default retry cap before a task is permanently blocked.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Raw on-disk task shape, tolerant of a missing id and nested subtasks.
#[derive(Debug, Clone, Deserialize)]
struct RawTask {
    id: Option<String>,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default, rename = "taskType")]
    task_type: Option<TaskType>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default, rename = "prdSetId")]
    prd_set_id: Option<String>,
    #[serde(default)]
    subtasks: Vec<RawTask>,
}

#[derive(Debug, Serialize)]
struct TaggedMetadata {
    updated: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct TaggedBody {
    tasks: Vec<Task>,
    metadata: TaggedMetadata,
}

/// Find the `tasks` array within any of the three accepted at-rest shapes.
fn extract_tasks_array(doc: &Value) -> Option<&Vec<Value>> {
    match doc {
        Value::Array(arr) => Some(arr),
        Value::Object(map) => {
            if let Some(Value::Array(arr)) = map.get("tasks") {
                return Some(arr);
            }
            // tagged shape: {<tag>: {tasks: [...]}}
            for v in map.values() {
                if let Value::Object(inner) = v {
                    if let Some(Value::Array(arr)) = inner.get("tasks") {
                        return Some(arr);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn raw_to_task(raw: RawTask, id: String) -> Task {
    let task_type = raw
        .task_type
        .unwrap_or_else(|| TaskType::infer(&raw.title, &raw.description));
    Task {
        id,
        title: raw.title,
        description: raw.description,
        priority: raw.priority.unwrap_or_default(),
        status: raw.status.unwrap_or_default(),
        task_type,
        dependencies: raw.dependencies,
        parent: raw.parent,
        details: raw.details,
        prd_set_id: raw.prd_set_id,
    }
}

/// Canonical task store for one `tasks.json` path.
pub struct TaskStore {
    path: PathBuf,
    id_pattern: String,
    max_retries: u32,
    retry_ledger: PersistedRetryLedger,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>, retry_ledger_path: impl Into<PathBuf>) -> CoreResult<Self> {
        Ok(Self {
            path: path.into(),
            id_pattern: "TASK-{id}".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_ledger: PersistedRetryLedger::load(retry_ledger_path)?,
        })
    }

    pub fn with_id_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.id_pattern = pattern.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Load every task, assigning ids and flattening pending subtasks.
    /// Any parse failure yields an empty list plus a warning rather than
    /// propagating (§4.B failure semantics).
    pub fn get_all_tasks(&self) -> Vec<Task> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read tasks.json");
                return Vec::new();
            }
        };
        let doc: Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to parse tasks.json");
                return Vec::new();
            }
        };
        let Some(raw_array) = extract_tasks_array(&doc) else {
            return Vec::new();
        };

        let raw_tasks: Vec<RawTask> = raw_array
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();

        self.normalize(raw_tasks)
    }

    /// Assign ids to id-less tasks and flatten pending subtasks into
    /// first-class tasks with ids `<parent>.<child>`.
    fn normalize(&self, raw_tasks: Vec<RawTask>) -> Vec<Task> {
        let mut next_seq = raw_tasks.len() as u64 + 1;
        let mut assign_id = |existing: Option<String>| -> String {
            if let Some(id) = existing {
                return id;
            }
            let now = Utc::now().timestamp_millis();
            let id = substitute_id_pattern(&self.id_pattern, next_seq, now);
            next_seq += 1;
            id
        };

        let mut out = Vec::new();
        for mut raw in raw_tasks {
            let subtasks = std::mem::take(&mut raw.subtasks);
            let parent_id = assign_id(raw.id.clone());

            for (idx, sub) in subtasks.into_iter().enumerate() {
                let sub_status = sub.status.unwrap_or_default();
                if sub_status != TaskStatus::Pending {
                    continue;
                }
                let sub_id = sub.id.clone().unwrap_or_else(|| format!("{parent_id}.{}", idx + 1));
                let mut child = raw_to_task(sub, sub_id);
                child.parent = Some(parent_id.clone());
                out.push(child);
            }

            out.push(raw_to_task(raw, parent_id));
        }
        out
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.get_all_tasks().into_iter().find(|t| t.id == id)
    }

    /// Idempotent: skips creation if the id already exists, but refreshes
    /// `prdSetId` if a different set now claims the task.
    pub fn create_task(&self, mut task: Task) -> CoreResult<()> {
        let mut all = self.get_all_tasks();
        if let Some(existing) = all.iter_mut().find(|t| t.id == task.id) {
            if existing.prd_set_id != task.prd_set_id && task.prd_set_id.is_some() {
                existing.prd_set_id = task.prd_set_id.take();
            }
        } else {
            all.push(task);
        }
        self.save(all)
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> CoreResult<()> {
        let mut all = self.get_all_tasks();
        if let Some(task) = all.iter_mut().find(|t| t.id == id) {
            task.status = status;
        }
        self.save(all)
    }

    pub fn update_task(&self, id: &str, patch: impl FnOnce(&mut Task)) -> CoreResult<()> {
        let mut all = self.get_all_tasks();
        if let Some(task) = all.iter_mut().find(|t| t.id == id) {
            patch(task);
        }
        self.save(all)
    }

    /// Increment the retry ledger for `id`'s base task. `create_fix_task` is
    /// the sole caller — the Runner-level retry cap (§4.F) reads this same
    /// ledger via [`Self::retry_count`] rather than incrementing it a second
    /// time.
    pub fn increment_retry(&mut self, id: &str) -> CoreResult<u32> {
        self.retry_ledger.increment(base_task_id(id))
    }

    pub fn reset_retry(&mut self, id: &str) -> CoreResult<()> {
        self.retry_ledger.reset(base_task_id(id))
    }

    /// Current retry count for `id`'s base task, without mutating the
    /// ledger. Used by the Iteration Runner to check its own cap (§4.F)
    /// against the count `create_fix_task` already advanced this iteration.
    pub fn retry_count(&self, id: &str) -> u32 {
        self.retry_ledger.get(base_task_id(id))
    }

    fn save(&self, tasks: Vec<Task>) -> CoreResult<()> {
        let mut doc = HashMap::new();
        doc.insert(
            "master".to_string(),
            TaggedBody {
                tasks,
                metadata: TaggedMetadata { updated: Utc::now() },
            },
        );
        write_json_atomic(&self.path, &doc)
    }

    /// Tasks ready to run: unassigned ids resolved, pending subtasks
    /// flattened, retry-capped and dependency-blocked tasks excluded, and
    /// sorted in-progress-first / non-fix-before-fix / by priority.
    pub fn get_pending_tasks(&self, active_set_filter: Option<&str>) -> Vec<Task> {
        let all = self.get_all_tasks();
        let by_id: HashMap<&str, &Task> = all.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut pending: Vec<Task> = all
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .filter(|t| {
                active_set_filter.is_none_or(|set| {
                    t.prd_set_id.as_deref() == Some(set) || t.detail_field("prdSetId").as_deref() == Some(set)
                })
            })
            .filter(|t| {
                let base = base_task_id(&t.id);
                !self.retry_ledger.has_exceeded(base, self.max_retries)
            })
            .filter(|t| {
                t.dependencies.iter().all(|dep| {
                    by_id
                        .get(dep.as_str())
                        .map(|d| d.status == TaskStatus::Done)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect();

        pending.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        pending
    }

    /// Create a fix-task for a failing `original_id`, or return the
    /// existing pending one. Returns `None` once the retry cap is
    /// exceeded, at which point `original_id` is transitioned to blocked.
    pub fn create_fix_task(
        &mut self,
        original_id: &str,
        error_description: &str,
        test_output: &str,
    ) -> CoreResult<Option<Task>> {
        let base = base_task_id(original_id).to_string();
        let new_count = self.retry_ledger.increment(&base)?;

        if new_count > self.max_retries {
            self.update_task_status(original_id, TaskStatus::Blocked)?;
            return Ok(None);
        }

        let all = self.get_all_tasks();
        if let Some(existing) = all.iter().find(|t| {
            t.task_type == TaskType::Fix && t.dependencies.iter().any(|d| d == original_id) && t.status != TaskStatus::Done
        }) {
            return Ok(Some(existing.clone()));
        }

        let original = all.iter().find(|t| t.id == original_id).cloned();
        let now = Utc::now().timestamp_millis();
        let fix_id = generate_fix_task_id(original_id, now);
        let description = build_fix_description(error_description, test_output);

        let fix_task = Task {
            id: fix_id,
            title: format!("Fix: {}", original.as_ref().map(|o| o.title.as_str()).unwrap_or(original_id)),
            description,
            priority: Priority::Critical,
            status: TaskStatus::Pending,
            task_type: TaskType::Fix,
            dependencies: vec![original_id.to_string()],
            parent: None,
            details: original.as_ref().and_then(|o| o.details.clone()),
            prd_set_id: original.as_ref().and_then(|o| o.prd_set_id.clone()),
        };

        self.create_task(fix_task.clone())?;
        Ok(Some(fix_task))
    }

    /// Partition `tasks` into dependency levels: level 0 holds tasks whose
    /// dependencies are all already `done`; each later level adds tasks
    /// whose dependencies are in `done` or an earlier level. A deadlock
    /// (cycle or missing dependency) dumps all remaining tasks into the
    /// current level so progress is never blocked, bounded at 100 levels.
    pub fn group_tasks_by_dependency_level(tasks: &[Task]) -> Vec<Vec<Task>> {
        const MAX_LEVELS: usize = 100;
        let mut placed: HashMap<String, usize> = HashMap::new();
        let done: std::collections::HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.as_str())
            .collect();

        let mut remaining: Vec<&Task> = tasks.iter().filter(|t| t.status != TaskStatus::Done).collect();
        let mut levels: Vec<Vec<Task>> = Vec::new();

        while !remaining.is_empty() && levels.len() < MAX_LEVELS {
            let level_idx = levels.len();
            let (ready, not_ready): (Vec<&Task>, Vec<&Task>) = remaining.iter().partition(|t| {
                t.dependencies
                    .iter()
                    .all(|d| done.contains(d.as_str()) || placed.contains_key(d))
            });

            if ready.is_empty() {
                // Deadlock: place everything remaining at this level.
                warn!(level = level_idx, count = remaining.len(), "dependency deadlock; forcing progress");
                for t in &remaining {
                    placed.insert(t.id.clone(), level_idx);
                }
                levels.push(remaining.iter().map(|t| (*t).clone()).collect());
                remaining.clear();
                break;
            }

            for t in &ready {
                placed.insert(t.id.clone(), level_idx);
            }
            levels.push(ready.iter().map(|t| (*t).clone()).collect());
            remaining = not_ready;
        }

        if !remaining.is_empty() {
            warn!(count = remaining.len(), "group_tasks_by_dependency_level: 100-level safety bound hit");
            levels.push(remaining.into_iter().cloned().collect());
        }

        levels
    }
}

fn sort_key(t: &Task) -> (u8, u8, i32) {
    let in_progress_rank = if t.status == TaskStatus::InProgress { 0 } else { 1 };
    let fix_rank = if t.is_fix_task() { 1 } else { 0 };
    let priority_rank = match t.priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Medium => 2,
        Priority::Low => 3,
    };
    (in_progress_rank, fix_rank, priority_rank)
}

/// Extract 1-based line numbers referenced by common compiler/test-runner
/// phrasing: `line N`, `:N:`, `at ...:N`.
fn extract_line_numbers(text: &str) -> Vec<u32> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if text[i..].starts_with("line ") {
            let rest = &text[i + 5..];
            if let Some(n) = leading_number(rest) {
                if (1..10000).contains(&n) {
                    found.push(n);
                }
            }
        }
        if bytes[i] == b':' {
            if let Some(n) = leading_number(&text[i + 1..]) {
                if (1..10000).contains(&n) && text[i + 1..].starts_with(|c: char| c.is_ascii_digit()) {
                    found.push(n);
                }
            }
        }
        i += 1;
    }
    found.sort_unstable();
    found.dedup();
    found
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { digits.parse().ok() }
}

/// Extract `<word>.<ext>:<line>` style file references.
fn extract_file_paths(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == '(' || c == ')') {
        if let Some(colon_idx) = token.rfind(':') {
            let (path_part, line_part) = (&token[..colon_idx], &token[colon_idx + 1..]);
            let line_part = line_part.trim_end_matches(':').split(':').next().unwrap_or("");
            if !line_part.is_empty()
                && line_part.chars().all(|c| c.is_ascii_digit())
                && path_part.contains('.')
                && !path_part.contains(':')
            {
                found.push(token.to_string());
            }
        }
    }
    found.sort();
    found.dedup();
    found
}

/// Framework-specific guidance phrases keyed by substring match against the
/// raw error text.
const ERROR_GUIDANCE: &[(&str, &str)] = &[
    ("cannot find module", "Check that the import path and package name match an existing module."),
    ("undefined reference", "A symbol referenced at link time was never defined; check for a missing implementation or export."),
    ("borrow checker", "Re-examine ownership: a value is being used after it was moved or while still borrowed."),
    ("connection refused", "The test environment's dependent service may not be running; verify setup/teardown."),
    ("timeout", "The operation exceeded its configured timeout; consider whether the fix introduced a blocking call."),
];

fn build_fix_description(error_description: &str, test_output: &str) -> String {
    let combined = format!("{error_description}\n{test_output}");
    let lines = extract_line_numbers(&combined);
    let files = extract_file_paths(&combined);
    let lower = combined.to_lowercase();
    let guidance: Vec<&str> = ERROR_GUIDANCE
        .iter()
        .filter(|(needle, _)| lower.contains(needle))
        .map(|(_, g)| *g)
        .collect();

    let mut out = String::new();
    out.push_str(error_description);
    if !lines.is_empty() {
        out.push_str(&format!("\n\nLines referenced: {}", lines.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")));
    }
    if !files.is_empty() {
        out.push_str(&format!("\nFiles referenced: {}", files.join(", ")));
    }
    if !guidance.is_empty() {
        out.push_str(&format!("\nGuidance: {}", guidance.join(" ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> TaskStore {
        TaskStore::new(dir.join("tasks.json"), dir.join("retry-counts.json")).unwrap()
    }

    #[test]
    fn empty_file_yields_empty_pending_list() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        assert!(s.get_pending_tasks(None).is_empty());
    }

    #[test]
    fn reads_flat_array_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, r#"[{"id": "T1", "title": "A", "status": "pending"}]"#).unwrap();
        let s = store(dir.path());
        assert_eq!(s.get_all_tasks().len(), 1);
    }

    #[test]
    fn reads_tasks_wrapped_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, r#"{"tasks": [{"id": "T1", "title": "A", "status": "pending"}]}"#).unwrap();
        let s = store(dir.path());
        assert_eq!(s.get_all_tasks().len(), 1);
    }

    #[test]
    fn reads_tagged_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"{"master": {"tasks": [{"id": "T1", "title": "A", "status": "pending"}], "metadata": {"updated": "2024-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();
        let s = store(dir.path());
        assert_eq!(s.get_all_tasks().len(), 1);
    }

    #[test]
    fn writes_are_always_tagged() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.create_task(Task::new("T1", "Title")).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("tasks.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("master").unwrap().get("tasks").is_some());
    }

    #[test]
    fn dependency_gating_excludes_unmet_dependency() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let mut t1 = Task::new("T1", "First");
        t1.status = TaskStatus::Pending;
        let mut t2 = Task::new("T2", "Second");
        t2.dependencies = vec!["T1".to_string()];
        s.create_task(t1).unwrap();
        s.create_task(t2).unwrap();

        let pending_ids: Vec<String> = s.get_pending_tasks(None).into_iter().map(|t| t.id).collect();
        assert_eq!(pending_ids, vec!["T1".to_string()]);

        s.update_task_status("T1", TaskStatus::Done).unwrap();
        let pending_ids: Vec<String> = s.get_pending_tasks(None).into_iter().map(|t| t.id).collect();
        assert_eq!(pending_ids, vec!["T2".to_string()]);
    }

    #[test]
    fn retry_to_block_scenario() {
        let dir = tempdir().unwrap();
        let mut s = store(dir.path());
        s.create_task(Task::new("T1", "Flaky")).unwrap();

        for expected in 1..=3 {
            let fix = s.create_fix_task("T1", "boom", "stderr").unwrap();
            assert!(fix.is_some());
            assert_eq!(s.retry_ledger.get("T1"), expected);
        }

        let fourth = s.create_fix_task("T1", "boom", "stderr").unwrap();
        assert!(fourth.is_none());
        assert_eq!(s.get_task("T1").unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn group_by_dependency_level_partitions_all_tasks() {
        let mut t1 = Task::new("T1", "A");
        t1.status = TaskStatus::Pending;
        let mut t2 = Task::new("T2", "B");
        t2.dependencies = vec!["T1".to_string()];
        let tasks = vec![t1, t2];
        let levels = TaskStore::group_tasks_by_dependency_level(&tasks);
        let total: usize = levels.iter().map(|l| l.len()).sum();
        assert_eq!(total, tasks.len());
        assert_eq!(levels[0][0].id, "T1");
        assert_eq!(levels[1][0].id, "T2");
    }

    #[test]
    fn group_by_dependency_level_breaks_cycles() {
        let mut t1 = Task::new("T1", "A");
        t1.dependencies = vec!["T2".to_string()];
        let mut t2 = Task::new("T2", "B");
        t2.dependencies = vec!["T1".to_string()];
        let tasks = vec![t1, t2];
        let levels = TaskStore::group_tasks_by_dependency_level(&tasks);
        assert!(levels.len() <= 100);
        let total: usize = levels.iter().map(|l| l.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn flattens_pending_subtasks_with_dotted_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id": "T1", "title": "Parent", "status": "pending", "subtasks": [{"title": "Child", "status": "pending"}]}]"#,
        )
        .unwrap();
        let s = store(dir.path());
        let all = s.get_all_tasks();
        assert!(all.iter().any(|t| t.id == "T1.1"));
    }

    #[test]
    fn sort_orders_in_progress_then_non_fix_then_priority() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let mut low = Task::new("LOW", "low");
        low.priority = Priority::Low;
        let mut fix = Task::new("FIX", "fix");
        fix.task_type = TaskType::Fix;
        fix.priority = Priority::Critical;
        let mut running = Task::new("RUN", "running");
        running.status = TaskStatus::InProgress;
        running.priority = Priority::Low;

        s.create_task(low).unwrap();
        s.create_task(fix).unwrap();
        s.create_task(running).unwrap();

        let order: Vec<String> = s.get_pending_tasks(None).into_iter().map(|t| t.id).collect();
        assert_eq!(order, vec!["RUN".to_string(), "LOW".to_string(), "FIX".to_string()]);
    }

    #[test]
    fn extracts_line_numbers_and_guidance() {
        let desc = build_fix_description("cannot find module at src/lib.rs:42", "error: undefined reference");
        assert!(desc.contains("42"));
        assert!(desc.contains("Guidance"));
    }
}
