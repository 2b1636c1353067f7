//! Handoff and learnings documents the Iteration Runner exclusively owns
//! (§3 Ownership): `handoff.md`, `progress.md`, `AGENTS.md`.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::domain::{HandoffContext, WorkflowState};
use crate::error::CoreResult;

pub struct HandoffWriter {
    handoff_path: PathBuf,
    progress_path: PathBuf,
    agents_path: PathBuf,
}

impl HandoffWriter {
    pub fn new(devloop_dir: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        let devloop_dir = devloop_dir.into();
        Self {
            handoff_path: devloop_dir.join("handoff.md"),
            progress_path: devloop_dir.join("progress.md"),
            agents_path: project_root.into().join("AGENTS.md"),
        }
    }

    /// Overwrite `handoff.md` with the freshly built context (§3, §4.F).
    pub fn write_handoff_document(&self, ctx: &HandoffContext) -> CoreResult<()> {
        let mut body = String::new();
        body.push_str(&format!("# Handoff — iteration {}\n\n", ctx.iteration));
        body.push_str(&format!("Generated: {}\n\n", ctx.timestamp.to_rfc3339()));
        body.push_str(&format!("Estimated context usage: {:.1}%\n\n", ctx.estimated_context_usage_percent));
        push_list(&mut body, "Completed tasks", &ctx.completed_task_ids);
        push_list(&mut body, "Pending tasks", &ctx.pending_task_ids);
        push_list(&mut body, "Blocked tasks", &ctx.blocked_task_ids);
        push_list(&mut body, "Recent learnings", &ctx.recent_learnings);
        push_list(&mut body, "Recent patterns", &ctx.recent_patterns);
        push_list(&mut body, "Files modified this session", &ctx.files_modified);
        write_atomic(&self.handoff_path, &body)
    }

    /// Append one entry to `progress.md` for this iteration's outcome.
    pub fn append_progress(&self, iteration: u32, state: &WorkflowState) -> CoreResult<()> {
        let task_id = state.task.as_ref().map(|t| t.id.as_str()).unwrap_or("-");
        let line = format!(
            "- iteration {iteration}: task={task_id} status={:?} error={}\n",
            state.status,
            state.error.as_deref().unwrap_or("-")
        );
        append(&self.progress_path, &line)
    }

    /// Merge newly discovered patterns into `AGENTS.md`, append-unique.
    pub fn merge_patterns(&self, patterns: &[String]) -> CoreResult<()> {
        if patterns.is_empty() {
            return Ok(());
        }
        let existing = std::fs::read_to_string(&self.agents_path).unwrap_or_default();
        let mut seen: BTreeSet<String> = existing.lines().map(str::to_string).collect();
        let mut addition = String::new();
        for pattern in patterns {
            let line = format!("- {pattern}");
            if seen.insert(line.clone()) {
                addition.push_str(&line);
                addition.push('\n');
            }
        }
        if addition.is_empty() {
            return Ok(());
        }
        append(&self.agents_path, &addition)
    }
}

/// Build the snapshot for the start of one iteration from the current
/// task-store view plus running session totals.
pub fn build_handoff_context(
    iteration: u32,
    completed: Vec<String>,
    pending: Vec<String>,
    blocked: Vec<String>,
    recent_learnings: Vec<String>,
    recent_patterns: Vec<String>,
    files_modified: Vec<String>,
    cumulative_tokens_in: u64,
    cumulative_tokens_out: u64,
    context_window_size: u64,
) -> HandoffContext {
    let usage = if context_window_size == 0 {
        0.0
    } else {
        ((cumulative_tokens_in + cumulative_tokens_out) as f64 / context_window_size as f64) * 100.0
    };
    HandoffContext {
        timestamp: Utc::now(),
        iteration,
        completed_task_ids: completed,
        pending_task_ids: pending,
        blocked_task_ids: blocked,
        recent_learnings,
        recent_patterns,
        files_modified,
        estimated_context_usage_percent: usage.clamp(0.0, 100.0),
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    out.push_str(&format!("## {title}\n\n"));
    if items.is_empty() {
        out.push_str("(none)\n\n");
        return;
    }
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
    out.push('\n');
}

fn write_atomic(path: &Path, content: &str) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn append(path: &Path, content: &str) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
