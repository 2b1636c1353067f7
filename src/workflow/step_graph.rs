//! Per-iteration inner state machine (§4.E):
//!
//! ```text
//! idle → fetching-task → (no task) idle-complete
//!                     → executing-ai → applying-changes
//!                                     → running-post-apply-hooks → running-pre-test-hooks
//!                                     → running-tests → analyzing-logs
//!                                     → (tests pass) marking-done → complete
//!                                     → (tests fail) creating-fix-task → failed
//! ```
//!
//! The graph itself is not a literal state-machine type with an enum of
//! states; each stage is a function that extends `WorkflowState` and hands
//! off to the next, mirroring how the teacher's loop manager threads a
//! mutable run context through a fixed pipeline rather than interpreting a
//! transition table at runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::domain::{
    ApplyResult, CodeChanges, EventContext, EventSeverity, EventType, FileOperation, LogAnalysis, Task, TaskContext, TaskStatus,
    TestResult, WorkflowState, WorkflowStatus,
};
use crate::error::CoreError;
use crate::events::EventBus;
use crate::store::TaskStore;

use super::agent::CodeAgent;
use super::apply::{ApplyPrimitive, check_boundary, validate_patch_uniqueness};
use super::json_extract::{emit_unparseable, extract_with_fallback};
use super::test_runner::TestRunner;

/// Collaborators + configuration the step graph needs for one iteration.
/// Borrowed rather than owned so the Iteration Runner can reuse one set of
/// collaborators across many iterations.
pub struct StepGraph<'a> {
    pub task_store: &'a mut TaskStore,
    pub agent: &'a Arc<dyn CodeAgent>,
    pub apply_primitive: &'a Arc<dyn ApplyPrimitive>,
    pub test_runner: &'a Arc<dyn TestRunner>,
    pub bus: &'a EventBus,
    pub working_dir: &'a Path,
    pub test_command: String,
    pub test_timeout: Duration,
    pub active_set_filter: Option<String>,
}

impl<'a> StepGraph<'a> {
    /// Run exactly one iteration: `fetching-task` through a terminal state.
    pub async fn run_iteration(&mut self) -> WorkflowState {
        let task = match self.fetch_task() {
            Some(t) => t,
            None => return WorkflowState::idle_complete(),
        };

        let ctx = EventContext {
            task_id: Some(task.id.clone()),
            prd_id: self.active_set_filter.clone(),
            ..Default::default()
        };
        self.bus.emit(EventType::TaskStarted, EventSeverity::Info, json!({}), ctx.clone());

        let task_context = self.build_task_context(&task);
        let mut state = WorkflowState::running();
        state.task = Some(task.clone());

        match self.execute_ai(&task_context, &ctx).await {
            Ok((changes, tokens_in, tokens_out)) => {
                state.code_changes = Some(changes);
                state.tokens_in = tokens_in;
                state.tokens_out = tokens_out;
            }
            Err(err) => {
                return self.fail_iteration(state, &task, &ctx, err);
            }
        }

        let changes = state.code_changes.clone().expect("set above");
        match self.apply_changes(&changes, task_context.target_module.as_deref(), &ctx).await {
            Ok((results, modified)) => {
                state.apply_results = results;
                state.files_modified = modified;
            }
            Err(err) => {
                return self.fail_iteration(state, &task, &ctx, err);
            }
        }

        self.run_post_apply_hooks(&ctx);
        self.run_pre_test_hooks(&ctx);

        let test_result = self
            .test_runner
            .run_tests(self.working_dir, &self.test_command, self.test_timeout)
            .await;
        self.bus.emit(
            if test_result.passed { EventType::TestPassed } else { EventType::TestFailed },
            if test_result.passed { EventSeverity::Info } else { EventSeverity::Warn },
            json!({ "durationMs": test_result.duration_ms }),
            ctx.clone(),
        );
        let passed = test_result.passed;
        state.test_result = Some(test_result.clone());

        if passed {
            self.mark_done(&task, &ctx);
            state.status = WorkflowStatus::Complete;
            return state;
        }

        let analysis = self.analyze_logs(&test_result);
        state.log_analysis = Some(analysis.clone());
        let fix_task = self.create_fix_task(&task, &analysis, &test_result, &ctx);
        state.derived_fix_task_id = fix_task;
        state.status = WorkflowStatus::Failed;
        state.error = Some(CoreError::Test(analysis.summary.clone()).to_string());
        self.bus.emit(EventType::TaskFailed, EventSeverity::Warn, json!({}), ctx);
        state
    }

    fn fetch_task(&self) -> Option<Task> {
        self.task_store.get_pending_tasks(self.active_set_filter.as_deref()).into_iter().next()
    }

    fn build_task_context(&self, task: &Task) -> TaskContext {
        TaskContext {
            task: task.clone(),
            codebase_context: String::new(),
            prd_id: task.detail_field("prdId"),
            phase_id: task.detail_field("phaseId"),
            prd_set_id: task.prd_set_id.clone(),
            target_module: task.detail_field("targetModule"),
        }
    }

    async fn execute_ai(&self, task_context: &TaskContext, ctx: &EventContext) -> Result<(CodeChanges, u64, u64), CoreError> {
        let prompt = format!("{}\n\n{}", task_context.task.title, task_context.task.description);
        let response = self.agent.generate_code(&prompt, task_context).await?;

        self.bus.emit(
            EventType::AgentCodeGenerated,
            EventSeverity::Info,
            json!({ "tokensIn": response.tokens_in, "tokensOut": response.tokens_out }),
            ctx.clone(),
        );

        match extract_with_fallback(&response.text, self.bus, ctx, self.agent).await {
            Some((changes, fallback_tokens_in, fallback_tokens_out)) => {
                Ok((changes, response.tokens_in + fallback_tokens_in, response.tokens_out + fallback_tokens_out))
            }
            None => {
                emit_unparseable(self.bus, ctx);
                self.bus.emit(EventType::AgentGenerationFailed, EventSeverity::Error, json!({}), ctx.clone());
                Err(CoreError::Parse("agent response did not contain a recoverable CodeChanges document".into()))
            }
        }
    }

    async fn apply_changes(
        &self,
        changes: &CodeChanges,
        target_module: Option<&str>,
        ctx: &EventContext,
    ) -> Result<(Vec<ApplyResult>, Vec<String>), CoreError> {
        let mut results = Vec::with_capacity(changes.files.len());
        let mut modified = Vec::new();

        for file in &changes.files {
            if let Some(blocked) = check_boundary(file, target_module) {
                self.bus.emit(
                    EventType::FileBoundaryViolation,
                    EventSeverity::Warn,
                    json!({ "path": file.path }),
                    ctx.clone(),
                );
                return Err(CoreError::Apply(blocked.message.clone().unwrap_or_default()));
            }

            if file.operation == FileOperation::Patch {
                let current = std::fs::read_to_string(self.working_dir.join(&file.path)).unwrap_or_default();
                if let Some(failed) = validate_patch_uniqueness(file, &current) {
                    return Err(CoreError::Apply(failed.message.clone().unwrap_or_default()));
                }
            }

            let result = self.apply_primitive.apply(file).await;
            if !result.is_success() {
                return Err(CoreError::Apply(result.message.clone().unwrap_or_else(|| "apply failed".into())));
            }

            let event_type = match file.operation {
                FileOperation::Create => EventType::FileCreated,
                _ => EventType::FileModified,
            };
            self.bus.emit(event_type, EventSeverity::Info, json!({ "path": file.path }), ctx.clone());
            modified.push(file.path.clone());
            results.push(result);
        }

        self.bus.emit(EventType::ChangesApplied, EventSeverity::Info, json!({ "count": results.len() }), ctx.clone());
        Ok((results, modified))
    }

    fn run_post_apply_hooks(&self, ctx: &EventContext) {
        self.bus.emit(EventType::BuildStarted, EventSeverity::Info, json!({ "stage": "post_apply" }), ctx.clone());
    }

    fn run_pre_test_hooks(&self, ctx: &EventContext) {
        self.bus.emit(EventType::BuildCompleted, EventSeverity::Info, json!({ "stage": "pre_test" }), ctx.clone());
    }

    fn mark_done(&mut self, task: &Task, ctx: &EventContext) {
        let _ = self.task_store.update_task_status(&task.id, TaskStatus::Done);
        self.bus.emit(EventType::TaskCompleted, EventSeverity::Info, json!({}), ctx.clone());
    }

    fn analyze_logs(&self, test_result: &TestResult) -> LogAnalysis {
        let combined = format!("{}\n{}", test_result.stdout, test_result.stderr);
        let errors: Vec<String> = combined.lines().filter(|l| l.to_lowercase().contains("error")).map(str::to_string).collect();
        let warnings: Vec<String> = combined.lines().filter(|l| l.to_lowercase().contains("warn")).map(str::to_string).collect();
        let summary = errors
            .first()
            .cloned()
            .unwrap_or_else(|| "test run failed with no identifiable error line".into());
        let recommendations = if errors.is_empty() {
            vec!["review full test output; no explicit error line was detected".to_string()]
        } else {
            vec!["address the first reported error and re-run the affected task".to_string()]
        };
        LogAnalysis {
            errors,
            warnings,
            summary,
            recommendations,
        }
    }

    fn create_fix_task(&mut self, task: &Task, analysis: &LogAnalysis, test_result: &TestResult, ctx: &EventContext) -> Option<String> {
        let test_output = format!("{}\n{}", test_result.stdout, test_result.stderr);
        match self.task_store.create_fix_task(&task.id, &analysis.summary, &test_output) {
            Ok(Some(fix_task)) => {
                self.bus.emit(EventType::FixTaskCreated, EventSeverity::Info, json!({ "fixTaskId": fix_task.id }), ctx.clone());
                Some(fix_task.id)
            }
            Ok(None) => {
                self.bus.emit(EventType::TaskBlocked, EventSeverity::Warn, json!({}), ctx.clone());
                None
            }
            Err(_) => None,
        }
    }

    fn fail_iteration(&mut self, mut state: WorkflowState, task: &Task, ctx: &EventContext, err: CoreError) -> WorkflowState {
        state.status = WorkflowStatus::Failed;
        state.error = Some(err.to_string());
        if err.creates_fix_task() {
            let test_result = TestResult {
                passed: false,
                stdout: String::new(),
                stderr: err.to_string(),
                duration_ms: 0,
                artifacts: vec![],
            };
            let analysis = self.analyze_logs(&test_result);
            state.derived_fix_task_id = self.create_fix_task(task, &analysis, &test_result, ctx);
        } else {
            self.bus.emit(EventType::TaskFailed, EventSeverity::Warn, json!({ "error": err.to_string() }), ctx.clone());
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApplyOutcome, ApplyResult, FileChange, Priority, TaskType};
    use crate::store::TaskStore;
    use crate::workflow::agent::mock::MockCodeAgent;
    use crate::workflow::agent::AgentResponse;
    use crate::workflow::apply::mock::RecordingApplyPrimitive;
    use crate::workflow::test_runner::mock::ScriptedTestRunner;
    use async_trait::async_trait;
    use serde_json::json as j;
    use tempfile::tempdir;

    fn seed_store(dir: &std::path::Path) -> TaskStore {
        let path = dir.join("tasks.json");
        std::fs::write(
            &path,
            serde_json::to_string(&j!({"tasks": [{
                "id": "T1", "title": "do it", "description": "desc",
                "priority": "medium", "status": "pending", "taskType": "generate",
                "dependencies": [], "parent": null, "details": null, "prdSetId": null
            }]}))
            .unwrap(),
        )
        .unwrap();
        TaskStore::new(path, dir.join("retries.json")).unwrap()
    }

    struct AlwaysApply;
    #[async_trait]
    impl ApplyPrimitive for AlwaysApply {
        async fn apply(&self, change: &FileChange) -> ApplyResult {
            ApplyResult {
                path: change.path.clone(),
                outcome: ApplyOutcome::Applied,
                message: None,
            }
        }
    }

    #[tokio::test]
    async fn successful_iteration_marks_task_done() {
        let dir = tempdir().unwrap();
        let mut store = seed_store(dir.path());
        let agent: Arc<dyn CodeAgent> = Arc::new(MockCodeAgent::new(vec![Ok(AgentResponse {
            text: r#"{"files": [], "summary": "no changes needed"}"#.into(),
            tokens_in: 10,
            tokens_out: 20,
        })]));
        let apply: Arc<dyn ApplyPrimitive> = Arc::new(AlwaysApply);
        let runner: Arc<dyn TestRunner> = Arc::new(ScriptedTestRunner::new(vec![TestResult {
            passed: true,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 5,
            artifacts: vec![],
        }]));
        let bus = EventBus::new(100);

        let mut graph = StepGraph {
            task_store: &mut store,
            agent: &agent,
            apply_primitive: &apply,
            test_runner: &runner,
            bus: &bus,
            working_dir: dir.path(),
            test_command: "true".into(),
            test_timeout: Duration::from_secs(1),
            active_set_filter: None,
        };

        let state = graph.run_iteration().await;
        assert_eq!(state.status, WorkflowStatus::Complete);
        assert_eq!(store.get_task("T1").unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_failure_creates_a_fix_task() {
        let dir = tempdir().unwrap();
        let mut store = seed_store(dir.path());
        let agent: Arc<dyn CodeAgent> = Arc::new(MockCodeAgent::new(vec![Ok(AgentResponse {
            text: r#"{"files": [], "summary": "attempt"}"#.into(),
            tokens_in: 1,
            tokens_out: 1,
        })]));
        let apply: Arc<dyn ApplyPrimitive> = Arc::new(AlwaysApply);
        let runner: Arc<dyn TestRunner> = Arc::new(ScriptedTestRunner::new(vec![TestResult {
            passed: false,
            stdout: String::new(),
            stderr: "error: assertion failed at line 42".into(),
            duration_ms: 5,
            artifacts: vec![],
        }]));
        let bus = EventBus::new(100);

        let mut graph = StepGraph {
            task_store: &mut store,
            agent: &agent,
            apply_primitive: &apply,
            test_runner: &runner,
            bus: &bus,
            working_dir: dir.path(),
            test_command: "true".into(),
            test_timeout: Duration::from_secs(1),
            active_set_filter: None,
        };

        let state = graph.run_iteration().await;
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.derived_fix_task_id.is_some());
    }

    #[tokio::test]
    async fn unparseable_agent_response_fails_without_fix_task() {
        let dir = tempdir().unwrap();
        let mut store = seed_store(dir.path());
        let agent: Arc<dyn CodeAgent> = Arc::new(MockCodeAgent::new(vec![Ok(AgentResponse {
            text: "not json at all, sorry".into(),
            tokens_in: 1,
            tokens_out: 1,
        })]));
        let apply: Arc<dyn ApplyPrimitive> = Arc::new(AlwaysApply);
        let runner: Arc<dyn TestRunner> = Arc::new(ScriptedTestRunner::new(vec![]));
        let bus = EventBus::new(100);

        let mut graph = StepGraph {
            task_store: &mut store,
            agent: &agent,
            apply_primitive: &apply,
            test_runner: &runner,
            bus: &bus,
            working_dir: dir.path(),
            test_command: "true".into(),
            test_timeout: Duration::from_secs(1),
            active_set_filter: None,
        };

        let state = graph.run_iteration().await;
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.derived_fix_task_id.is_none());
        assert!(state.error.unwrap().contains("JSON_UNPARSEABLE"));
    }

    #[tokio::test]
    async fn no_pending_tasks_yields_idle_complete() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("tasks.json"), "{}").unwrap();
        let mut store = TaskStore::new(dir.path().join("tasks.json"), dir.path().join("retries.json")).unwrap();
        let agent: Arc<dyn CodeAgent> = Arc::new(MockCodeAgent::new(vec![]));
        let apply: Arc<dyn ApplyPrimitive> = Arc::new(AlwaysApply);
        let runner: Arc<dyn TestRunner> = Arc::new(ScriptedTestRunner::new(vec![]));
        let bus = EventBus::new(100);

        let mut graph = StepGraph {
            task_store: &mut store,
            agent: &agent,
            apply_primitive: &apply,
            test_runner: &runner,
            bus: &bus,
            working_dir: dir.path(),
            test_command: "true".into(),
            test_timeout: Duration::from_secs(1),
            active_set_filter: None,
        };

        let state = graph.run_iteration().await;
        assert!(state.no_tasks);
    }
}
