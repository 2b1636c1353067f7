//! Outer control loop (§4.F): handoff → fresh workflow → persist learnings
//! → update patterns → continue/stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::domain::{EventContext, EventSeverity, EventType, TaskStatus, WorkflowStatus};
use crate::events::EventBus;
use crate::store::TaskStore;
use crate::workflow::{ApplyPrimitive, CodeAgent, StepGraph, TestRunner};

use super::handoff::{HandoffWriter, build_handoff_context};

/// Why the outer loop stopped (§4.F "Termination").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Complete,
    MaxIterations,
    Stalled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_iterations: u32,
    pub max_task_retries: u32,
    pub handoff_interval: u32,
    pub context_threshold_percent: f64,
    pub context_window_size: u64,
    pub stall_window: u32,
    pub persist_learnings: bool,
    pub update_patterns: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_task_retries: 3,
            handoff_interval: 5,
            context_threshold_percent: 90.0,
            context_window_size: 200_000,
            stall_window: 5,
            persist_learnings: true,
            update_patterns: true,
        }
    }
}

pub struct IterationRunner {
    task_store: TaskStore,
    agent: Arc<dyn CodeAgent>,
    apply_primitive: Arc<dyn ApplyPrimitive>,
    test_runner: Arc<dyn TestRunner>,
    bus: Arc<EventBus>,
    handoff: HandoffWriter,
    config: RunnerConfig,
    working_dir: PathBuf,
    test_command: String,
    test_timeout: Duration,
    active_set_filter: Option<String>,
}

impl IterationRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_store: TaskStore,
        agent: Arc<dyn CodeAgent>,
        apply_primitive: Arc<dyn ApplyPrimitive>,
        test_runner: Arc<dyn TestRunner>,
        bus: Arc<EventBus>,
        handoff: HandoffWriter,
        config: RunnerConfig,
        working_dir: PathBuf,
        test_command: String,
        test_timeout: Duration,
        active_set_filter: Option<String>,
    ) -> Self {
        Self {
            task_store,
            agent,
            apply_primitive,
            test_runner,
            bus,
            handoff,
            config,
            working_dir,
            test_command,
            test_timeout,
            active_set_filter,
        }
    }

    fn all_tasks_complete(&self) -> bool {
        self.task_store.get_pending_tasks(self.active_set_filter.as_deref()).is_empty()
    }

    fn task_snapshot(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let all = self.task_store.get_all_tasks();
        let completed = all.iter().filter(|t| t.status == TaskStatus::Done).map(|t| t.id.clone()).collect();
        let pending = all
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .map(|t| t.id.clone())
            .collect();
        let blocked = all.iter().filter(|t| t.status == TaskStatus::Blocked).map(|t| t.id.clone()).collect();
        (completed, pending, blocked)
    }

    fn handoff_policy_triggers(&self, iteration: u32, tokens_in: u64, tokens_out: u64) -> bool {
        let interval_hit = self.config.handoff_interval > 0 && iteration % self.config.handoff_interval == 0;
        let usage = if self.config.context_window_size == 0 {
            0.0
        } else {
            ((tokens_in + tokens_out) as f64 / self.config.context_window_size as f64) * 100.0
        };
        interval_hit || usage.clamp(0.0, 100.0) > self.config.context_threshold_percent
    }

    /// Drive iterations until a terminal condition is reached (§4.F).
    pub async fn run(&mut self) -> TerminationReason {
        let mut iteration = 0u32;
        let mut cumulative_tokens_in = 0u64;
        let mut cumulative_tokens_out = 0u64;
        let mut files_modified_session: Vec<String> = Vec::new();
        let mut recent_learnings: Vec<String> = Vec::new();
        let mut recent_patterns: Vec<String> = Vec::new();
        let mut iterations_without_progress = 0u32;

        loop {
            if self.all_tasks_complete() {
                return TerminationReason::Complete;
            }

            iteration += 1;
            if iteration > self.config.max_iterations {
                return TerminationReason::MaxIterations;
            }

            let (completed, pending, blocked) = self.task_snapshot();
            let handoff_ctx = build_handoff_context(
                iteration,
                completed,
                pending,
                blocked,
                recent_learnings.clone(),
                recent_patterns.clone(),
                files_modified_session.clone(),
                cumulative_tokens_in,
                cumulative_tokens_out,
                self.config.context_window_size,
            );
            let _ = self.handoff.write_handoff_document(&handoff_ctx);

            self.bus.emit(EventType::IterationStarted, EventSeverity::Info, json!({ "iteration": iteration }), EventContext::default());

            let state = {
                let mut graph = StepGraph {
                    task_store: &mut self.task_store,
                    agent: &self.agent,
                    apply_primitive: &self.apply_primitive,
                    test_runner: &self.test_runner,
                    bus: &self.bus,
                    working_dir: &self.working_dir,
                    test_command: self.test_command.clone(),
                    test_timeout: self.test_timeout,
                    active_set_filter: self.active_set_filter.clone(),
                };
                graph.run_iteration().await
            };

            cumulative_tokens_in += state.tokens_in;
            cumulative_tokens_out += state.tokens_out;
            files_modified_session.extend(state.files_modified.iter().cloned());
            recent_learnings.extend(state.learnings.iter().cloned());
            recent_patterns.extend(state.discovered_patterns.iter().cloned());

            if self.config.persist_learnings {
                let _ = self.handoff.append_progress(iteration, &state);
            }
            if self.config.update_patterns && !state.discovered_patterns.is_empty() {
                let _ = self.handoff.merge_patterns(&state.discovered_patterns);
            }

            self.bus.emit(
                EventType::IterationCompleted,
                EventSeverity::Info,
                json!({ "iteration": iteration, "status": format!("{:?}", state.status) }),
                EventContext::default(),
            );

            match state.status {
                WorkflowStatus::Complete if state.no_tasks => {
                    return TerminationReason::Complete;
                }
                WorkflowStatus::Complete => {
                    if let Some(task) = &state.task {
                        let _ = self.task_store.reset_retry(&task.id);
                    }
                    iterations_without_progress = 0;
                }
                WorkflowStatus::Failed => {
                    if let Some(task) = &state.task {
                        let retries = self.task_store.retry_count(&task.id);
                        if retries > self.config.max_task_retries {
                            let _ = self.task_store.update_task_status(&task.id, TaskStatus::Blocked);
                            self.bus.emit(EventType::TaskBlocked, EventSeverity::Warn, json!({}), EventContext {
                                task_id: Some(task.id.clone()),
                                ..Default::default()
                            });
                        }
                    }
                    iterations_without_progress += 1;
                }
                _ => {}
            }

            if self.handoff_policy_triggers(iteration, cumulative_tokens_in, cumulative_tokens_out) {
                self.bus.emit(EventType::ContextHandoffTriggered, EventSeverity::Info, json!({}), EventContext::default());
                files_modified_session.clear();
            }

            if iterations_without_progress >= self.config.stall_window {
                return TerminationReason::Stalled;
            }
        }
    }
}
