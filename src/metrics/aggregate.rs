//! In-memory metric aggregates folded from Event Bus traffic (§3, §4.C).
//!
//! Every counter here is monotonically non-decreasing and every rolling
//! average is recomputed from a running total divided by a running count —
//! never from the incoming sample alone — per the persisted-document
//! invariant in §4.C.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Event, EventType};

fn bump_average(avg: &mut f64, count: &mut u64, sample: f64) {
    let total = *avg * (*count as f64) + sample;
    *count += 1;
    *avg = total / (*count as f64);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonParsingMetrics {
    pub total_attempts: u64,
    pub direct: u64,
    pub retry: u64,
    pub sanitized: u64,
    pub ai_fallback: u64,
    pub avg_parse_duration_ms: f64,
}

impl JsonParsingMetrics {
    fn record_attempt(&mut self) {
        self.total_attempts += 1;
    }

    fn record_success(&mut self, retry_count: u32, strategy: &str, duration_ms: f64) {
        if strategy.contains("ai_fallback") {
            self.ai_fallback += 1;
        } else if strategy.contains("sanitize") {
            self.sanitized += 1;
        } else if retry_count == 0 {
            self.direct += 1;
        } else {
            self.retry += 1;
        }
        let mut n = self.direct + self.retry + self.sanitized + self.ai_fallback;
        if n == 0 {
            n = 1;
        }
        let mut count = n - 1;
        bump_average(&mut self.avg_parse_duration_ms, &mut count, duration_ms);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileFilterMetrics {
    pub files_filtered: u64,
    pub files_allowed: u64,
    pub boundary_violations: u64,
    pub created: u64,
    pub modified: u64,
    pub avg_filter_time_ms: f64,
    filter_samples: u64,
}

impl FileFilterMetrics {
    fn record(&mut self, kind: &str, duration_ms: Option<f64>) {
        match kind {
            "filtered" | "filtered_predictive" => self.files_filtered += 1,
            "boundary_violation" => self.boundary_violations += 1,
            "created" => self.created += 1,
            "modified" => self.modified += 1,
            _ => {}
        }
        self.files_allowed = self.files_filtered + self.created + self.modified;
        if let Some(ms) = duration_ms {
            bump_average(&mut self.avg_filter_time_ms, &mut self.filter_samples, ms);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub passed: u64,
    pub failed: u64,
    pub error_categories: HashMap<String, u64>,
    pub recovery_suggestions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpcMetrics {
    pub connection_failed: u64,
    pub connection_retry: u64,
    pub health_checks: u64,
    pub avg_retry_time_ms: f64,
    retry_samples: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrdCounters {
    pub code_generated: u64,
    pub generation_failed: u64,
    pub tests_run: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_blocked: u64,
    pub changes_applied: u64,
    pub failures_analyzed: u64,
    pub fix_tasks_created: u64,
    pub patterns_learned: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeckitCounters {
    pub context_injections: u64,
}

/// Hierarchical (prdSetId, prdId, phaseId, taskId) counters and timings, one
/// instance per process per owning component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub json: JsonParsingMetrics,
    pub file: FileFilterMetrics,
    pub validation: ValidationMetrics,
    pub ipc: IpcMetrics,
    pub prds: HashMap<String, PrdCounters>,
    pub sets: HashMap<String, SpeckitCounters>,
}

impl MetricAggregate {
    /// Fold one event into the aggregate. Returns the prd/set id touched,
    /// if any, so the bridge can mark it dirty for the next flush.
    pub fn apply_event(&mut self, event: &Event) -> Option<String> {
        let prefix = event.event_type.prefix();
        let suffix = event.event_type.as_str().split(':').nth(1).unwrap_or("");

        match prefix {
            "json" => {
                self.json.record_attempt();
                if suffix == "parse_success" {
                    let retry_count = event.data.get("retryCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    let strategy = event.data.get("strategy").and_then(|v| v.as_str()).unwrap_or("");
                    let duration_ms = event.data.get("durationMs").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    self.json.record_success(retry_count, strategy, duration_ms);
                }
                None
            }
            "file" => {
                let duration_ms = event.data.get("durationMs").and_then(|v| v.as_f64());
                self.file.record(suffix, duration_ms);
                None
            }
            "validation" => {
                match suffix {
                    "passed" => self.validation.passed += 1,
                    "failed" => self.validation.failed += 1,
                    "error_with_suggestion" => self.validation.recovery_suggestions += 1,
                    _ => {}
                }
                if let Some(category) = event.data.get("category").and_then(|v| v.as_str()) {
                    *self.validation.error_categories.entry(category.to_string()).or_insert(0) += 1;
                }
                None
            }
            "ipc" => {
                match suffix {
                    "connection_failed" => self.ipc.connection_failed += 1,
                    "connection_retry" => {
                        self.ipc.connection_retry += 1;
                        if let Some(ms) = event.data.get("retryTimeMs").and_then(|v| v.as_f64()) {
                            bump_average(&mut self.ipc.avg_retry_time_ms, &mut self.ipc.retry_samples, ms);
                        }
                    }
                    "health_check" => self.ipc.health_checks += 1,
                    _ => {}
                }
                None
            }
            "speckit" => {
                let set_id = event.prd_id.clone().unwrap_or_default();
                self.sets.entry(set_id.clone()).or_default().context_injections += 1;
                Some(set_id)
            }
            _ if matches!(
                event.event_type,
                EventType::AgentCodeGenerated
                    | EventType::AgentGenerationFailed
                    | EventType::TestPassed
                    | EventType::TestFailed
                    | EventType::TaskStarted
                    | EventType::TaskCompleted
                    | EventType::TaskFailed
                    | EventType::TaskBlocked
                    | EventType::ChangesApplied
                    | EventType::FailureAnalyzed
                    | EventType::FixTaskCreated
                    | EventType::PatternLearned
            ) =>
            {
                let prd_id = event.prd_id.clone().unwrap_or_default();
                let counters = self.prds.entry(prd_id.clone()).or_default();
                match event.event_type {
                    EventType::AgentCodeGenerated => counters.code_generated += 1,
                    EventType::AgentGenerationFailed => counters.generation_failed += 1,
                    EventType::TestPassed => {
                        counters.tests_run += 1;
                        counters.tests_passed += 1;
                    }
                    EventType::TestFailed => {
                        counters.tests_run += 1;
                        counters.tests_failed += 1;
                    }
                    EventType::TaskStarted => counters.tasks_started += 1,
                    EventType::TaskCompleted => counters.tasks_completed += 1,
                    EventType::TaskFailed => counters.tasks_failed += 1,
                    EventType::TaskBlocked => counters.tasks_blocked += 1,
                    EventType::ChangesApplied => counters.changes_applied += 1,
                    EventType::FailureAnalyzed => counters.failures_analyzed += 1,
                    EventType::FixTaskCreated => counters.fix_tasks_created += 1,
                    EventType::PatternLearned => counters.patterns_learned += 1,
                    _ => {}
                }
                if let Some(tokens_in) = event.data.get("tokensIn").and_then(|v| v.as_u64()) {
                    counters.tokens_in += tokens_in;
                }
                if let Some(tokens_out) = event.data.get("tokensOut").and_then(|v| v.as_u64()) {
                    counters.tokens_out += tokens_out;
                }
                Some(prd_id)
            }
            _ => None,
        }
    }
}
