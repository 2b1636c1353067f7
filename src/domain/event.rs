//! Event record and the closed type enumeration described in §3/§6.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::generate_event_id;

/// Closed set of event types, grouped by the prefix families in §3.
///
/// `Serialize`/`Deserialize` render as the `task:started` wire form via a
/// hand-rolled `as_str`/`from_str` pair rather than serde's tag machinery,
/// because the wire representation is a single colon-joined string, not a
/// struct variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskBlocked,
    PhaseStarted,
    PhaseCompleted,
    PrdStarted,
    PrdCompleted,
    PrdBlocked,
    PrdFailed,
    FileFiltered,
    FileFilteredPredictive,
    FileBoundaryViolation,
    FileCreated,
    FileModified,
    JsonParseAttempt,
    JsonParseSuccess,
    JsonParseFailure,
    ValidationPassed,
    ValidationFailed,
    ValidationErrorWithSuggestion,
    IpcConnectionFailed,
    IpcConnectionRetry,
    IpcHealthCheck,
    BuildStarted,
    BuildCompleted,
    IterationStarted,
    IterationCompleted,
    ContextHandoffTriggered,
    MetricsFlushed,
    ChangesApplied,
    HealthCheck,
    SpeckitContextInjected,
    AgentCodeGenerated,
    AgentGenerationFailed,
    FailureAnalyzed,
    FixTaskCreated,
    PatternLearned,
    TestPassed,
    TestFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStarted => "task:started",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::TaskBlocked => "task:blocked",
            Self::PhaseStarted => "phase:started",
            Self::PhaseCompleted => "phase:completed",
            Self::PrdStarted => "prd:started",
            Self::PrdCompleted => "prd:completed",
            Self::PrdBlocked => "prd:blocked",
            Self::PrdFailed => "prd:failed",
            Self::FileFiltered => "file:filtered",
            Self::FileFilteredPredictive => "file:filtered_predictive",
            Self::FileBoundaryViolation => "file:boundary_violation",
            Self::FileCreated => "file:created",
            Self::FileModified => "file:modified",
            Self::JsonParseAttempt => "json:parse_attempt",
            Self::JsonParseSuccess => "json:parse_success",
            Self::JsonParseFailure => "json:parse_failure",
            Self::ValidationPassed => "validation:passed",
            Self::ValidationFailed => "validation:failed",
            Self::ValidationErrorWithSuggestion => "validation:error_with_suggestion",
            Self::IpcConnectionFailed => "ipc:connection_failed",
            Self::IpcConnectionRetry => "ipc:connection_retry",
            Self::IpcHealthCheck => "ipc:health_check",
            Self::BuildStarted => "build:started",
            Self::BuildCompleted => "build:completed",
            Self::IterationStarted => "iteration:started",
            Self::IterationCompleted => "iteration:completed",
            Self::ContextHandoffTriggered => "context:handoff_triggered",
            Self::MetricsFlushed => "metrics:flushed",
            Self::ChangesApplied => "change:applied",
            Self::HealthCheck => "health:check",
            Self::SpeckitContextInjected => "speckit:context_injected",
            Self::AgentCodeGenerated => "agent:code_generated",
            Self::AgentGenerationFailed => "agent:generation_failed",
            Self::FailureAnalyzed => "agent:failure_analyzed",
            Self::FixTaskCreated => "task:fix_task_created",
            Self::PatternLearned => "context:pattern_learned",
            Self::TestPassed => "build:test_passed",
            Self::TestFailed => "build:test_failed",
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.as_str().split(':').next().unwrap_or("")
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "task:started" => Self::TaskStarted,
            "task:completed" => Self::TaskCompleted,
            "task:failed" => Self::TaskFailed,
            "task:blocked" => Self::TaskBlocked,
            "phase:started" => Self::PhaseStarted,
            "phase:completed" => Self::PhaseCompleted,
            "prd:started" => Self::PrdStarted,
            "prd:completed" => Self::PrdCompleted,
            "prd:blocked" => Self::PrdBlocked,
            "prd:failed" => Self::PrdFailed,
            "file:filtered" => Self::FileFiltered,
            "file:filtered_predictive" => Self::FileFilteredPredictive,
            "file:boundary_violation" => Self::FileBoundaryViolation,
            "file:created" => Self::FileCreated,
            "file:modified" => Self::FileModified,
            "json:parse_attempt" => Self::JsonParseAttempt,
            "json:parse_success" => Self::JsonParseSuccess,
            "json:parse_failure" => Self::JsonParseFailure,
            "validation:passed" => Self::ValidationPassed,
            "validation:failed" => Self::ValidationFailed,
            "validation:error_with_suggestion" => Self::ValidationErrorWithSuggestion,
            "ipc:connection_failed" => Self::IpcConnectionFailed,
            "ipc:connection_retry" => Self::IpcConnectionRetry,
            "ipc:health_check" => Self::IpcHealthCheck,
            "build:started" => Self::BuildStarted,
            "build:completed" => Self::BuildCompleted,
            "iteration:started" => Self::IterationStarted,
            "iteration:completed" => Self::IterationCompleted,
            "context:handoff_triggered" => Self::ContextHandoffTriggered,
            "metrics:flushed" => Self::MetricsFlushed,
            "change:applied" => Self::ChangesApplied,
            "health:check" => Self::HealthCheck,
            "speckit:context_injected" => Self::SpeckitContextInjected,
            "agent:code_generated" => Self::AgentCodeGenerated,
            "agent:generation_failed" => Self::AgentGenerationFailed,
            "agent:failure_analyzed" => Self::FailureAnalyzed,
            "task:fix_task_created" => Self::FixTaskCreated,
            "context:pattern_learned" => Self::PatternLearned,
            "build:test_passed" => Self::TestPassed,
            "build:test_failed" => Self::TestFailed,
            other => return Err(format!("unknown event type: {other}")),
        })
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// A single bus entry. `id` is always `evt-<wallclockms>-<seq>` and strictly
/// increasing within one bus's lifetime (§4.A, §8 invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,
}

/// Everything an emitter may attach to an event beyond type/data/severity.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub task_id: Option<String>,
    pub prd_id: Option<String>,
    pub phase_id: Option<String>,
    pub target_module: Option<String>,
}

impl Event {
    pub fn new(wallclock_ms: i64, event_type: EventType, severity: EventSeverity, data: Value, ctx: EventContext) -> Self {
        Self {
            id: generate_event_id(wallclock_ms),
            event_type,
            timestamp: Utc::now(),
            severity,
            data,
            task_id: ctx.task_id,
            prd_id: ctx.prd_id,
            phase_id: ctx.phase_id,
            target_module: ctx.target_module,
        }
    }

    /// Numeric sequence suffix, used for ordering comparisons.
    pub fn sequence(&self) -> u64 {
        self.id.rsplit('-').next().and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}
