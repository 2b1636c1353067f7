//! Core data model shared by every subsystem.
//!
//! Nothing in this module touches disk or the network; it is pure types plus
//! the small amount of behaviour (status predicates, id generation) that the
//! rest of the crate builds on.

mod event;
mod id;
mod prd;
mod task;
mod workflow;

pub use event::{Event, EventContext, EventSeverity, EventType};
pub use id::{base_task_id, generate_event_id, generate_fix_task_id, substitute_id_pattern};
pub use prd::{
    ExecutionLevel, Phase as PrdPhase, PhaseStatus as PrdPhaseStatus, Prd, PrdDependency, PrdSet, PrdStatus,
};
pub use task::{Priority, RetryLedger, Task, TaskStatus, TaskType};
pub use workflow::{
    ApplyOutcome, ApplyResult, CodeChanges, FileChange, FileOperation, HandoffContext, LogAnalysis, Patch,
    TaskContext, TestResult, WorkflowState, WorkflowStatus,
};
