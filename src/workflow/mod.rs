//! Per-iteration inner workflow: external collaborator boundaries plus the
//! step graph that drives them (§1, §4.E).

mod agent;
mod apply;
mod filesystem_apply;
mod json_extract;
mod process_agent;
mod process_test_runner;
mod step_graph;
mod test_runner;

pub use agent::{AgentResponse, CodeAgent};
pub use apply::{ApplyPrimitive, check_boundary, validate_patch_uniqueness};
pub use filesystem_apply::FilesystemApplyPrimitive;
pub use json_extract::{ExtractStrategy, extract_sync, extract_with_fallback};
pub use process_agent::ProcessCodeAgent;
pub use process_test_runner::ProcessTestRunner;
pub use step_graph::StepGraph;
pub use test_runner::TestRunner;

#[cfg(test)]
pub use agent::mock::MockCodeAgent;
#[cfg(test)]
pub use apply::mock::RecordingApplyPrimitive;
#[cfg(test)]
pub use test_runner::mock::ScriptedTestRunner;
