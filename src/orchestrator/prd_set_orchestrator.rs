//! PRD-Set Orchestrator (§4.G): drives a validated DAG of PRDs level by
//! level, dispatching each level's runnable members with bounded fan-out and
//! persisting `prd-set-state.json` after every level settles.
//!
//! Invoking a PRD's own fresh-context run is delegated through
//! [`PrdExecutor`] rather than embedded here, the same way the teacher's
//! loop manager treats a single loop's execution as a callback its set-level
//! coordinator never inlines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::domain::{EventContext, EventSeverity, EventType, Prd};
use crate::events::EventBus;
use crate::resolver::{DagError, PrdDag};
use crate::store::atomic::write_json_atomic;

/// Outcome of running a single PRD to completion with a fresh context.
#[derive(Debug, Clone)]
pub enum PrdOutcome {
    Complete,
    Blocked(String),
    Failed(String),
}

/// The boundary between the set-level orchestrator and whatever actually
/// runs a PRD (an Iteration Runner wired with its own task store and
/// collaborators). Kept abstract so the orchestrator's level/fan-out logic
/// is testable without constructing a full runner.
#[async_trait]
pub trait PrdExecutor: Send + Sync {
    async fn run_with_fresh_context(&self, prd: &Prd) -> PrdOutcome;
}

/// Checks whether a PRD's prerequisites (target files/modules exist,
/// environment readiness, test infrastructure present) are satisfied before
/// it is allowed to start.
pub trait PrerequisiteChecker: Send + Sync {
    fn check(&self, prd: &Prd) -> Result<(), String>;
}

/// A checker that never blocks; useful where prerequisite validation is out
/// of scope for the caller (e.g. unit tests of the dispatch logic itself).
pub struct AlwaysReady;

impl PrerequisiteChecker for AlwaysReady {
    fn check(&self, _prd: &Prd) -> Result<(), String> {
        Ok(())
    }
}

/// Checks that a PRD's declared test directory exists under the working
/// directory before the PRD is allowed to start.
pub struct FilesystemPrerequisiteChecker {
    working_dir: PathBuf,
}

impl FilesystemPrerequisiteChecker {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self { working_dir: working_dir.into() }
    }
}

impl PrerequisiteChecker for FilesystemPrerequisiteChecker {
    fn check(&self, prd: &Prd) -> Result<(), String> {
        let testing_dir = self.working_dir.join(&prd.testing_dir);
        if !testing_dir.exists() {
            return Err(format!("testing directory {} does not exist", testing_dir.display()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrdSetEntryStatus {
    Pending,
    Running,
    Complete,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdSetEntry {
    pub status: PrdSetEntryStatus,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl PrdSetEntry {
    fn pending() -> Self {
        Self {
            status: PrdSetEntryStatus::Pending,
            start_time: None,
            end_time: None,
        }
    }
}

/// Overall verdict for a set once every level has settled: complete iff
/// every PRD completed, failed iff none completed and at least one failed,
/// blocked otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Complete,
    Failed,
    Blocked,
}

#[derive(Serialize)]
struct ActiveSet<'a> {
    #[serde(rename = "prdSetId")]
    prd_set_id: &'a str,
}

#[derive(Serialize)]
struct ExecutionState<'a> {
    active: Option<ActiveSet<'a>>,
}

pub struct PrdSetOrchestrator {
    state_path: PathBuf,
    execution_state_path: PathBuf,
    max_concurrent: usize,
    bus: Arc<EventBus>,
}

impl PrdSetOrchestrator {
    pub fn new(devloop_dir: impl Into<PathBuf>, max_concurrent: usize, bus: Arc<EventBus>) -> Self {
        let devloop_dir = devloop_dir.into();
        Self {
            state_path: devloop_dir.join("prd-set-state.json"),
            execution_state_path: devloop_dir.join("execution-state.json"),
            max_concurrent: max_concurrent.max(1),
            bus,
        }
    }

    /// Drive `prds` level by level. A cycle is rejected before anything
    /// runs. Within a level, PRDs whose dependencies are all complete are
    /// dispatched in chunks bounded by `max_concurrent`; the next level
    /// never starts before the current one fully settles. `prd_set_id`
    /// identifies this run in `execution-state.json` (§6) while it is
    /// active; the pointer is cleared once the set settles.
    pub async fn run_set(
        &self,
        prd_set_id: &str,
        prds: &[Prd],
        executor: &dyn PrdExecutor,
        prerequisites: &dyn PrerequisiteChecker,
    ) -> Result<SetOutcome, DagError> {
        let dag = PrdDag::new(prds);
        let levels = dag.execution_levels()?;

        self.persist_execution_state(Some(prd_set_id));
        let outcome = self.run_levels(prds, &levels, executor, prerequisites).await;
        self.persist_execution_state(None);
        Ok(outcome)
    }

    async fn run_levels(
        &self,
        prds: &[Prd],
        levels: &[Vec<String>],
        executor: &dyn PrdExecutor,
        prerequisites: &dyn PrerequisiteChecker,
    ) -> SetOutcome {
        let mut states: HashMap<String, PrdSetEntry> =
            prds.iter().map(|p| (p.id.clone(), PrdSetEntry::pending())).collect();
        self.persist(&states);

        for level in levels {
            for prd_id in level {
                let Some(prd) = prds.iter().find(|p| &p.id == prd_id) else { continue };
                if let Err(reason) = prerequisites.check(prd) {
                    let entry = states.get_mut(prd_id).expect("level member was seeded above");
                    entry.status = PrdSetEntryStatus::Blocked;
                    entry.end_time = Some(Utc::now());
                    self.emit_blocked(prd_id, &reason);
                }
            }

            let runnable: Vec<&Prd> = level
                .iter()
                .filter_map(|id| {
                    if states[id].status != PrdSetEntryStatus::Pending {
                        return None;
                    }
                    let prd = prds.iter().find(|p| &p.id == id)?;
                    let deps_complete = prd
                        .dependencies
                        .iter()
                        .all(|d| states.get(d.id()).is_some_and(|s| s.status == PrdSetEntryStatus::Complete));
                    deps_complete.then_some(prd)
                })
                .collect();

            for chunk in runnable.chunks(self.max_concurrent) {
                for prd in chunk.iter().copied() {
                    let entry = states.get_mut(&prd.id).expect("runnable member was seeded above");
                    entry.status = PrdSetEntryStatus::Running;
                    entry.start_time = Some(Utc::now());
                    self.bus.emit(
                        EventType::PrdStarted,
                        EventSeverity::Info,
                        json!({}),
                        EventContext { prd_id: Some(prd.id.clone()), ..Default::default() },
                    );
                }

                let outcomes = join_all(chunk.iter().copied().map(|prd| async move {
                    let outcome = executor.run_with_fresh_context(prd).await;
                    (prd.id.clone(), outcome)
                }))
                .await;

                for (id, outcome) in outcomes {
                    let entry = states.get_mut(&id).expect("dispatched member was seeded above");
                    entry.end_time = Some(Utc::now());
                    match outcome {
                        PrdOutcome::Complete => {
                            entry.status = PrdSetEntryStatus::Complete;
                            self.bus.emit(
                                EventType::PrdCompleted,
                                EventSeverity::Info,
                                json!({}),
                                EventContext { prd_id: Some(id.clone()), ..Default::default() },
                            );
                        }
                        PrdOutcome::Blocked(reason) => {
                            entry.status = PrdSetEntryStatus::Blocked;
                            self.emit_blocked(&id, &reason);
                        }
                        PrdOutcome::Failed(reason) => {
                            entry.status = PrdSetEntryStatus::Failed;
                            self.bus.emit(
                                EventType::PrdFailed,
                                EventSeverity::Error,
                                json!({ "reason": reason }),
                                EventContext { prd_id: Some(id.clone()), ..Default::default() },
                            );
                        }
                    }
                }
            }

            self.persist(&states);
        }

        overall_outcome(&states)
    }

    fn emit_blocked(&self, prd_id: &str, reason: &str) {
        self.bus.emit(
            EventType::PrdBlocked,
            EventSeverity::Warn,
            json!({ "reason": reason }),
            EventContext { prd_id: Some(prd_id.to_string()), ..Default::default() },
        );
    }

    fn persist(&self, states: &HashMap<String, PrdSetEntry>) {
        if let Err(e) = write_json_atomic(&self.state_path, states) {
            warn!(error = %e, path = %self.state_path.display(), "failed to persist prd-set-state.json");
        }
    }

    /// Record which set (if any) is currently active (§6 `execution-state.json`).
    fn persist_execution_state(&self, prd_set_id: Option<&str>) {
        let state = ExecutionState {
            active: prd_set_id.map(|prd_set_id| ActiveSet { prd_set_id }),
        };
        if let Err(e) = write_json_atomic(&self.execution_state_path, &state) {
            warn!(error = %e, path = %self.execution_state_path.display(), "failed to persist execution-state.json");
        }
    }
}

fn overall_outcome(states: &HashMap<String, PrdSetEntry>) -> SetOutcome {
    let complete = states.values().filter(|e| e.status == PrdSetEntryStatus::Complete).count();
    let any_failed = states.values().any(|e| e.status == PrdSetEntryStatus::Failed);
    if complete == states.len() {
        SetOutcome::Complete
    } else if complete == 0 && any_failed {
        SetOutcome::Failed
    } else {
        SetOutcome::Blocked
    }
}
