//! Metrics Bridge: the Event Bus's sole privileged subscriber (§4.C).
//!
//! Folds events into an in-memory [`MetricAggregate`] and batches writes to
//! `.devloop/metrics.json` every 5 s and on [`MetricsBridge::stop`]. Mirrors
//! the teacher's `StateManager` actor shape: a background task owning a
//! `Mutex`-guarded aggregate, driven by a `tokio::time::interval` plus an
//! explicit shutdown notification.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::domain::{Event, EventType};
use crate::error::CoreResult;
use crate::events::EventBus;
use crate::store::atomic::write_json_atomic;

use super::aggregate::MetricAggregate;
use super::cost::PricingTable;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const STALE_SET_AFTER: chrono::Duration = chrono::Duration::hours(1);
const BUILD_METRICS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetStatus {
    Pending,
    InProgress,
    Complete,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdSetMetricsData {
    pub prd_set_id: String,
    pub status: SetStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// One build-hook span (§4.C `build:started`/`build:completed`), from a
/// post-apply build kickoff to the pre-test hook that follows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetricsData {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prd_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct BuildMetricsFile<'a> {
    version: u32,
    last_updated: DateTime<Utc>,
    builds: &'a [BuildMetricsData],
}

struct Inner {
    aggregate: MetricAggregate,
    dirty: HashSet<String>,
    set_activity: std::collections::HashMap<String, PrdSetMetricsData>,
    builds: Vec<BuildMetricsData>,
    builds_dirty: bool,
}

/// Owns `metrics.json`, `prd-set-metrics.json`, and `build-metrics.json`
/// exclusively; every other component only emits, never writes these files.
pub struct MetricsBridge {
    inner: Mutex<Inner>,
    metrics_path: PathBuf,
    prd_set_metrics_path: PathBuf,
    build_metrics_path: PathBuf,
    pricing: PricingTable,
    shutdown: Notify,
    listener: std::sync::Mutex<Option<(Arc<EventBus>, u64)>>,
}

impl MetricsBridge {
    pub fn new(devloop_dir: impl Into<PathBuf>) -> Self {
        let devloop_dir = devloop_dir.into();
        Self {
            inner: Mutex::new(Inner {
                aggregate: MetricAggregate::default(),
                dirty: HashSet::new(),
                set_activity: std::collections::HashMap::new(),
                builds: Vec::new(),
                builds_dirty: false,
            }),
            metrics_path: devloop_dir.join("metrics.json"),
            prd_set_metrics_path: devloop_dir.join("prd-set-metrics.json"),
            build_metrics_path: devloop_dir.join("build-metrics.json"),
            pricing: PricingTable::with_defaults(),
            shutdown: Notify::new(),
            listener: std::sync::Mutex::new(None),
        }
    }

    /// Subscribe to `bus` and spawn the 5 s flush loop. The returned handle
    /// should be detached or awaited at shutdown.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
        let bridge = self.clone();
        let token = bus.add_listener(move |event: &Event| {
            let bridge = bridge.clone();
            let event = event.clone();
            tokio::spawn(async move {
                bridge.record(&event).await;
            });
        });
        *self.listener.lock().expect("listener mutex poisoned") = Some((bus.clone(), token));

        let bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        bridge.reap_stale_sets().await;
                        if let Err(e) = bridge.flush().await {
                            warn!(error = %e, "metrics flush failed");
                        }
                    }
                    _ = bridge.shutdown.notified() => {
                        if let Err(e) = bridge.flush().await {
                            warn!(error = %e, "final metrics flush failed");
                        }
                        break;
                    }
                }
            }
        })
    }

    async fn record(&self, event: &Event) {
        let mut inner = self.inner.lock().await;
        match event.event_type {
            EventType::BuildStarted => {
                let stage = event.data.get("stage").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                inner.builds.push(BuildMetricsData {
                    stage,
                    task_id: event.task_id.clone(),
                    prd_id: event.prd_id.clone(),
                    started_at: event.timestamp,
                    completed_at: None,
                });
                inner.builds_dirty = true;
            }
            EventType::BuildCompleted => {
                if let Some(open) = inner
                    .builds
                    .iter_mut()
                    .rev()
                    .find(|b| b.completed_at.is_none() && b.task_id == event.task_id)
                {
                    open.completed_at = Some(event.timestamp);
                    inner.builds_dirty = true;
                }
            }
            _ => {}
        }
        if let Some(id) = inner.aggregate.apply_event(event) {
            inner.dirty.insert(id);
        }
    }

    /// Mark a PRD-set as active with a start time, so reaping can detect
    /// staleness. Called by the orchestrator when it begins a set.
    pub async fn mark_set_started(&self, prd_set_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.set_activity.insert(
            prd_set_id.to_string(),
            PrdSetMetricsData {
                prd_set_id: prd_set_id.to_string(),
                status: SetStatus::InProgress,
                start_time: Utc::now(),
                end_time: None,
            },
        );
    }

    pub async fn mark_set_complete(&self, prd_set_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.set_activity.get_mut(prd_set_id) {
            entry.status = SetStatus::Complete;
            entry.end_time = Some(Utc::now());
        }
    }

    /// On startup and each tick, close out any `in-progress` set whose last
    /// activity is older than one hour as `blocked` (§4.C).
    async fn reap_stale_sets(&self) {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        for entry in inner.set_activity.values_mut() {
            if entry.status != SetStatus::InProgress {
                continue;
            }
            let last_activity = entry.end_time.unwrap_or(entry.start_time);
            if now - last_activity > STALE_SET_AFTER {
                warn!(prd_set_id = %entry.prd_set_id, "reaping stale in-progress set");
                entry.status = SetStatus::Blocked;
                entry.end_time = Some(now);
            }
        }
    }

    pub fn estimate_cost_usd(&self, provider: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.pricing.estimate_cost_usd(provider, tokens_in, tokens_out)
    }

    async fn flush(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.dirty.is_empty() && !inner.builds_dirty {
            return Ok(());
        }
        if !inner.dirty.is_empty() {
            write_json_atomic(&self.metrics_path, &inner.aggregate)?;
            let sets: Vec<&PrdSetMetricsData> = inner.set_activity.values().collect();
            write_json_atomic(&self.prd_set_metrics_path, &sets)?;
            inner.dirty.clear();
        }
        if inner.builds_dirty {
            let file = BuildMetricsFile {
                version: BUILD_METRICS_VERSION,
                last_updated: Utc::now(),
                builds: &inner.builds,
            };
            write_json_atomic(&self.build_metrics_path, &file)?;
            inner.builds_dirty = false;
        }
        info!("metrics flushed");
        Ok(())
    }

    /// Flush pending saves and stop the background loop (§5 cancellation).
    pub fn stop(&self) {
        self.shutdown.notify_one();
        if let Some((bus, token)) = self.listener.lock().expect("listener mutex poisoned").take() {
            bus.remove_listener(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventContext, EventSeverity, EventType};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_events_without_flushing_until_dirty() {
        let dir = tempdir().unwrap();
        let bridge = MetricsBridge::new(dir.path());
        let event = Event::new(
            1,
            EventType::TaskCompleted,
            EventSeverity::Info,
            json!({}),
            EventContext {
                prd_id: Some("P1".into()),
                ..Default::default()
            },
        );
        bridge.record(&event).await;
        let inner = bridge.inner.lock().await;
        assert!(inner.dirty.contains("P1"));
        assert_eq!(inner.aggregate.prds["P1"].tasks_completed, 1);
    }

    #[tokio::test]
    async fn stale_in_progress_set_is_reaped_as_blocked() {
        let dir = tempdir().unwrap();
        let bridge = MetricsBridge::new(dir.path());
        {
            let mut inner = bridge.inner.lock().await;
            inner.set_activity.insert(
                "P0".to_string(),
                PrdSetMetricsData {
                    prd_set_id: "P0".to_string(),
                    status: SetStatus::InProgress,
                    start_time: Utc::now() - chrono::Duration::hours(2),
                    end_time: None,
                },
            );
        }
        bridge.reap_stale_sets().await;
        let inner = bridge.inner.lock().await;
        assert_eq!(inner.set_activity["P0"].status, SetStatus::Blocked);
    }

    #[tokio::test]
    async fn flush_writes_metrics_file_when_dirty() {
        let dir = tempdir().unwrap();
        let bridge = MetricsBridge::new(dir.path());
        let event = Event::new(
            1,
            EventType::TaskCompleted,
            EventSeverity::Info,
            json!({}),
            EventContext {
                prd_id: Some("P1".into()),
                ..Default::default()
            },
        );
        bridge.record(&event).await;
        bridge.flush().await.unwrap();
        assert!(dir.path().join("metrics.json").exists());
    }

    #[tokio::test]
    async fn build_started_and_completed_are_folded_into_one_span() {
        let dir = tempdir().unwrap();
        let bridge = MetricsBridge::new(dir.path());
        let ctx = EventContext {
            task_id: Some("T1".into()),
            ..Default::default()
        };
        bridge
            .record(&Event::new(1, EventType::BuildStarted, EventSeverity::Info, json!({"stage": "post_apply"}), ctx.clone()))
            .await;
        bridge
            .record(&Event::new(2, EventType::BuildCompleted, EventSeverity::Info, json!({"stage": "pre_test"}), ctx))
            .await;
        {
            let inner = bridge.inner.lock().await;
            assert_eq!(inner.builds.len(), 1);
            assert!(inner.builds[0].completed_at.is_some());
        }
        bridge.flush().await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("build-metrics.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["builds"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["builds"][0]["task_id"], "T1");
    }
}
