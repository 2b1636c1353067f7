//! Configuration types and the fallback-chain loader (§6 external
//! interfaces). Mirrors the teacher's `Config::load` — explicit path, then
//! project-local file, then user config dir, then compiled-in defaults —
//! generalized to the fields the Iteration Runner, the step graph, and the
//! PRD-Set Orchestrator each read.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `.devloop.yml` or a user config dir
/// and overlaid per-set/per-phase by [`crate::orchestrator::apply_overlay_cascade`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub concurrency: ConcurrencyConfig,
    pub testing: TestingConfig,
    pub runner: RunnerSettings,
    pub storage: StorageConfig,
}

impl Config {
    /// Load with fallback chain: explicit path, `.devloop.yml` in the
    /// project root, `~/.config/devloop/devloop.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".devloop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("failed to load config from {}: {e}", local_config.display()),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("devloop").join("devloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("failed to load config from {}: {e}", user_config.display()),
                }
            }
        }

        tracing::info!("no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("failed to parse config file")?;
        tracing::info!("loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse the raw JSON `config:` subtree a PRD or PRD-set overlay
    /// document carries, for use with [`crate::orchestrator::apply_overlay_cascade`].
    pub fn to_overlay_base(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// External code-generation agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub provider: String,
    pub model: String,
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
    /// Shell command invoked per code-generation/JSON-repair call (§1 out of
    /// scope: the actual model call). Empty means no agent is configured.
    #[serde(default)]
    pub command: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            timeout_ms: 300_000,
            command: String::new(),
        }
    }
}

/// Bounds on parallel work across the PRD-Set Orchestrator and the step
/// graph's own dispatch (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,
    #[serde(rename = "parallel-threshold")]
    pub parallel_threshold: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_concurrency: 1,
            parallel_threshold: 2,
        }
    }
}

/// Test-runner invocation defaults (§5 timeouts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    pub command: String,
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            command: "cargo test".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Iteration Runner tunables (§4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,
    #[serde(rename = "max-task-retries")]
    pub max_task_retries: u32,
    #[serde(rename = "handoff-interval")]
    pub handoff_interval: u32,
    #[serde(rename = "context-threshold-percent")]
    pub context_threshold_percent: f64,
    #[serde(rename = "context-window-size")]
    pub context_window_size: u64,
    #[serde(rename = "stall-window")]
    pub stall_window: u32,
    #[serde(rename = "env-probe-timeout-secs")]
    pub env_probe_timeout_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_task_retries: 3,
            handoff_interval: 5,
            context_threshold_percent: 90.0,
            context_window_size: 200_000,
            stall_window: 5,
            env_probe_timeout_secs: 60,
        }
    }
}

/// On-disk layout under the working directory (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "devloop-dir")]
    pub devloop_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            devloop_dir: ".devloop".to_string(),
        }
    }
}
