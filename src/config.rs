//! Configuration for the faceless pipeline.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FACELESS_HOME, FACELESS_DATA_DIR)
//! 2. Config file (.faceless/config.yaml)
//! 3. Defaults (~/.faceless)
//!
//! Config file discovery:
//! - Searches current directory and parents for .faceless/config.yaml
//! - Paths in config file are relative to the directory containing .faceless/
//!
//! The resolved configuration is handed explicitly to the engine, the stage
//! registry and the worker; nothing below the CLI reads it globally.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::domain::{PrivacyStatus, StageName};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".faceless";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub stages: StageSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Data directory (relative to the project root)
    pub data_dir: Option<String>,
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Topic exchange all lifecycle events are routed through
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Journal persistent messages under `<data_dir>/events/`
    #[serde(default = "default_journal")]
    pub journal: bool,
}

fn default_exchange() -> String {
    "faceless-pipeline".to_string()
}

fn default_journal() -> bool {
    true
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            journal: default_journal(),
        }
    }
}

/// Job queue settings (the outer, run-level retry layer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Deliveries of one job before it is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Requeue delay after the first failed delivery; doubles afterwards
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Runs processed at the same time by one worker
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long a claim stays valid without a heartbeat. A running job whose
    /// lease has run out is claimable again.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_concurrency() -> usize {
    2
}

fn default_lease_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_concurrency(),
            lease_ms: default_lease_ms(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// Settings threaded into stage inputs and stage implementations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// TTS voice name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// TTS speaking rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,

    /// Footage laid under the narration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_video: Option<PathBuf>,

    #[serde(default)]
    pub privacy_status: PrivacyStatus,

    #[serde(default = "default_category_id")]
    pub category_id: Option<String>,

    /// Stage name to base URL of a remote stage service
    #[serde(default)]
    pub endpoints: BTreeMap<StageName, String>,

    /// Per-call timeout for remote stage services
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Where local stage implementations write media files
    #[serde(default)]
    pub output_dir: PathBuf,
}

fn default_category_id() -> Option<String> {
    Some("22".to_string())
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            voice: None,
            speed: None,
            background_video: None,
            privacy_status: PrivacyStatus::default(),
            category_id: default_category_id(),
            endpoints: BTreeMap::new(),
            timeout_seconds: default_timeout_seconds(),
            output_dir: PathBuf::new(),
        }
    }
}

impl StageSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Root of all persisted data (state, artifacts, events, queue)
    pub data_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub events: EventsConfig,
    pub queue: QueueConfig,
    pub stages: StageSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `data_dir`, without consulting files or environment
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let stages = StageSettings {
            output_dir: data_dir.clone(),
            ..Default::default()
        };

        Self {
            data_dir,
            config_file: None,
            retry: RetryPolicy::default(),
            events: EventsConfig::default(),
            queue: QueueConfig::default(),
            stages,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.jsonl")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Data directory override from the environment, if any
fn env_data_dir() -> Option<PathBuf> {
    std::env::var("FACELESS_HOME")
        .or_else(|_| std::env::var("FACELESS_DATA_DIR"))
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Combine an optional config file with an optional environment override
fn resolve(config_file: Option<PathBuf>, env_data_dir: Option<PathBuf>) -> Result<ResolvedConfig> {
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let data_dir = match (env_data_dir, &config_file, &file.paths.data_dir) {
        (Some(dir), _, _) => dir,
        (None, Some(path), Some(data_dir)) => {
            // Project root is the parent of .faceless/
            let base_dir = path
                .parent()
                .and_then(|p| p.parent())
                .unwrap_or(Path::new("."));
            resolve_path(base_dir, data_dir)
        }
        _ => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR),
    };

    let mut stages = file.stages;
    if stages.output_dir.as_os_str().is_empty() {
        stages.output_dir = data_dir.clone();
    } else if stages.output_dir.is_relative() {
        stages.output_dir = data_dir.join(&stages.output_dir);
    }

    Ok(ResolvedConfig {
        data_dir,
        config_file,
        retry: file.retry,
        events: file.events,
        queue: file.queue,
        stages,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    resolve(find_config_file(&cwd), env_data_dir())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
