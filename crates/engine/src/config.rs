//! Engine configuration

use clnrm_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, usually read from `clnrm.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeConfig,
    pub lifecycle: LifecycleConfig,
    pub executor: ExecutorConfig,
    pub trace: TraceConfig,
    pub scheduler: SchedulerConfig,
    pub history: HistoryConfig,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime CLI binary (docker, podman); auto-detected when unset
    pub binary: Option<String>,

    /// Container runtime socket, e.g. unix:///var/run/docker.sock
    pub socket: Option<String>,

    /// Host name steps use to reach published ports
    pub host: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            socket: None,
            host: "127.0.0.1".to_string(),
        }
    }
}

/// Service start, health and reuse configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on waiting for a service to become healthy
    #[serde(with = "humantime_serde")]
    pub health_max_wait: Duration,

    /// First health poll interval; doubles after every failed probe
    #[serde(with = "humantime_serde")]
    pub health_initial_backoff: Duration,

    /// Cap on a single health poll interval
    #[serde(with = "humantime_serde")]
    pub health_max_backoff: Duration,

    /// Release healthy instances to the reuse pool instead of stopping them
    pub reuse_containers: bool,

    /// Pooled instances idle for longer than this are stopped
    #[serde(with = "humantime_serde")]
    pub reuse_ttl: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_max_wait: Duration::from_secs(60),
            health_initial_backoff: Duration::from_millis(100),
            health_max_backoff: Duration::from_secs(2),
            reuse_containers: false,
            reuse_ttl: Duration::from_secs(300),
        }
    }
}

/// Step execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout for steps that do not declare one
    #[serde(with = "humantime_serde")]
    pub default_step_timeout: Duration,

    /// Bytes retained per output stream; older output is dropped
    pub output_buffer_bytes: usize,

    /// Chunks in flight between a process pipe and its buffer
    pub channel_capacity: usize,

    /// Time between SIGTERM and SIGKILL on timeout
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(60),
            output_buffer_bytes: 64 * 1024,
            channel_capacity: 32,
            kill_grace: Duration::from_millis(500),
        }
    }
}

/// Trace sink kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Only spans printed on step stdout
    Stdout,
    /// Collector file exporter output
    File,
    /// Jaeger-style query API
    Http,
}

/// Trace collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub sink: SinkKind,

    /// Query endpoint for the http sink
    pub endpoint: Option<String>,

    /// Export file for the file sink
    pub file: Option<PathBuf>,

    /// Upper bound on waiting for exporters to flush
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Per-request timeout for the http sink
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Stdout,
            endpoint: None,
            file: None,
            poll_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_workers: usize,
    pub max_workers: usize,

    /// Aggregate CPU cores the concurrently running tests may use
    pub cpu_ceiling: f64,

    /// Aggregate memory (MB) the concurrently running tests may use
    pub memory_ceiling_mb: f64,

    /// Tests whose risk score reaches this are flagged high-risk
    pub confidence_threshold: f64,

    /// History older than this is ignored
    pub history_window_days: i64,

    /// Age at which a historical failure counts half
    pub recency_half_life_days: f64,

    /// Optional AI oracle endpoint; the historical oracle is used when unset
    pub oracle_endpoint: Option<String>,

    #[serde(with = "humantime_serde")]
    pub oracle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            cpu_ceiling: 8.0,
            memory_ceiling_mb: 8192.0,
            confidence_threshold: 0.5,
            history_window_days: 30,
            recency_half_life_days: 7.0,
            oracle_endpoint: None,
            oracle_timeout: Duration::from_secs(5),
        }
    }
}

/// Run history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// History database; None keeps no history
    pub path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: Some(clnrm_common::default_history_path()),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Internal(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `CLNRM_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = var("CLNRM_TRACE_ENDPOINT") {
            self.trace.endpoint = Some(endpoint);
            self.trace.sink = SinkKind::Http;
        }
        if let Some(file) = var("CLNRM_TRACE_FILE") {
            self.trace.file = Some(PathBuf::from(file));
            self.trace.sink = SinkKind::File;
        }
        if let Some(socket) = var("CLNRM_CONTAINER_SOCKET") {
            self.runtime.socket = Some(socket);
        }
        if let Some(endpoint) = var("CLNRM_ORACLE_ENDPOINT") {
            self.scheduler.oracle_endpoint = Some(endpoint);
        }
        if let Some(path) = var("CLNRM_HISTORY_DB") {
            self.history.path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.min_workers == 0 {
            return Err(Error::validation("scheduler.min_workers", "must be at least 1"));
        }
        if s.min_workers > s.max_workers {
            return Err(Error::validation(
                "scheduler.max_workers",
                format!("must be >= min_workers ({})", s.min_workers),
            ));
        }
        if !(0.0..=1.0).contains(&s.confidence_threshold) {
            return Err(Error::validation(
                "scheduler.confidence_threshold",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.executor.output_buffer_bytes == 0 || self.executor.channel_capacity == 0 {
            return Err(Error::validation("executor", "buffer sizes must be non-zero"));
        }
        match self.trace.sink {
            SinkKind::Http if self.trace.endpoint.is_none() => {
                Err(Error::validation("trace.endpoint", "http sink requires an endpoint"))
            }
            SinkKind::File if self.trace.file.is_none() => {
                Err(Error::validation("trace.file", "file sink requires a path"))
            }
            _ => Ok(()),
        }
    }
}
