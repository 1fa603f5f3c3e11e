//! Core runtime and outcome types for clnrm

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Starting,
    Healthy,
    Degraded,
    Stopped,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Pending => write!(f, "pending"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Healthy => write!(f, "healthy"),
            LifecycleState::Degraded => write!(f, "degraded"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Failed(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Content hash over a service's image and configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReuseKey(pub String);

impl std::fmt::Display for ReuseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 12 hex chars is plenty to tell keys apart in logs
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Runtime binding of a service spec to a live dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    /// Logical service name from the test definition
    pub service: String,
    pub plugin: String,
    /// None for services that are not backed by a container
    pub container_id: Option<String>,
    pub host: String,
    /// Declared container port -> published host port
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
    pub state: LifecycleState,
    pub reuse_key: ReuseKey,
    pub created_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(service: impl Into<String>, plugin: impl Into<String>, reuse_key: ReuseKey) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service: service.into(),
            plugin: plugin.into(),
            container_id: None,
            host: "127.0.0.1".to_string(),
            ports: BTreeMap::new(),
            state: LifecycleState::Pending,
            reuse_key,
            created_at: Utc::now(),
        }
    }

    /// Published host port for a declared container port
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }

    /// Environment variables exposing this instance's connection info to steps
    ///
    /// For a service named `db` with port 5432 published on 49153 this yields
    /// `CLNRM_DB_HOST=127.0.0.1`, `CLNRM_DB_PORT=49153` and
    /// `CLNRM_DB_PORT_5432=49153`.
    pub fn connection_env(&self) -> Vec<(String, String)> {
        let prefix = format!("CLNRM_{}", env_ident(&self.service));
        let mut env = vec![(format!("{}_HOST", prefix), self.host.clone())];
        if let Some((_, first)) = self.ports.iter().next() {
            env.push((format!("{}_PORT", prefix), first.to_string()));
        }
        for (container_port, host_port) in &self.ports {
            env.push((format!("{}_PORT_{}", prefix, container_port), host_port.to_string()));
        }
        env
    }
}

fn env_ident(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepFailure {
    Timeout {
        #[serde(with = "humantime_serde")]
        after: Duration,
    },
    NonZeroExit {
        expected: String,
        actual: Option<i32>,
    },
    OutputMismatch {
        pattern: String,
    },
    SpawnFailed {
        reason: String,
    },
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailure::Timeout { after } => write!(f, "timed out after {:?}", after),
            StepFailure::NonZeroExit { expected, actual } => match actual {
                Some(code) => write!(f, "exit code {} (expected {})", code, expected),
                None => write!(f, "terminated by signal (expected {})", expected),
            },
            StepFailure::OutputMismatch { pattern } => {
                write!(f, "output did not match /{}/", pattern)
            }
            StepFailure::SpawnFailed { reason } => write!(f, "failed to spawn: {}", reason),
        }
    }
}

/// Terminal status of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "failure")]
pub enum StepStatus {
    Passed,
    Failed(StepFailure),
    Skipped,
}

/// Outcome of executing (or skipping) one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Bytes discarded by the bounded output buffers
    #[serde(default)]
    pub dropped_bytes: u64,
    pub duration_ms: u64,
    pub status: StepStatus,
}

impl StepResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            dropped_bytes: 0,
            duration_ms: 0,
            status: StepStatus::Skipped,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == StepStatus::Passed
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        match &self.status {
            StepStatus::Failed(f) => Some(f),
            _ => None,
        }
    }
}

/// Why a trace assertion failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TraceFailure {
    SpanNotFound {
        pattern: String,
    },
    AttributeMismatch {
        pattern: String,
        detail: String,
    },
    RelationshipMismatch {
        pattern: String,
        parent: String,
    },
    CardinalityMismatch {
        pattern: String,
        expected: String,
        actual: usize,
    },
    PollTimeout {
        pattern: String,
        #[serde(with = "humantime_serde")]
        waited: Duration,
    },
}

impl std::fmt::Display for TraceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceFailure::SpanNotFound { pattern } => write!(f, "no span matching '{}'", pattern),
            TraceFailure::AttributeMismatch { pattern, detail } => {
                write!(f, "span '{}' attribute mismatch: {}", pattern, detail)
            }
            TraceFailure::RelationshipMismatch { pattern, parent } => {
                write!(f, "span '{}' has no parent matching '{}'", pattern, parent)
            }
            TraceFailure::CardinalityMismatch { pattern, expected, actual } => {
                write!(f, "span '{}' expected {} match(es), found {}", pattern, expected, actual)
            }
            TraceFailure::PollTimeout { pattern, waited } => {
                write!(f, "no spans for this run after {:?} (waiting for '{}')", waited, pattern)
            }
        }
    }
}

/// Result of evaluating one trace assertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionOutcome {
    /// Step the assertion is attached to, None for run-wide assertions
    pub step: Option<String>,
    pub description: String,
    pub failure: Option<TraceFailure>,
}

impl AssertionOutcome {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Cause of a failed verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum FailureCause {
    Step { step: String, failure: StepFailure },
    Trace { failure: TraceFailure },
    ServiceStart { service: String, reason: String },
    Timeout {
        #[serde(with = "humantime_serde")]
        after: Duration,
    },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Step { step, failure } => write!(f, "step '{}' {}", step, failure),
            FailureCause::Trace { failure } => write!(f, "{}", failure),
            FailureCause::ServiceStart { service, reason } => {
                write!(f, "service '{}' failed to start: {}", service, reason)
            }
            FailureCause::Timeout { after } => write!(f, "run exceeded its timeout of {:?}", after),
        }
    }
}

/// Overall verdict of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "detail")]
pub enum Verdict {
    Pass,
    Fail(FailureCause),
    /// The definition was structurally invalid; nothing was started
    Invalid(String),
    /// The run could not be judged (runtime or trace sink unreachable)
    Error(String),
    Cancelled,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail(cause) => write!(f, "fail: {}", cause),
            Verdict::Invalid(msg) => write!(f, "invalid: {}", msg),
            Verdict::Error(msg) => write!(f, "error: {}", msg),
            Verdict::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// CPU and memory footprint estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_cores: f64,
    pub memory_mb: f64,
}

impl ResourceUsage {
    pub fn new(cpu_cores: f64, memory_mb: f64) -> Self {
        Self { cpu_cores, memory_mb }
    }
}

impl std::ops::Add for ResourceUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu_cores: self.cpu_cores + rhs.cpu_cores,
            memory_mb: self.memory_mb + rhs.memory_mb,
        }
    }
}

/// Reference to the spans captured for a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceBundleRef {
    pub trace_id: String,
    pub span_count: usize,
    /// Where the spans can be re-read (sink description), if anywhere
    pub source: Option<String>,
}

/// Immutable record of one completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub test_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub assertions: Vec<AssertionOutcome>,
    pub verdict: Verdict,
    pub resources: ResourceUsage,
    pub trace: TraceBundleRef,
}

impl RunRecord {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn passed(&self) -> bool {
        self.verdict.is_pass()
    }

    /// The run judged the test itself: it passed or failed
    ///
    /// Errored, cancelled and invalid runs say nothing about the test.
    pub fn is_judged(&self) -> bool {
        matches!(self.verdict, Verdict::Pass | Verdict::Fail(_))
    }

    pub fn counts_as_failure(&self) -> bool {
        matches!(self.verdict, Verdict::Fail(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self.verdict, Verdict::Error(_))
    }
}

/// Failure-prediction score for one test
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Predicted probability of failure, 0.0 - 1.0
    pub score: f64,
    /// How much the score can be trusted, 0.0 - 1.0
    pub confidence: f64,
    pub samples: usize,
}

/// Coarse risk buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_failure_rate(rate: f64) -> Self {
        if rate >= 0.5 {
            RiskLevel::Critical
        } else if rate >= 0.3 {
            RiskLevel::High
        } else if rate >= 0.15 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// One entry of an execution plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub test_name: String,
    /// Index into the definitions the plan was built from
    pub definition_index: usize,
    pub priority: f64,
    pub risk: RiskScore,
    pub high_risk: bool,
    pub estimated: ResourceUsage,
    pub rationale: String,
}

/// Ordered, sized execution plan for a batch of tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub items: Vec<PlanItem>,
    pub workers: usize,
    /// True when the scheduler fell back to the default plan
    pub degraded: bool,
    pub generated_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn high_risk(&self) -> impl Iterator<Item = &PlanItem> {
        self.items.iter().filter(|item| item.high_risk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_env() {
        let mut instance = ServiceInstance::new("my-db", "generic_container", ReuseKey("abc".into()));
        instance.ports.insert(5432, 49153);

        let env = instance.connection_env();
        assert!(env.contains(&("CLNRM_MY_DB_HOST".to_string(), "127.0.0.1".to_string())));
        assert!(env.contains(&("CLNRM_MY_DB_PORT".to_string(), "49153".to_string())));
        assert!(env.contains(&("CLNRM_MY_DB_PORT_5432".to_string(), "49153".to_string())));
    }

    #[test]
    fn test_risk_levels() {
        assert_eq!(RiskLevel::from_failure_rate(0.05), RiskLevel::Low);
        assert_eq!(RiskLevel::from_failure_rate(0.2), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_failure_rate(0.3), RiskLevel::High);
        assert_eq!(RiskLevel::from_failure_rate(0.9), RiskLevel::Critical);
    }

    #[test]
    fn test_verdict_serialization() {
        let verdict = Verdict::Fail(FailureCause::Step {
            step: "select".into(),
            failure: StepFailure::OutputMismatch { pattern: "2 row".into() },
        });
        let json = serde_json::to_string(&verdict).unwrap();
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, verdict);
    }
}
