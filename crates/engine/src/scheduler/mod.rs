//! Scheduler / optimizer
//!
//! Builds an [`ExecutionPlan`] from the definitions of a batch and a
//! snapshot of run history. The scheduler keeps no state between plans:
//! the same definitions, history and config always give the same plan.
//! Prediction is an optimization only; without history, or when the oracle
//! fails, the plan falls back to declaration order on the minimum number of
//! workers.

mod autoscale;
mod oracle;

pub use autoscale::{decide as scaling_decision, LoadForecast, LoadPredictor, ScalingDecision};
pub use oracle::{FailureOracle, HistoricalOracle, HttpOracle};

use chrono::{DateTime, Utc};
use clnrm_common::{
    ExecutionPlan, PlanItem, ResourceUsage, Result, RiskLevel, RiskScore, RunRecord,
    TestDefinition,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::plugin::PluginRegistry;

/// Runs needed before a performance trend is reported
const TREND_MIN_RUNS: usize = 5;
/// Recent window compared against everything older
const TREND_RECENT_RUNS: usize = 5;
/// Relative duration change (percent) that counts as a trend
const TREND_THRESHOLD_PCT: f64 = 5.0;

pub struct Scheduler {
    config: SchedulerConfig,
    oracle: Arc<dyn FailureOracle>,
    registry: Option<Arc<PluginRegistry>>,
}

impl Scheduler {
    /// Scheduler backed by the historical oracle
    pub fn new(config: SchedulerConfig) -> Self {
        let oracle = Arc::new(HistoricalOracle::new(config.recency_half_life_days));
        Self {
            config,
            oracle,
            registry: None,
        }
    }

    /// Use the HTTP oracle when an endpoint is configured
    pub fn from_config(config: SchedulerConfig) -> Result<Self> {
        match config.oracle_endpoint.clone() {
            Some(endpoint) => {
                let oracle = HttpOracle::new(&endpoint, config.oracle_timeout)?;
                Ok(Self::new(config).with_oracle(Arc::new(oracle)))
            }
            None => Ok(Self::new(config)),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn FailureOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Plugin estimates for tests without resource history
    pub fn with_registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    fn static_estimate(&self, definition: &TestDefinition) -> ResourceUsage {
        match &self.registry {
            Some(registry) => registry.estimate_definition(definition),
            None => PluginRegistry::new().estimate_definition(definition),
        }
    }

    /// Mean recorded footprint, or the static estimate
    fn estimate(&self, definition: &TestDefinition, history: &[&RunRecord]) -> ResourceUsage {
        let measured: Vec<ResourceUsage> = history
            .iter()
            .map(|r| r.resources)
            .filter(|u| u.cpu_cores > 0.0 || u.memory_mb > 0.0)
            .collect();
        if measured.is_empty() {
            return self.static_estimate(definition);
        }
        let sum = measured.iter().fold(ResourceUsage::default(), |acc, u| acc + *u);
        let n = measured.len() as f64;
        ResourceUsage::new(sum.cpu_cores / n, sum.memory_mb / n)
    }

    /// Declaration order on the minimum worker count
    pub fn default_plan(&self, definitions: &[TestDefinition], reason: &str) -> ExecutionPlan {
        warn!("SchedulerDegradedWarning: {}; using declaration order", reason);
        let items = definitions
            .iter()
            .enumerate()
            .map(|(index, def)| PlanItem {
                test_name: def.name.clone(),
                definition_index: index,
                priority: 0.0,
                risk: RiskScore::default(),
                high_risk: false,
                estimated: self.static_estimate(def),
                rationale: "declaration order".to_string(),
            })
            .collect();
        ExecutionPlan {
            items,
            workers: self.config.min_workers.max(1),
            degraded: true,
            generated_at: Utc::now(),
        }
    }

    /// Order and size a batch
    ///
    /// `history` is a snapshot taken by the caller; runs appended while the
    /// plan is in use do not affect it.
    pub async fn plan(&self, definitions: &[TestDefinition], history: &[RunRecord]) -> ExecutionPlan {
        let by_test = group_by_test(history);
        let known = definitions
            .iter()
            .any(|def| by_test.get(def.name.as_str()).map(|r| !r.is_empty()).unwrap_or(false));
        if !known {
            return self.default_plan(definitions, "no run history");
        }

        let mut items = Vec::with_capacity(definitions.len());
        for (index, def) in definitions.iter().enumerate() {
            let runs: Vec<RunRecord> = by_test
                .get(def.name.as_str())
                .map(|runs| runs.iter().map(|r| (*r).clone()).collect())
                .unwrap_or_default();

            let risk = match self.oracle.score(def, &runs).await {
                Ok(risk) => risk,
                Err(e) => {
                    return self.default_plan(
                        definitions,
                        &format!("oracle {} unavailable: {}", self.oracle.name(), e),
                    )
                }
            };

            let refs: Vec<&RunRecord> = runs.iter().collect();
            let estimated = self.estimate(def, &refs);
            let threshold = def
                .ai_management
                .as_ref()
                .and_then(|ai| ai.confidence_threshold)
                .unwrap_or(self.config.confidence_threshold);
            let high_risk = risk.samples > 0 && risk.score >= threshold;
            // Confidence scales how much the prediction moves a test forward
            let priority = risk.score * (0.5 + 0.5 * risk.confidence);

            let rationale = if risk.samples == 0 {
                "no history".to_string()
            } else {
                format!(
                    "{} risk ({:.0}% over {} run(s), confidence {:.2})",
                    RiskLevel::from_failure_rate(risk.score),
                    risk.score * 100.0,
                    risk.samples,
                    risk.confidence
                )
            };

            items.push(PlanItem {
                test_name: def.name.clone(),
                definition_index: index,
                priority,
                risk,
                high_risk,
                estimated,
                rationale,
            });
        }

        let workers = self.recommend_workers(&items);
        let items = order_items(items, workers, &self.config);
        let plan = ExecutionPlan {
            items,
            workers,
            degraded: false,
            generated_at: Utc::now(),
        };
        info!(
            "Planned {} test(s) on {} worker(s), {} high-risk",
            plan.items.len(),
            plan.workers,
            plan.high_risk().count()
        );
        plan
    }

    /// Largest pool whose heaviest concurrent tests fit under the ceilings
    pub fn recommend_workers(&self, items: &[PlanItem]) -> usize {
        let mut heaviest: Vec<ResourceUsage> = items.iter().map(|i| i.estimated).collect();
        heaviest.sort_by(|a, b| {
            b.cpu_cores
                .total_cmp(&a.cpu_cores)
                .then(b.memory_mb.total_cmp(&a.memory_mb))
        });

        let mut total = ResourceUsage::default();
        let mut fit = 0;
        for usage in heaviest {
            let next = total + usage;
            if next.cpu_cores > self.config.cpu_ceiling || next.memory_mb > self.config.memory_ceiling_mb {
                break;
            }
            total = next;
            fit += 1;
        }

        let max = self.config.max_workers.max(self.config.min_workers).max(1);
        fit.max(1).clamp(self.config.min_workers.max(1), max)
    }

    /// Per-test statistics over a history snapshot
    pub fn analyze(&self, history: &[RunRecord]) -> HistoryAnalysis {
        let by_test = group_by_test(history);
        let mut tests: Vec<TestHistory> = by_test
            .into_iter()
            .map(|(name, runs)| test_history(name, &runs))
            .collect();
        tests.sort_by(|a, b| {
            b.failure_rate
                .total_cmp(&a.failure_rate)
                .then_with(|| a.test_name.cmp(&b.test_name))
        });

        let total_runs: usize = tests.iter().map(|t| t.runs).sum();
        let total_failures: usize = tests.iter().map(|t| t.failures).sum();
        HistoryAnalysis {
            total_runs,
            total_failures,
            total_errors: tests.iter().map(|t| t.errors).sum(),
            success_rate: if total_runs == 0 {
                1.0
            } else {
                1.0 - total_failures as f64 / total_runs as f64
            },
            window_start: history.iter().map(|r| r.started_at).min(),
            window_end: history.iter().map(|r| r.finished_at).max(),
            tests,
        }
    }

    /// Optimization hints from an analysis and, optionally, a plan
    pub fn recommendations(
        &self,
        analysis: &HistoryAnalysis,
        plan: Option<&ExecutionPlan>,
    ) -> Vec<Recommendation> {
        let mut out = Vec::new();

        let mut durations: Vec<f64> = analysis
            .tests
            .iter()
            .filter(|t| t.runs > 0)
            .map(|t| t.avg_duration_ms)
            .collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        let median = durations.get(durations.len() / 2).copied().unwrap_or(0.0);

        for test in &analysis.tests {
            if test.flaky {
                out.push(Recommendation {
                    kind: RecommendationKind::FlakyTest,
                    test_name: Some(test.test_name.clone()),
                    message: format!(
                        "{} alternates between pass and fail ({:.0}% failures); isolate its nondeterminism",
                        test.test_name,
                        test.failure_rate * 100.0
                    ),
                    impact: RiskLevel::High,
                });
            }
            if durations.len() > 1 && test.avg_duration_ms > 1000.0 && test.avg_duration_ms > 2.0 * median {
                out.push(Recommendation {
                    kind: RecommendationKind::SlowTest,
                    test_name: Some(test.test_name.clone()),
                    message: format!(
                        "{} averages {:.0} ms, over twice the median {:.0} ms; consider splitting it or enabling container reuse",
                        test.test_name, test.avg_duration_ms, median
                    ),
                    impact: RiskLevel::Medium,
                });
            }
            if test.trend == Some(Trend::Degrading) {
                out.push(Recommendation {
                    kind: RecommendationKind::Degrading,
                    test_name: Some(test.test_name.clone()),
                    message: format!(
                        "{} got {:.0}% slower in recent runs",
                        test.test_name, test.performance_change_pct
                    ),
                    impact: RiskLevel::Medium,
                });
            }
        }

        if let Some(plan) = plan {
            if plan.workers > plan.items.len() && !plan.items.is_empty() {
                out.push(Recommendation {
                    kind: RecommendationKind::WorkerPool,
                    test_name: None,
                    message: format!(
                        "{} worker(s) for {} test(s); lower min_workers to free resources",
                        plan.workers,
                        plan.items.len()
                    ),
                    impact: RiskLevel::Low,
                });
            } else if plan.workers < self.config.max_workers && plan.workers < plan.items.len() {
                out.push(Recommendation {
                    kind: RecommendationKind::WorkerPool,
                    test_name: None,
                    message: format!(
                        "resource ceilings limit the pool to {} of {} worker(s); raise cpu_ceiling or memory_ceiling_mb for more parallelism",
                        plan.workers, self.config.max_workers
                    ),
                    impact: RiskLevel::Low,
                });
            }
        }

        debug!("{} recommendation(s)", out.len());
        out
    }
}

/// History grouped per test, oldest run first
fn group_by_test(history: &[RunRecord]) -> HashMap<&str, Vec<&RunRecord>> {
    let mut by_test: HashMap<&str, Vec<&RunRecord>> = HashMap::new();
    for record in history {
        by_test.entry(record.test_name.as_str()).or_default().push(record);
    }
    for runs in by_test.values_mut() {
        runs.sort_by_key(|r| r.started_at);
    }
    by_test
}

/// High-risk tests first by priority, then the rest packed into waves
///
/// Each wave holds at most `workers` tests whose estimates fit the ceilings
/// together; heavy tests are placed first and light ones fill the gaps.
fn order_items(items: Vec<PlanItem>, workers: usize, config: &SchedulerConfig) -> Vec<PlanItem> {
    let by_priority = |a: &PlanItem, b: &PlanItem| {
        b.priority
            .total_cmp(&a.priority)
            .then(a.definition_index.cmp(&b.definition_index))
    };

    let (mut high, mut rest): (Vec<PlanItem>, Vec<PlanItem>) =
        items.into_iter().partition(|item| item.high_risk);
    high.sort_by(by_priority);

    rest.sort_by(|a, b| {
        b.estimated
            .cpu_cores
            .total_cmp(&a.estimated.cpu_cores)
            .then(b.estimated.memory_mb.total_cmp(&a.estimated.memory_mb))
            .then_with(|| by_priority(a, b))
    });

    let mut waves: Vec<(Vec<PlanItem>, ResourceUsage)> = Vec::new();
    for item in rest {
        let slot = waves.iter().position(|(wave, used)| {
            let next = *used + item.estimated;
            wave.len() < workers.max(1)
                && next.cpu_cores <= config.cpu_ceiling
                && next.memory_mb <= config.memory_ceiling_mb
        });
        match slot {
            Some(i) => {
                waves[i].1 = waves[i].1 + item.estimated;
                waves[i].0.push(item);
            }
            None => {
                let used = item.estimated;
                waves.push((vec![item], used));
            }
        }
    }

    // Waves holding riskier tests go first
    for (wave, _) in waves.iter_mut() {
        wave.sort_by(by_priority);
    }
    waves.sort_by(|(a, _), (b, _)| by_priority(&a[0], &b[0]));

    high.into_iter()
        .chain(waves.into_iter().flat_map(|(wave, _)| wave))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Improving => write!(f, "improving"),
            Trend::Stable => write!(f, "stable"),
            Trend::Degrading => write!(f, "degrading"),
        }
    }
}

/// Statistics for one test
#[derive(Debug, Clone, Serialize)]
pub struct TestHistory {
    pub test_name: String,
    /// Passed or failed runs
    pub runs: usize,
    pub failures: usize,
    /// Runs that could not be judged because of infrastructure
    pub errors: usize,
    pub failure_rate: f64,
    pub risk_level: RiskLevel,
    pub avg_duration_ms: f64,
    /// Duration change of the last runs against the older ones, in percent
    pub performance_change_pct: f64,
    /// None until enough runs exist
    pub trend: Option<Trend>,
    /// Passed and failed at least twice each way in a row change
    pub flaky: bool,
    /// Up to three most frequent failure descriptions
    pub common_failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryAnalysis {
    pub total_runs: usize,
    pub total_failures: usize,
    pub total_errors: usize,
    pub success_rate: f64,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    /// Most failing first
    pub tests: Vec<TestHistory>,
}

fn test_history(name: &str, runs: &[&RunRecord]) -> TestHistory {
    let samples: Vec<&RunRecord> = runs.iter().copied().filter(|r| r.is_judged()).collect();
    let errors = runs.iter().filter(|r| r.is_error()).count();
    let failures = samples.iter().filter(|r| r.counts_as_failure()).count();
    let failure_rate = if samples.is_empty() {
        0.0
    } else {
        failures as f64 / samples.len() as f64
    };

    let mean = |rs: &[&RunRecord]| {
        if rs.is_empty() {
            0.0
        } else {
            rs.iter().map(|r| r.duration_ms() as f64).sum::<f64>() / rs.len() as f64
        }
    };
    let avg_duration_ms = mean(&samples);

    let (performance_change_pct, trend) = if samples.len() >= TREND_MIN_RUNS {
        let split = samples.len().saturating_sub(TREND_RECENT_RUNS);
        let recent = mean(&samples[split..]);
        let older = if split == 0 { recent } else { mean(&samples[..split]) };
        let change = if older > 0.0 {
            (recent - older) / older * 100.0
        } else {
            0.0
        };
        let trend = if change > TREND_THRESHOLD_PCT {
            Trend::Degrading
        } else if change < -TREND_THRESHOLD_PCT {
            Trend::Improving
        } else {
            Trend::Stable
        };
        (change, Some(trend))
    } else {
        (0.0, None)
    };

    let flips = samples
        .windows(2)
        .filter(|w| w[0].counts_as_failure() != w[1].counts_as_failure())
        .count();

    let mut reasons: HashMap<String, usize> = HashMap::new();
    for record in samples.iter().filter(|r| r.counts_as_failure()) {
        *reasons.entry(record.verdict.to_string()).or_default() += 1;
    }
    let mut reasons: Vec<(String, usize)> = reasons.into_iter().collect();
    reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    TestHistory {
        test_name: name.to_string(),
        runs: samples.len(),
        failures,
        errors,
        failure_rate,
        risk_level: RiskLevel::from_failure_rate(failure_rate),
        avg_duration_ms,
        performance_change_pct,
        trend,
        flaky: flips >= 2 && failures > 0 && failures < samples.len(),
        common_failures: reasons.into_iter().take(3).map(|(reason, _)| reason).collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    FlakyTest,
    SlowTest,
    Degrading,
    WorkerPool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub test_name: Option<String>,
    pub message: String,
    pub impact: RiskLevel,
}
