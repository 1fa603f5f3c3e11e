//! AI Commands
//!
//! `ai-orchestrate`, `ai-predict` and `ai-optimize` all go through the
//! scheduler: with no usable history or oracle they fall back to the default
//! plan and say so.

use anyhow::Result;
use clap::Args;
use clnrm_common::{ExecutionPlan, PlanItem, ResourceUsage, RiskLevel};
use clnrm_engine::scheduler::{HistoryAnalysis, Recommendation, TestHistory};
use clnrm_engine::{EngineConfig, SuiteResult};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::run::{print_suite, run_config};
use super::{default_paths, load_definitions, validate_all, Context, Outcome};
use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct OrchestrateArgs {
    /// Definition files or directories
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Show each test's failure risk before running
    #[arg(long)]
    pub predict_failures: bool,

    /// Run on the worker pool the scheduler sizes instead of one worker
    #[arg(long)]
    pub auto_optimize: bool,

    /// Upper bound for the worker pool
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Risk score at or above which a test is scheduled first (0.0 - 1.0)
    #[arg(long)]
    pub confidence_threshold: Option<f64>,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Definitions to score; defaults to ./tests and ./test when present
    pub paths: Vec<PathBuf>,

    /// Summarize the recorded run history
    #[arg(long)]
    pub analyze_history: bool,

    /// Predict which tests are likely to fail
    #[arg(long)]
    pub predict_failures: bool,

    /// Suggest fixes for flaky, slow and degrading tests
    #[arg(long)]
    pub recommendations: bool,
}

#[derive(Args)]
pub struct OptimizeArgs {
    /// Definitions to optimize; defaults to ./tests and ./test
    pub paths: Vec<PathBuf>,

    /// Show the risk-ordered execution order
    #[arg(long)]
    pub execution_order: bool,

    /// Show per-test resource estimates against the ceilings
    #[arg(long)]
    pub resource_allocation: bool,

    /// Show the recommended worker pool size
    #[arg(long)]
    pub parallel_execution: bool,

    /// Write the recommended worker bounds into the config file
    #[arg(long)]
    pub auto_apply: bool,
}

/// One plan entry as displayed
#[derive(Debug, Serialize)]
pub struct PlanRow {
    pub position: usize,
    pub test: String,
    pub priority: f64,
    pub risk: f64,
    pub confidence: f64,
    pub high_risk: bool,
    pub cpu_cores: f64,
    pub memory_mb: f64,
    pub rationale: String,
}

impl PlanRow {
    fn from_item(position: usize, item: &PlanItem) -> Self {
        Self {
            position,
            test: item.test_name.clone(),
            priority: item.priority,
            risk: item.risk.score,
            confidence: item.risk.confidence,
            high_risk: item.high_risk,
            cpu_cores: item.estimated.cpu_cores,
            memory_mb: item.estimated.memory_mb,
            rationale: item.rationale.clone(),
        }
    }
}

impl TableDisplay for PlanRow {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Test", "Priority", "Risk", "Confidence", "High Risk", "CPU", "Memory", "Rationale"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.position.to_string(),
            self.test.clone(),
            format!("{:.3}", self.priority),
            output::percent(self.risk),
            output::percent(self.confidence),
            if self.high_risk { "yes" } else { "" }.to_string(),
            format!("{:.2}", self.cpu_cores),
            format!("{:.0} MB", self.memory_mb),
            self.rationale.clone(),
        ]
    }
}

pub fn plan_rows(plan: &ExecutionPlan) -> Vec<PlanRow> {
    plan.items
        .iter()
        .enumerate()
        .map(|(i, item)| PlanRow::from_item(i + 1, item))
        .collect()
}

/// Failure prediction for one test
#[derive(Debug, Serialize)]
pub struct Prediction {
    pub test: String,
    pub probability: f64,
    /// None when the prediction is a raw historical rate
    pub confidence: Option<f64>,
    pub risk: RiskLevel,
    pub high_risk: bool,
    pub basis: String,
}

impl TableDisplay for Prediction {
    fn headers() -> Vec<&'static str> {
        vec!["Test", "Failure Probability", "Confidence", "Risk", "Basis"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.test.clone(),
            output::percent(self.probability),
            self.confidence.map(output::percent).unwrap_or_else(|| "-".to_string()),
            self.risk.to_string(),
            self.basis.clone(),
        ]
    }
}

impl TableDisplay for TestHistory {
    fn headers() -> Vec<&'static str> {
        vec!["Test", "Runs", "Failure Rate", "Errors", "Risk", "Avg Duration", "Trend", "Flaky"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.test_name.clone(),
            self.runs.to_string(),
            output::percent(self.failure_rate),
            self.errors.to_string(),
            self.risk_level.to_string(),
            format!("{:.0} ms", self.avg_duration_ms),
            match self.trend {
                Some(trend) => format!("{} ({:+.1}%)", trend, self.performance_change_pct),
                None => "-".to_string(),
            },
            if self.flaky { "yes" } else { "" }.to_string(),
        ]
    }
}

impl TableDisplay for Recommendation {
    fn headers() -> Vec<&'static str> {
        vec!["Impact", "Test", "Recommendation"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.impact.to_string(),
            self.test_name.clone().unwrap_or_else(|| "-".to_string()),
            self.message.clone(),
        ]
    }
}

/// Predictions from a plan when definitions were given, else from history
pub fn predictions(
    plan: Option<&ExecutionPlan>,
    analysis: &HistoryAnalysis,
    threshold: f64,
) -> Vec<Prediction> {
    let mut out: Vec<Prediction> = match plan {
        Some(plan) if !plan.degraded => plan
            .items
            .iter()
            .map(|item| Prediction {
                test: item.test_name.clone(),
                probability: item.risk.score,
                confidence: Some(item.risk.confidence),
                risk: RiskLevel::from_failure_rate(item.risk.score),
                high_risk: item.high_risk,
                basis: format!("{} run(s) scored", item.risk.samples),
            })
            .collect(),
        _ => analysis
            .tests
            .iter()
            .filter(|t| t.runs > 0)
            .map(|t| Prediction {
                test: t.test_name.clone(),
                probability: t.failure_rate,
                confidence: None,
                risk: t.risk_level,
                high_risk: t.failure_rate >= threshold,
                basis: format!("{} recorded run(s)", t.runs),
            })
            .collect(),
    };
    out.sort_by(|a, b| b.probability.total_cmp(&a.probability).then_with(|| a.test.cmp(&b.test)));
    out
}

#[derive(Serialize)]
struct OrchestrateReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<&'a ExecutionPlan>,
    result: &'a SuiteResult,
}

pub async fn orchestrate(
    args: OrchestrateArgs,
    ctx: &Context,
    cancel: CancellationToken,
) -> Result<Outcome> {
    let Some(definitions) = load_definitions(&args.paths)? else {
        return Ok(Outcome::Invalid);
    };

    let mut config = run_config(&ctx.config, args.max_workers, false);
    if let Some(threshold) = args.confidence_threshold {
        config.scheduler.confidence_threshold = threshold;
    }
    let runner = ctx.runner_with(config)?;
    if !validate_all(&runner, &definitions) {
        return Ok(Outcome::Invalid);
    }

    let plan = runner.plan(&definitions).await;
    if args.predict_failures && ctx.format != OutputFormat::Json {
        output::print_section("Execution plan", ctx.format);
        if plan.degraded && ctx.human() {
            output::print_warning("No usable history or oracle; running in declaration order");
        }
        output::print_list(&plan_rows(&plan), ctx.format);
        let high_risk: Vec<&str> = plan.high_risk().map(|i| i.test_name.as_str()).collect();
        if !high_risk.is_empty() && ctx.human() {
            output::print_warning(&format!("High risk, scheduled first: {}", high_risk.join(", ")));
        }
    }

    let result = runner
        .run_plan(&plan, definitions, args.auto_optimize, cancel)
        .await;

    if ctx.format == OutputFormat::Json {
        output::print_json(&OrchestrateReport {
            plan: args.predict_failures.then_some(&plan),
            result: &result,
        });
    } else {
        output::print_section("Results", ctx.format);
        print_suite(&result, ctx.format, ctx.verbose);
    }
    Ok(Outcome::from_suite(&result))
}

#[derive(Serialize, Default)]
struct PredictReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<HistoryAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    predictions: Option<Vec<Prediction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recommendations: Option<Vec<Recommendation>>,
}

pub async fn predict(args: PredictArgs, ctx: &Context) -> Result<Outcome> {
    let all = !(args.analyze_history || args.predict_failures || args.recommendations);
    let runner = ctx.runner()?;
    let history = runner.history_snapshot()?;
    let analysis = runner.scheduler().analyze(&history);

    let paths = if args.paths.is_empty() {
        default_paths()
    } else {
        args.paths.clone()
    };
    let wants_plan = args.predict_failures || args.recommendations || all;
    let plan = if wants_plan && !paths.is_empty() {
        match load_definitions(&paths)? {
            Some(definitions) => Some(runner.plan(&definitions).await),
            None => return Ok(Outcome::Invalid),
        }
    } else {
        None
    };

    let mut report = PredictReport::default();
    if args.predict_failures || all {
        report.predictions = Some(predictions(
            plan.as_ref(),
            &analysis,
            ctx.config.scheduler.confidence_threshold,
        ));
    }
    if args.recommendations || all {
        report.recommendations = Some(runner.scheduler().recommendations(&analysis, plan.as_ref()));
    }
    if args.analyze_history || all {
        report.analysis = Some(analysis);
    }

    if ctx.format == OutputFormat::Json {
        output::print_json(&report);
        return Ok(Outcome::Success);
    }

    if let Some(analysis) = &report.analysis {
        output::print_section("History analysis", ctx.format);
        if ctx.human() {
            println!(
                "{} run(s), {} failure(s), {} infrastructure error(s), success rate {}",
                analysis.total_runs,
                analysis.total_failures,
                analysis.total_errors,
                output::percent(analysis.success_rate)
            );
            if let (Some(start), Some(end)) = (analysis.window_start, analysis.window_end) {
                println!("window {} .. {}", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"));
            }
        }
        output::print_list(&analysis.tests, ctx.format);
        if ctx.verbose {
            for test in analysis.tests.iter().filter(|t| !t.common_failures.is_empty()) {
                println!("{}:", test.test_name);
                for reason in &test.common_failures {
                    println!("  {}", reason);
                }
            }
        }
    }
    if let Some(predictions) = &report.predictions {
        output::print_section("Failure predictions", ctx.format);
        output::print_list(predictions, ctx.format);
    }
    if let Some(recommendations) = &report.recommendations {
        output::print_section("Recommendations", ctx.format);
        output::print_list(recommendations, ctx.format);
    }
    Ok(Outcome::Success)
}

/// Estimated batch footprint against the configured ceilings
#[derive(Debug, Serialize)]
pub struct ResourceAllocation {
    pub total: ResourceUsage,
    /// Largest single test
    pub peak: ResourceUsage,
    pub cpu_ceiling: f64,
    pub memory_ceiling_mb: f64,
}

#[derive(Debug, Serialize)]
pub struct ParallelAdvice {
    pub recommended_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Batches needed at the recommended size
    pub waves: usize,
}

#[derive(Serialize, Default)]
struct OptimizeReport {
    degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_order: Option<Vec<PlanRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_allocation: Option<ResourceAllocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_execution: Option<ParallelAdvice>,
    applied: bool,
}

pub fn resource_allocation(plan: &ExecutionPlan, config: &EngineConfig) -> ResourceAllocation {
    let total = plan
        .items
        .iter()
        .fold(ResourceUsage::default(), |acc, item| acc + item.estimated);
    let peak = ResourceUsage::new(
        plan.items.iter().map(|i| i.estimated.cpu_cores).fold(0.0, f64::max),
        plan.items.iter().map(|i| i.estimated.memory_mb).fold(0.0, f64::max),
    );
    ResourceAllocation {
        total,
        peak,
        cpu_ceiling: config.scheduler.cpu_ceiling,
        memory_ceiling_mb: config.scheduler.memory_ceiling_mb,
    }
}

pub fn parallel_advice(plan: &ExecutionPlan, config: &EngineConfig) -> ParallelAdvice {
    let workers = plan.workers.max(1);
    ParallelAdvice {
        recommended_workers: workers,
        min_workers: config.scheduler.min_workers,
        max_workers: config.scheduler.max_workers,
        waves: plan.items.len().div_ceil(workers),
    }
}

/// Narrow the configured worker bounds to a recommendation
pub fn apply_worker_bounds(config: &mut EngineConfig, workers: usize) {
    let workers = workers.max(1);
    config.scheduler.max_workers = workers;
    config.scheduler.min_workers = config.scheduler.min_workers.min(workers);
}

pub async fn optimize(args: OptimizeArgs, ctx: &Context) -> Result<Outcome> {
    let all = !(args.execution_order || args.resource_allocation || args.parallel_execution);
    let paths = if args.paths.is_empty() {
        match default_paths() {
            found if found.is_empty() => vec![PathBuf::from("tests")],
            found => found,
        }
    } else {
        args.paths.clone()
    };
    let Some(definitions) = load_definitions(&paths)? else {
        return Ok(Outcome::Invalid);
    };

    let runner = ctx.runner()?;
    if !validate_all(&runner, &definitions) {
        return Ok(Outcome::Invalid);
    }
    let plan = runner.plan(&definitions).await;

    let mut report = OptimizeReport {
        degraded: plan.degraded,
        ..Default::default()
    };
    if args.execution_order || all {
        report.execution_order = Some(plan_rows(&plan));
    }
    if args.resource_allocation || all {
        report.resource_allocation = Some(resource_allocation(&plan, &ctx.config));
    }
    if args.parallel_execution || all {
        report.parallel_execution = Some(parallel_advice(&plan, &ctx.config));
    }

    if args.auto_apply {
        if plan.degraded {
            output::print_warning("No usable run history; worker bounds left unchanged");
        } else {
            // Reload so environment overrides are not written back
            let mut file_config = EngineConfig::load(&ctx.config_path)?;
            apply_worker_bounds(&mut file_config, plan.workers);
            file_config.save(&ctx.config_path)?;
            info!(
                "Applied worker bounds {}-{} to {}",
                file_config.scheduler.min_workers,
                file_config.scheduler.max_workers,
                ctx.config_path.display()
            );
            report.applied = true;
        }
    }

    if ctx.format == OutputFormat::Json {
        output::print_json(&report);
        return Ok(Outcome::Success);
    }

    if plan.degraded && ctx.human() {
        output::print_warning("No usable history or oracle; showing declaration order");
    }
    if let Some(rows) = &report.execution_order {
        output::print_section("Execution order", ctx.format);
        output::print_list(rows, ctx.format);
    }
    if let Some(allocation) = &report.resource_allocation {
        output::print_section("Resource allocation", ctx.format);
        let rows = vec![
            vec![
                "CPU (cores)".to_string(),
                format!("{:.2}", allocation.total.cpu_cores),
                format!("{:.2}", allocation.peak.cpu_cores),
                format!("{:.1}", allocation.cpu_ceiling),
            ],
            vec![
                "Memory (MB)".to_string(),
                format!("{:.0}", allocation.total.memory_mb),
                format!("{:.0}", allocation.peak.memory_mb),
                format!("{:.0}", allocation.memory_ceiling_mb),
            ],
        ];
        println!(
            "{}",
            output::render_rows(&["Resource", "All Tests", "Largest Test", "Ceiling"], &rows, ctx.format)
        );
    }
    if let Some(advice) = &report.parallel_execution {
        output::print_section("Parallel execution", ctx.format);
        println!(
            "{} worker(s) recommended (configured {}-{}), {} wave(s)",
            advice.recommended_workers, advice.min_workers, advice.max_workers, advice.waves
        );
    }
    Ok(Outcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clnrm_common::RiskScore;
    use clnrm_engine::scheduler::Trend;

    fn item(name: &str, index: usize, score: f64, high_risk: bool) -> PlanItem {
        PlanItem {
            test_name: name.to_string(),
            definition_index: index,
            priority: score,
            risk: RiskScore {
                score,
                confidence: 0.5,
                samples: 4,
            },
            high_risk,
            estimated: ResourceUsage::new(0.5, 256.0),
            rationale: "history".to_string(),
        }
    }

    fn plan(items: Vec<PlanItem>, workers: usize, degraded: bool) -> ExecutionPlan {
        ExecutionPlan {
            items,
            workers,
            degraded,
            generated_at: Utc::now(),
        }
    }

    fn history(name: &str, runs: usize, failure_rate: f64) -> TestHistory {
        TestHistory {
            test_name: name.to_string(),
            runs,
            failures: (runs as f64 * failure_rate) as usize,
            errors: 0,
            failure_rate,
            risk_level: RiskLevel::from_failure_rate(failure_rate),
            avg_duration_ms: 100.0,
            performance_change_pct: 0.0,
            trend: Some(Trend::Stable),
            flaky: false,
            common_failures: Vec::new(),
        }
    }

    fn analysis(tests: Vec<TestHistory>) -> HistoryAnalysis {
        HistoryAnalysis {
            total_runs: tests.iter().map(|t| t.runs).sum(),
            total_failures: tests.iter().map(|t| t.failures).sum(),
            total_errors: 0,
            success_rate: 0.0,
            window_start: None,
            window_end: None,
            tests,
        }
    }

    #[test]
    fn test_predictions_prefer_plan_scores() {
        let plan = plan(
            vec![item("a", 0, 0.1, false), item("b", 1, 0.7, true)],
            2,
            false,
        );
        let out = predictions(Some(&plan), &analysis(vec![history("a", 10, 0.9)]), 0.6);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].test, "b");
        assert_eq!(out[0].risk, RiskLevel::Critical);
        assert!(out[0].high_risk);
        assert_eq!(out[1].confidence, Some(0.5));
    }

    #[test]
    fn test_predictions_fall_back_to_history() {
        let degraded = plan(vec![item("a", 0, 0.0, false)], 1, true);
        let out = predictions(
            Some(&degraded),
            &analysis(vec![history("a", 10, 0.2), history("b", 4, 0.75), history("c", 0, 0.0)]),
            0.5,
        );
        let names: Vec<&str> = out.iter().map(|p| p.test.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(out[0].high_risk);
        assert!(!out[1].high_risk);
        assert_eq!(out[1].confidence, None);
    }

    #[test]
    fn test_resource_allocation_and_waves() {
        let plan = plan(
            vec![item("a", 0, 0.1, false), item("b", 1, 0.2, false), item("c", 2, 0.3, false)],
            2,
            false,
        );
        let config = EngineConfig::default();

        let allocation = resource_allocation(&plan, &config);
        assert_eq!(allocation.total.cpu_cores, 1.5);
        assert_eq!(allocation.total.memory_mb, 768.0);
        assert_eq!(allocation.peak.memory_mb, 256.0);

        let advice = parallel_advice(&plan, &config);
        assert_eq!(advice.recommended_workers, 2);
        assert_eq!(advice.waves, 2);
    }

    #[test]
    fn test_auto_apply_round_trips_through_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clnrm.toml");
        let mut config = EngineConfig::default();
        config.scheduler.min_workers = 4;
        config.scheduler.max_workers = 8;
        config.save(&path).unwrap();

        let mut loaded = EngineConfig::load(&path).unwrap();
        apply_worker_bounds(&mut loaded, 3);
        loaded.save(&path).unwrap();

        let back = EngineConfig::load(&path).unwrap();
        assert_eq!(back.scheduler.max_workers, 3);
        assert_eq!(back.scheduler.min_workers, 3);
    }

    #[test]
    fn test_plan_rows_are_numbered_from_one() {
        let rows = plan_rows(&plan(vec![item("a", 0, 0.1, false), item("b", 1, 0.2, true)], 1, false));
        assert_eq!(rows[0].position, 1);
        assert_eq!(rows[1].row()[5], "yes");
    }
}
