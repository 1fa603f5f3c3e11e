//! Run Commands

use anyhow::Result;
use clap::Args;
use clnrm_common::{RunRecord, StepStatus, Verdict};
use clnrm_engine::{write_results, EngineConfig, SuiteResult};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{load_definitions, validate_all, Context, Outcome};
use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct RunArgs {
    /// Definition files or directories
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Let the scheduler size the worker pool
    #[arg(long)]
    pub parallel: bool,

    /// Maximum parallel workers
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Timeout applied to every test, overriding the definitions (e.g. "90s")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Keep healthy services for later tests with the same configuration
    #[arg(long)]
    pub reuse: bool,

    /// Directory to write test-results.json into
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Run report row
#[derive(Serialize)]
pub struct RunRow {
    pub test: String,
    pub verdict: String,
    pub steps: String,
    pub spans: usize,
    pub duration_ms: u64,
}

impl From<&RunRecord> for RunRow {
    fn from(record: &RunRecord) -> Self {
        let passed = record.step_results.iter().filter(|s| s.passed()).count();
        Self {
            test: record.test_name.clone(),
            verdict: record.verdict.to_string(),
            steps: format!("{}/{}", passed, record.step_results.len()),
            spans: record.trace.span_count,
            duration_ms: record.duration_ms(),
        }
    }
}

impl TableDisplay for RunRow {
    fn headers() -> Vec<&'static str> {
        vec!["Test", "Verdict", "Steps", "Spans", "Duration"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.test.clone(),
            self.verdict.clone(),
            self.steps.clone(),
            self.spans.to_string(),
            format!("{} ms", self.duration_ms),
        ]
    }
}

/// Engine config with the run flags folded in
pub fn run_config(base: &EngineConfig, jobs: Option<usize>, reuse: bool) -> EngineConfig {
    let mut config = base.clone();
    if let Some(jobs) = jobs {
        config.scheduler.max_workers = jobs.max(1);
        config.scheduler.min_workers = config.scheduler.min_workers.min(config.scheduler.max_workers);
    }
    if reuse {
        config.lifecycle.reuse_containers = true;
    }
    config
}

pub async fn execute(args: RunArgs, ctx: &Context, cancel: CancellationToken) -> Result<Outcome> {
    let Some(mut definitions) = load_definitions(&args.paths)? else {
        return Ok(Outcome::Invalid);
    };
    if let Some(timeout) = args.timeout {
        for definition in &mut definitions {
            definition.timeout = Some(timeout);
        }
    }

    let runner = ctx.runner_with(run_config(&ctx.config, args.jobs, args.reuse))?;
    if !validate_all(&runner, &definitions) {
        return Ok(Outcome::Invalid);
    }

    info!(
        "Running {} test(s){}",
        definitions.len(),
        if args.parallel { " in parallel" } else { "" }
    );
    let result = runner.run_all(definitions, args.parallel, cancel).await;
    print_suite(&result, ctx.format, ctx.verbose);

    if let Some(dir) = &args.output {
        write_results(&result, dir)?;
    }
    Ok(Outcome::from_suite(&result))
}

/// Report a finished batch
pub fn print_suite(result: &SuiteResult, format: OutputFormat, verbose: bool) {
    if format == OutputFormat::Json {
        output::print_json(result);
        return;
    }

    let rows: Vec<RunRow> = result.records.iter().map(RunRow::from).collect();
    output::print_list(&rows, format);
    if format != OutputFormat::Human {
        return;
    }

    for record in result.records.iter().filter(|r| !r.passed()) {
        print_failure(record, verbose);
    }

    let summary = format!(
        "{} passed, {} failed, {} errored, {} invalid, {} cancelled ({} worker(s), {} ms)",
        result.passed,
        result.failed,
        result.errored,
        result.invalid,
        result.cancelled,
        result.workers,
        result.duration_ms
    );
    if result.all_passed() {
        println!("\n{}", summary.green().bold());
    } else {
        println!("\n{}", summary.red().bold());
    }
}

fn print_failure(record: &RunRecord, verbose: bool) {
    let label = match &record.verdict {
        Verdict::Error(_) => "ERROR".yellow().bold(),
        Verdict::Cancelled => "CANCELLED".dimmed(),
        _ => "FAIL".red().bold(),
    };
    println!("\n{} {} ({})", label, record.test_name.bold(), record.verdict);

    for step in &record.step_results {
        if let StepStatus::Failed(failure) = &step.status {
            println!("  step '{}': {}", step.name, failure);
            if verbose {
                for line in step.stderr.lines().rev().take(10).collect::<Vec<_>>().into_iter().rev() {
                    println!("    {}", line.dimmed());
                }
            }
        }
    }
    for assertion in record.assertions.iter().filter(|a| !a.passed()) {
        if let Some(failure) = &assertion.failure {
            println!("  {}", failure);
        }
    }
    if !record.trace.trace_id.is_empty() {
        println!("  trace {}", record.trace.trace_id.dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clnrm_common::StepResult;

    #[test]
    fn test_jobs_caps_the_pool() {
        let mut base = EngineConfig::default();
        base.scheduler.min_workers = 4;
        base.scheduler.max_workers = 8;

        let config = run_config(&base, Some(2), false);
        assert_eq!(config.scheduler.max_workers, 2);
        assert_eq!(config.scheduler.min_workers, 2);
        assert!(!config.lifecycle.reuse_containers);

        let config = run_config(&base, Some(0), true);
        assert_eq!(config.scheduler.max_workers, 1);
        assert!(config.lifecycle.reuse_containers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_row_counts_passed_steps() {
        let now = chrono::Utc::now();
        let mut passed = StepResult::skipped("first");
        passed.status = StepStatus::Passed;
        let record = RunRecord {
            run_id: "r".into(),
            test_name: "db-roundtrip".into(),
            started_at: now,
            finished_at: now + chrono::Duration::milliseconds(42),
            step_results: vec![passed, StepResult::skipped("second")],
            assertions: Vec::new(),
            verdict: Verdict::Cancelled,
            resources: Default::default(),
            trace: Default::default(),
        };

        let row = RunRow::from(&record);
        assert_eq!(row.steps, "1/2");
        assert_eq!(row.verdict, "cancelled");
        assert_eq!(row.duration_ms, 42);
    }
}
