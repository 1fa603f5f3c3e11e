//! Services Commands

use anyhow::Result;
use clap::Subcommand;
use clnrm_common::{ResourceUsage, RunRecord};
use clnrm_engine::runtime::ManagedContainer;
use clnrm_engine::scheduler::{scaling_decision, LoadForecast, LoadPredictor, ScalingDecision};
use indexmap::IndexMap;
use serde::Serialize;
use std::time::Duration;

use super::{Context, Outcome};
use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ServicesCommands {
    /// Show clnrm-managed containers and registered plugins
    Status,

    /// Forecast service load and recommend a worker pool size
    AiManage {
        /// Forecast per-run resource usage
        #[arg(long)]
        predict_load: bool,

        /// Recommend scaling the worker pool against the resource ceilings
        #[arg(long)]
        auto_scale: bool,

        /// Show the heaviest tests by measured footprint
        #[arg(long)]
        optimize_resources: bool,

        /// Prediction horizon in minutes
        #[arg(long, default_value = "5")]
        horizon_minutes: u64,
    },
}

impl TableDisplay for ManagedContainer {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Image", "Status"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.image.clone(),
            self.status.clone(),
        ]
    }
}

#[derive(Serialize)]
struct StatusReport {
    plugins: Vec<String>,
    containers: Vec<ManagedContainer>,
}

/// Measured footprint of one test across its history
#[derive(Debug, Serialize)]
pub struct ResourceRow {
    pub test: String,
    pub runs: usize,
    pub avg_cpu_cores: f64,
    pub avg_memory_mb: f64,
    pub peak_memory_mb: f64,
}

impl TableDisplay for ResourceRow {
    fn headers() -> Vec<&'static str> {
        vec!["Test", "Runs", "Avg CPU", "Avg Memory", "Peak Memory"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.test.clone(),
            self.runs.to_string(),
            format!("{:.2}", self.avg_cpu_cores),
            format!("{:.0} MB", self.avg_memory_mb),
            format!("{:.0} MB", self.peak_memory_mb),
        ]
    }
}

#[derive(Serialize, Default)]
struct ManageReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    forecast: Option<LoadForecast>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: Option<ScalingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<Vec<ResourceRow>>,
}

pub async fn execute(cmd: ServicesCommands, ctx: &Context) -> Result<Outcome> {
    match cmd {
        ServicesCommands::Status => status(ctx).await,
        ServicesCommands::AiManage {
            predict_load,
            auto_scale,
            optimize_resources,
            horizon_minutes,
        } => {
            // No flag selects everything
            let all = !(predict_load || auto_scale || optimize_resources);
            ai_manage(
                ctx,
                predict_load || all,
                auto_scale || all,
                optimize_resources || all,
                Duration::from_secs(horizon_minutes * 60),
            )
        }
    }
}

async fn status(ctx: &Context) -> Result<Outcome> {
    let runner = ctx.runner()?;
    let report = StatusReport {
        plugins: runner.registry().names(),
        containers: runner.managed_containers().await?,
    };

    if ctx.format == OutputFormat::Json {
        output::print_json(&report);
        return Ok(Outcome::Success);
    }

    output::print_section("Plugins", ctx.format);
    println!("{}", report.plugins.join(", "));
    output::print_section("Containers", ctx.format);
    if report.containers.is_empty() && ctx.human() {
        output::print_success("No clnrm containers running");
    } else {
        output::print_list(&report.containers, ctx.format);
    }
    Ok(Outcome::Success)
}

fn ai_manage(
    ctx: &Context,
    predict_load: bool,
    auto_scale: bool,
    optimize_resources: bool,
    horizon: Duration,
) -> Result<Outcome> {
    let runner = ctx.runner()?;
    let history = runner.history_snapshot()?;
    let scheduler = &ctx.config.scheduler;
    let mut report = ManageReport::default();

    let forecast = LoadPredictor::from_history(&history).predict(horizon);
    if forecast.is_none() && (predict_load || auto_scale) {
        output::print_warning(&format!(
            "Not enough run history for a forecast ({} run(s) with measured resources)",
            history.iter().filter(|r| measured(r)).count()
        ));
    }
    if let Some(forecast) = forecast {
        if auto_scale {
            report.decision = Some(scaling_decision(&forecast, scheduler.max_workers, scheduler));
        }
        if predict_load {
            report.forecast = Some(forecast);
        }
    }
    if optimize_resources {
        report.resources = Some(resource_rows(&history));
    }

    if ctx.format == OutputFormat::Json {
        output::print_json(&report);
        return Ok(Outcome::Success);
    }

    if let Some(forecast) = &report.forecast {
        output::print_section("Load forecast", ctx.format);
        let rows = vec![
            vec!["Horizon".to_string(), humantime::format_duration(forecast.horizon).to_string()],
            vec!["Samples".to_string(), forecast.samples.to_string()],
            vec!["CPU per run".to_string(), format!("{:.2} cores", forecast.predicted.cpu_cores)],
            vec!["Memory per run".to_string(), format!("{:.0} MB", forecast.predicted.memory_mb)],
            vec!["CPU trend".to_string(), output::percent(forecast.cpu_trend)],
            vec!["Memory trend".to_string(), output::percent(forecast.memory_trend)],
        ];
        println!("{}", output::render_rows(&["Metric", "Value"], &rows, ctx.format));
    }
    if let Some(decision) = &report.decision {
        output::print_section("Scaling", ctx.format);
        println!(
            "{} (ceilings: {:.1} cores, {:.0} MB; bounds {}-{})",
            decision, scheduler.cpu_ceiling, scheduler.memory_ceiling_mb, scheduler.min_workers, scheduler.max_workers
        );
    }
    if let Some(resources) = &report.resources {
        output::print_section("Resource usage by test", ctx.format);
        output::print_list(resources, ctx.format);
    }
    Ok(Outcome::Success)
}

fn measured(record: &RunRecord) -> bool {
    record.resources.cpu_cores > 0.0 || record.resources.memory_mb > 0.0
}

/// Heaviest tests first, by average memory
pub fn resource_rows(history: &[RunRecord]) -> Vec<ResourceRow> {
    let mut by_test: IndexMap<&str, Vec<ResourceUsage>> = IndexMap::new();
    for record in history.iter().filter(|r| measured(r)) {
        by_test.entry(record.test_name.as_str()).or_default().push(record.resources);
    }

    let mut rows: Vec<ResourceRow> = by_test
        .into_iter()
        .map(|(test, samples)| {
            let n = samples.len() as f64;
            let sum = samples.iter().fold(ResourceUsage::default(), |acc, u| acc + *u);
            ResourceRow {
                test: test.to_string(),
                runs: samples.len(),
                avg_cpu_cores: sum.cpu_cores / n,
                avg_memory_mb: sum.memory_mb / n,
                peak_memory_mb: samples.iter().map(|u| u.memory_mb).fold(0.0, f64::max),
            }
        })
        .collect();
    rows.sort_by(|a, b| b.avg_memory_mb.total_cmp(&a.avg_memory_mb));
    rows
}
