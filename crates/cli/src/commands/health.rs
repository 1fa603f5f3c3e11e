//! Health Commands

use anyhow::Result;
use clnrm_engine::ComponentHealth;
use colored::Colorize;

use super::{Context, Outcome};
use crate::output::{self, OutputFormat, TableDisplay};

impl TableDisplay for ComponentHealth {
    fn headers() -> Vec<&'static str> {
        vec!["Component", "Status", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.component.clone(), status_label(self).to_string(), self.detail.clone()]
    }
}

fn status_label(component: &ComponentHealth) -> &'static str {
    match (component.healthy, component.optional) {
        (true, false) => "ok",
        (true, true) => "not configured",
        (false, _) => "unreachable",
    }
}

/// Any required component down is an infrastructure failure
pub fn outcome(report: &[ComponentHealth]) -> Outcome {
    if report.iter().all(|c| c.healthy) {
        Outcome::Success
    } else {
        Outcome::Infrastructure
    }
}

pub async fn execute(ctx: &Context) -> Result<Outcome> {
    let report = ctx.runner()?.health().await;

    match ctx.format {
        OutputFormat::Human if !ctx.verbose => {
            for component in &report {
                let mark = if component.healthy {
                    "✓".green().bold()
                } else {
                    "✗".red().bold()
                };
                println!("{} {} ({})", mark, component.component, status_label(component));
            }
        }
        format => output::print_list(&report, format),
    }

    let outcome = outcome(&report);
    if ctx.human() {
        match outcome {
            Outcome::Success => output::print_success("All components healthy"),
            _ => output::print_error("One or more components are unreachable"),
        }
    }
    Ok(outcome)
}
