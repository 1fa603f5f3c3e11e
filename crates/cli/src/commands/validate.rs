//! Validate Commands

use anyhow::Result;
use clap::Args;
use clnrm_common::TestDefinition;
use clnrm_engine::runtime::CliRuntime;
use clnrm_engine::PluginRegistry;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{find_definitions, Context, Outcome};
use crate::output::{self, TableDisplay};

#[derive(Args)]
pub struct ValidateArgs {
    /// Definition files or directories
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Serialize)]
pub struct ValidationRow {
    pub file: String,
    pub test: Option<String>,
    pub valid: bool,
    pub detail: String,
}

impl TableDisplay for ValidationRow {
    fn headers() -> Vec<&'static str> {
        vec!["File", "Test", "Valid", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.file.clone(),
            self.test.clone().unwrap_or_else(|| "-".to_string()),
            if self.valid { "yes" } else { "no" }.to_string(),
            self.detail.clone(),
        ]
    }
}

/// Structural checks only; the registry is built over a runtime that is
/// never called
pub fn execute(args: ValidateArgs, ctx: &Context) -> Result<Outcome> {
    let runtime = Arc::new(CliRuntime::fallback(&ctx.config.runtime));
    let registry = PluginRegistry::with_builtins(runtime, &ctx.config.runtime.host);

    let rows: Vec<ValidationRow> = find_definitions(&args.paths)?
        .iter()
        .map(|file| check_file(file, &registry))
        .collect();
    output::print_list(&rows, ctx.format);

    let invalid = rows.iter().filter(|r| !r.valid).count();
    if invalid > 0 {
        if ctx.human() {
            output::print_error(&format!("{} of {} definition(s) invalid", invalid, rows.len()));
        }
        return Ok(Outcome::Invalid);
    }
    if ctx.human() {
        output::print_success(&format!("{} definition(s) valid", rows.len()));
    }
    Ok(Outcome::Success)
}

pub fn check_file(path: &Path, registry: &PluginRegistry) -> ValidationRow {
    let checked = TestDefinition::from_file(path).and_then(|definition| {
        definition.validate()?;
        registry.validate_definition(&definition)?;
        Ok(definition)
    });

    match checked {
        Ok(definition) => ValidationRow {
            file: path.display().to_string(),
            detail: format!(
                "{} service(s), {} step(s), {} span assertion(s)",
                definition.services.len(),
                definition.steps.len(),
                definition.trace_assertions().count()
            ),
            test: Some(definition.name),
            valid: true,
        },
        Err(e) => ValidationRow {
            file: path.display().to_string(),
            test: None,
            valid: false,
            detail: e.to_string(),
        },
    }
}
