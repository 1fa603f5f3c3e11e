//! CLI Commands

pub mod ai;
pub mod health;
pub mod run;
pub mod services;
pub mod validate;

use anyhow::{Context as _, Result};
use clnrm_common::definition::discover;
use clnrm_common::{Error, ErrorClass, TestDefinition};
use clnrm_engine::{EngineConfig, SuiteResult, TestRunner};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::output::{self, OutputFormat};

/// Process exit status, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    /// Every run passed
    Success,
    /// At least one verdict failed
    Failed,
    /// A definition was structurally invalid; nothing was started
    Invalid,
    /// The runtime, trace sink or history store could not be used
    Infrastructure,
}

impl Outcome {
    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failed => 1,
            Outcome::Invalid => 2,
            Outcome::Infrastructure => 3,
        }
    }

    /// Most severe bucket present in a suite
    pub fn from_suite(result: &SuiteResult) -> Self {
        if result.errored > 0 {
            Outcome::Infrastructure
        } else if result.invalid > 0 {
            Outcome::Invalid
        } else if result.all_passed() {
            Outcome::Success
        } else {
            Outcome::Failed
        }
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<Error>().map(Error::class) {
            Some(ErrorClass::Validation) => Outcome::Invalid,
            _ => Outcome::Infrastructure,
        }
    }
}

/// Settings shared by every command
pub struct Context {
    pub config_path: PathBuf,
    /// File config with `CLNRM_*` overrides applied
    pub config: EngineConfig,
    pub format: OutputFormat,
    pub verbose: bool,
}

impl Context {
    pub fn load(config_path: PathBuf, format: OutputFormat, verbose: bool) -> Result<Self> {
        let mut config = EngineConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(Self {
            config_path,
            config,
            format,
            verbose,
        })
    }

    pub fn runner(&self) -> Result<TestRunner> {
        Ok(TestRunner::new(self.config.clone())?)
    }

    pub fn runner_with(&self, config: EngineConfig) -> Result<TestRunner> {
        config.validate()?;
        Ok(TestRunner::new(config)?)
    }

    pub fn human(&self) -> bool {
        self.format == OutputFormat::Human
    }
}

/// Definition files under `paths`; finding none is a validation error
pub fn find_definitions(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let files = discover(paths)?;
    if files.is_empty() {
        let shown: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        return Err(Error::validation(shown.join(", "), "no test definitions found").into());
    }
    Ok(files)
}

/// Parse every definition, reporting the files that do not parse
///
/// Returns `None` when any file failed, so callers can stop before anything
/// is started.
pub fn load_definitions(paths: &[PathBuf]) -> Result<Option<Vec<TestDefinition>>> {
    let mut definitions = Vec::new();
    let mut failed = 0;
    for file in find_definitions(paths)? {
        match TestDefinition::from_file(&file) {
            Ok(definition) => definitions.push(definition),
            Err(e) => {
                output::print_error(&format!("{}: {}", file.display(), e));
                failed += 1;
            }
        }
    }
    debug!("Loaded {} definition(s), {} unreadable", definitions.len(), failed);
    Ok((failed == 0).then_some(definitions))
}

/// Structural and plugin checks for a whole batch; true when all pass
pub fn validate_all(runner: &TestRunner, definitions: &[TestDefinition]) -> bool {
    let mut valid = true;
    for definition in definitions {
        if let Err(e) = runner.validate(definition) {
            output::print_error(&format!("{}: {}", source_name(definition), e));
            valid = false;
        }
    }
    valid
}

/// Directories searched when a command is given no paths
pub fn default_paths() -> Vec<PathBuf> {
    ["tests", "test"]
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .collect()
}

fn source_name(definition: &TestDefinition) -> String {
    definition
        .source
        .as_deref()
        .map(Path::display)
        .map(|p| p.to_string())
        .unwrap_or_else(|| definition.name.clone())
}
