//! Declarative TOML test definitions
//!
//! A definition file declares the services a test needs, the steps to run
//! against them, and the spans the system under test is expected to emit:
//!
//! ```toml
//! [metadata]
//! name = "db-roundtrip"
//!
//! [services.db]
//! plugin = "generic_container"
//! image = "postgres:16"
//! health_check = { command = ["psql", "-c", "SELECT 1"], pattern = "1 row" }
//!
//! [[steps]]
//! name = "select"
//! service = "db"
//! command = ["psql", "-c", "SELECT 1"]
//! expected_output_regex = "1 row"
//!
//! [[steps.spans]]
//! name = "db.query"
//! attributes = { rows = "1" }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::ReuseKey;

pub const DEFAULT_PLUGIN: &str = "generic_container";

fn default_plugin() -> String {
    DEFAULT_PLUGIN.to_string()
}

/// A parsed, immutable test definition
#[derive(Debug, Clone, Serialize)]
pub struct TestDefinition {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Bound on the whole step phase
    pub timeout: Option<Duration>,
    /// Services keyed by logical name, in declaration order
    pub services: IndexMap<String, ServiceSpec>,
    /// `[[steps]]` followed by every `[scenario.<name>]` block's steps
    pub steps: Vec<Step>,
    /// Run-wide span assertions from `[[expect.span]]`
    pub expectations: Vec<TraceAssertion>,
    pub ai_management: Option<AiManagement>,
    /// File the definition was loaded from
    pub source: Option<PathBuf>,
}

/// Raw file layout
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionFile {
    metadata: Metadata,
    #[serde(default)]
    services: IndexMap<String, ServiceSpec>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    scenario: IndexMap<String, Scenario>,
    #[serde(default)]
    expect: Expectations,
    #[serde(default)]
    ai_management: Option<AiManagement>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Metadata {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Scenario {
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Expectations {
    #[serde(default)]
    span: Vec<TraceAssertion>,
}

/// A containerized (or external) dependency of a test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Logical name, filled from the table key
    #[serde(skip_deserializing)]
    pub name: String,
    /// Service class ("database", "web_server", ...), used for estimates
    #[serde(default, rename = "type")]
    pub service_type: Option<String>,
    #[serde(default = "default_plugin")]
    pub plugin: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub environment: IndexMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Command run inside the service to decide whether it is healthy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSpec {
    pub command: Vec<String>,
    /// Regex the command output must match
    #[serde(default)]
    pub pattern: Option<String>,
}

impl ServiceSpec {
    /// Content hash over plugin, image, environment and ports
    ///
    /// Environment entries are sorted first so that declaration order does not
    /// change the key.
    pub fn reuse_key(&self) -> ReuseKey {
        let mut hasher = Sha256::new();
        hasher.update(self.plugin.as_bytes());
        hasher.update([0]);
        hasher.update(self.image.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);

        let mut env: Vec<_> = self.environment.iter().collect();
        env.sort();
        for (key, value) in env {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }

        for port in &self.ports {
            hasher.update(port.to_be_bytes());
        }

        ReuseKey(hex::encode(hasher.finalize()))
    }
}

/// Expected exit status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExitExpectation {
    Code(i32),
    Class(ExitClass),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitClass {
    Success,
    Failure,
    Any,
}

impl Default for ExitExpectation {
    fn default() -> Self {
        Self::Class(ExitClass::Success)
    }
}

impl ExitExpectation {
    /// `None` means the process was killed by a signal
    pub fn matches(&self, exit_code: Option<i32>) -> bool {
        match (self, exit_code) {
            (ExitExpectation::Class(ExitClass::Any), _) => true,
            (ExitExpectation::Class(ExitClass::Success), Some(0)) => true,
            (ExitExpectation::Class(ExitClass::Failure), Some(code)) => code != 0,
            (ExitExpectation::Code(expected), Some(code)) => *expected == code,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExitExpectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitExpectation::Code(code) => write!(f, "{}", code),
            ExitExpectation::Class(ExitClass::Success) => write!(f, "success"),
            ExitExpectation::Class(ExitClass::Failure) => write!(f, "failure"),
            ExitExpectation::Class(ExitClass::Any) => write!(f, "any"),
        }
    }
}

/// One command executed during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub expected_output_regex: Option<String>,
    #[serde(default)]
    pub expect: ExitExpectation,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Service whose exec channel runs the command; host when absent
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub spans: Vec<TraceAssertion>,
}

/// Expected span in the run's trace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceAssertion {
    /// Span name; `*` matches any run of characters
    pub name: String,
    /// Attribute equality checks against the stringified value
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
    #[serde(default, rename = "where")]
    pub predicates: Vec<AttributePredicate>,
    /// Name pattern of the required parent span
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub count: Option<Cardinality>,
}

impl TraceAssertion {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: IndexMap::new(),
            predicates: Vec::new(),
            parent: None,
            count: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_count(mut self, count: Cardinality) -> Self {
        self.count = Some(count);
        self
    }

    /// Short human-readable form used in reports
    pub fn describe(&self) -> String {
        let mut out = format!("span '{}'", self.name);
        for (key, value) in &self.attributes {
            out.push_str(&format!(" {}={}", key, value));
        }
        for predicate in &self.predicates {
            out.push_str(&format!(" {}", predicate));
        }
        if let Some(parent) = &self.parent {
            out.push_str(&format!(" child-of '{}'", parent));
        }
        if let Some(count) = &self.count {
            out.push_str(&format!(" ({})", count));
        }
        out
    }
}

/// How many spans must satisfy an assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    Exactly(usize),
    AtLeast(usize),
    AtMost(usize),
}

impl Cardinality {
    pub fn admits(&self, count: usize) -> bool {
        match self {
            Cardinality::Exactly(n) => count == *n,
            Cardinality::AtLeast(n) => count >= *n,
            Cardinality::AtMost(n) => count <= *n,
        }
    }
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cardinality::Exactly(n) => write!(f, "exactly {}", n),
            Cardinality::AtLeast(n) => write!(f, "at least {}", n),
            Cardinality::AtMost(n) => write!(f, "at most {}", n),
        }
    }
}

/// Value predicate over a span attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributePredicate {
    pub key: String,
    pub op: PredicateOp,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Matches,
    Exists,
}

impl std::fmt::Display for AttributePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            PredicateOp::Eq => "==",
            PredicateOp::Ne => "!=",
            PredicateOp::Lt => "<",
            PredicateOp::Lte => "<=",
            PredicateOp::Gt => ">",
            PredicateOp::Gte => ">=",
            PredicateOp::Matches => "=~",
            PredicateOp::Exists => "exists",
        };
        match &self.value {
            Some(value) => write!(f, "{} {} {}", self.key, op, value),
            None => write!(f, "{} {}", self.key, op),
        }
    }
}

/// `[ai_management]` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiManagement {
    #[serde(default)]
    pub auto_scale: bool,
    #[serde(default)]
    pub predict_load: bool,
    #[serde(default)]
    pub optimize_resources: bool,
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
}

impl TestDefinition {
    /// Parse a definition from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: DefinitionFile = toml::from_str(content)?;

        let mut services = file.services;
        for (name, spec) in services.iter_mut() {
            spec.name = name.clone();
        }

        let mut steps = file.steps;
        for (_, scenario) in file.scenario {
            steps.extend(scenario.steps);
        }

        Ok(Self {
            name: file.metadata.name,
            description: file.metadata.description,
            tags: file.metadata.tags,
            timeout: file.metadata.timeout,
            services,
            steps,
            expectations: file.expect.span,
            ai_management: file.ai_management,
            source: None,
        })
    }

    /// Parse a definition from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut definition = Self::from_toml(&content)?;
        definition.source = Some(path.to_path_buf());
        Ok(definition)
    }

    /// Load every definition found under the given files and directories
    pub fn load_all(paths: &[PathBuf]) -> Result<Vec<Self>> {
        discover(paths)?
            .iter()
            .map(|path| Self::from_file(path))
            .collect()
    }

    pub fn has_trace_assertions(&self) -> bool {
        !self.expectations.is_empty() || self.steps.iter().any(|s| !s.spans.is_empty())
    }

    /// Every trace assertion with the step it belongs to
    pub fn trace_assertions(&self) -> impl Iterator<Item = (Option<&str>, &TraceAssertion)> {
        self.steps
            .iter()
            .flat_map(|step| step.spans.iter().map(move |a| (Some(step.name.as_str()), a)))
            .chain(self.expectations.iter().map(|a| (None, a)))
    }

    /// Structural validation: names, commands, references, cycles, patterns
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("metadata.name", "test name cannot be empty"));
        }
        if self.steps.is_empty() {
            return Err(Error::validation("steps", "at least one step is required"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::validation("metadata.timeout", "timeout must be non-zero"));
        }

        for (name, service) in &self.services {
            let path = format!("services.{}", name);
            if service.plugin.trim().is_empty() {
                return Err(Error::validation(format!("{}.plugin", path), "plugin cannot be empty"));
            }
            if let Some(image) = &service.image {
                if image.trim().is_empty() {
                    return Err(Error::validation(format!("{}.image", path), "image cannot be empty"));
                }
            }
            for (i, dep) in service.depends_on.iter().enumerate() {
                let dep_path = format!("{}.depends_on[{}]", path, i);
                if dep == name {
                    return Err(Error::validation(dep_path, "service cannot depend on itself"));
                }
                if !self.services.contains_key(dep) {
                    return Err(Error::validation(dep_path, format!("unknown service '{}'", dep)));
                }
            }
            if let Some(health) = &service.health_check {
                if health.command.is_empty() {
                    return Err(Error::validation(
                        format!("{}.health_check.command", path),
                        "health check command cannot be empty",
                    ));
                }
                if let Some(pattern) = &health.pattern {
                    check_regex(&format!("{}.health_check.pattern", path), pattern)?;
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(Error::validation(
                format!("services.{}.depends_on", cycle[0]),
                format!("dependency cycle: {}", cycle.join(" -> ")),
            ));
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            let path = format!("steps[{}]", i);
            if step.name.trim().is_empty() {
                return Err(Error::validation(format!("{}.name", path), "step name cannot be empty"));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(Error::validation(
                    format!("{}.name", path),
                    format!("duplicate step name '{}'", step.name),
                ));
            }
            if step.command.is_empty() || step.command[0].trim().is_empty() {
                return Err(Error::validation(format!("{}.command", path), "step command cannot be empty"));
            }
            if step.timeout == Some(Duration::ZERO) {
                return Err(Error::validation(format!("{}.timeout", path), "timeout must be non-zero"));
            }
            if let Some(service) = &step.service {
                if !self.services.contains_key(service) {
                    return Err(Error::validation(
                        format!("{}.service", path),
                        format!("unknown service '{}'", service),
                    ));
                }
            }
            if let Some(pattern) = &step.expected_output_regex {
                check_regex(&format!("{}.expected_output_regex", path), pattern)?;
            }
            for (j, assertion) in step.spans.iter().enumerate() {
                validate_assertion(&format!("{}.spans[{}]", path, j), assertion)?;
            }
        }

        for (i, assertion) in self.expectations.iter().enumerate() {
            validate_assertion(&format!("expect.span[{}]", i), assertion)?;
        }

        if let Some(ai) = &self.ai_management {
            if let Some(threshold) = ai.confidence_threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(Error::validation(
                        "ai_management.confidence_threshold",
                        "confidence threshold must be between 0.0 and 1.0",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Returns the first dependency cycle found, as a closed path of names
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit<'a>(
            name: &'a str,
            services: &'a IndexMap<String, ServiceSpec>,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return None,
                Mark::InProgress => {
                    let start = path.iter().position(|n| *n == name).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(name.to_string());
                    return Some(cycle);
                }
                Mark::Unvisited => {}
            }

            marks.insert(name, Mark::InProgress);
            path.push(name);
            if let Some(spec) = services.get(name) {
                for dep in &spec.depends_on {
                    if let Some(cycle) = visit(dep, services, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(name, Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for name in self.services.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(name, &self.services, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Services grouped into start waves: every service in a wave depends only
    /// on services from earlier waves. Requires a validated (acyclic) graph.
    pub fn dependency_waves(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: IndexMap<&str, HashSet<&str>> = self
            .services
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.depends_on.iter().map(String::as_str).collect()))
            .collect();

        let mut waves = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| *name)
                .collect();

            if ready.is_empty() {
                let names: Vec<&str> = remaining.keys().copied().collect();
                return Err(Error::validation(
                    "services",
                    format!("unresolvable dependencies among: {}", names.join(", ")),
                ));
            }

            for name in &ready {
                remaining.shift_remove(name);
            }
            for deps in remaining.values_mut() {
                for name in &ready {
                    deps.remove(name);
                }
            }
            waves.push(ready.into_iter().map(String::from).collect());
        }

        Ok(waves)
    }
}

fn check_regex(path: &str, pattern: &str) -> Result<()> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| Error::validation(path, format!("invalid regex: {}", e)))
}

fn validate_assertion(path: &str, assertion: &TraceAssertion) -> Result<()> {
    if assertion.name.trim().is_empty() {
        return Err(Error::validation(format!("{}.name", path), "span name cannot be empty"));
    }
    if let Some(parent) = &assertion.parent {
        if parent.trim().is_empty() {
            return Err(Error::validation(format!("{}.parent", path), "parent cannot be empty"));
        }
    }
    for (i, predicate) in assertion.predicates.iter().enumerate() {
        let pred_path = format!("{}.where[{}]", path, i);
        match (predicate.op, &predicate.value) {
            (PredicateOp::Exists, _) => {}
            (_, None) => {
                return Err(Error::validation(pred_path, "predicate requires a value"));
            }
            (PredicateOp::Matches, Some(value)) => {
                let pattern = value
                    .as_str()
                    .ok_or_else(|| Error::validation(&pred_path, "'matches' requires a string"))?;
                check_regex(&pred_path, pattern)?;
            }
            (PredicateOp::Lt | PredicateOp::Lte | PredicateOp::Gt | PredicateOp::Gte, Some(value)) => {
                if !value.is_number() {
                    return Err(Error::validation(pred_path, "ordering predicates require a number"));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Find definition files under the given paths, sorted for determinism
pub fn discover(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();

    for path in paths {
        if path.is_file() {
            found.push(path.clone());
            continue;
        }
        if !path.exists() {
            return Err(Error::validation(path.display().to_string(), "path does not exist"));
        }
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|ext| ext == "toml").unwrap_or(false))
        {
            found.push(entry.into_path());
        }
    }

    found.sort();
    found.dedup();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const ROUNDTRIP: &str = r#"
[metadata]
name = "db-roundtrip"
description = "insert then select"
timeout = "2m"
tags = ["db"]

[services.db]
type = "database"
image = "postgres:16"
environment = { POSTGRES_PASSWORD = "pw" }
ports = [5432]
health_check = { command = ["psql", "-c", "SELECT 1"], pattern = "1 row" }

[services.api]
image = "example/api:1"
depends_on = ["db"]

[[steps]]
name = "insert"
service = "db"
command = ["psql", "-c", "INSERT INTO t VALUES (1)"]
expected_output_regex = "INSERT 0 1"

[[steps]]
name = "select"
service = "db"
command = ["psql", "-c", "SELECT * FROM t"]
expected_output_regex = "1 row"
timeout = "30s"

[[steps.spans]]
name = "db.query"
attributes = { rows = "1" }
parent = "db.transaction"
count = { at_least = 1 }

[scenario.cleanup]
steps = [{ name = "drop", command = ["true"], expect = "any" }]

[[expect.span]]
name = "http.*"
where = [{ key = "status", op = "lt", value = 500 }]

[ai_management]
auto_scale = true
confidence_threshold = 0.7
"#;

    #[test]
    fn test_parse_full_definition() {
        let def = TestDefinition::from_toml(ROUNDTRIP).unwrap();
        assert_eq!(def.name, "db-roundtrip");
        assert_eq!(def.timeout, Some(Duration::from_secs(120)));
        assert_eq!(def.services.len(), 2);
        assert_eq!(def.services["db"].name, "db");
        assert_eq!(def.services["db"].plugin, DEFAULT_PLUGIN);
        assert_eq!(def.services["db"].service_type.as_deref(), Some("database"));

        let names: Vec<_> = def.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["insert", "select", "drop"]);
        assert_eq!(def.steps[1].timeout, Some(Duration::from_secs(30)));
        assert_eq!(def.steps[2].expect, ExitExpectation::Class(ExitClass::Any));
        assert_eq!(def.steps[1].spans[0].count, Some(Cardinality::AtLeast(1)));
        assert_eq!(def.trace_assertions().count(), 2);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_dependency_waves() {
        let def = TestDefinition::from_toml(ROUNDTRIP).unwrap();
        let waves = def.dependency_waves().unwrap();
        assert_eq!(waves, vec![vec!["db".to_string()], vec!["api".to_string()]]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let toml = r#"
[metadata]
name = "cyclic"

[services.a]
image = "a"
depends_on = ["b"]

[services.b]
image = "b"
depends_on = ["a"]

[[steps]]
name = "noop"
command = ["true"]
"#;
        let def = TestDefinition::from_toml(toml).unwrap();
        match def.validate() {
            Err(Error::Validation { path, message }) => {
                assert_eq!(path, "services.a.depends_on");
                assert!(message.contains("a -> b -> a"), "{}", message);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test_case("steps[0].service", "[[steps]]\nname = \"s\"\ncommand = [\"true\"]\nservice = \"missing\"" ; "unknown step target")]
    #[test_case("steps[0].expected_output_regex", "[[steps]]\nname = \"s\"\ncommand = [\"true\"]\nexpected_output_regex = \"(\"" ; "bad regex")]
    #[test_case("steps[0].command", "[[steps]]\nname = \"s\"\ncommand = []" ; "empty command")]
    #[test_case("steps", "" ; "no steps")]
    fn test_validation_paths(expected_path: &str, body: &str) {
        let toml = format!("[metadata]\nname = \"t\"\n{}", body);
        let def = TestDefinition::from_toml(&toml).unwrap();
        match def.validate() {
            Err(Error::Validation { path, .. }) => assert_eq!(path, expected_path),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_reuse_key_ignores_env_order() {
        let mut a = ServiceSpec {
            name: "db".into(),
            service_type: None,
            plugin: DEFAULT_PLUGIN.into(),
            image: Some("postgres:16".into()),
            environment: IndexMap::new(),
            ports: vec![5432],
            depends_on: vec![],
            health_check: None,
        };
        a.environment.insert("A".into(), "1".into());
        a.environment.insert("B".into(), "2".into());

        let mut b = a.clone();
        b.environment.clear();
        b.environment.insert("B".into(), "2".into());
        b.environment.insert("A".into(), "1".into());
        assert_eq!(a.reuse_key(), b.reuse_key());

        b.image = Some("postgres:15".into());
        assert_ne!(a.reuse_key(), b.reuse_key());
    }

    #[test_case(ExitExpectation::Class(ExitClass::Success), Some(0), true)]
    #[test_case(ExitExpectation::Class(ExitClass::Success), Some(1), false)]
    #[test_case(ExitExpectation::Class(ExitClass::Failure), Some(2), true)]
    #[test_case(ExitExpectation::Class(ExitClass::Failure), None, false)]
    #[test_case(ExitExpectation::Class(ExitClass::Any), None, true)]
    #[test_case(ExitExpectation::Code(3), Some(3), true)]
    fn test_exit_expectation(expect: ExitExpectation, code: Option<i32>, matches: bool) {
        assert_eq!(expect.matches(code), matches);
    }

    #[test]
    fn test_discover_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.clnrm.toml"), "").unwrap();
        std::fs::write(dir.path().join("a.clnrm.toml"), "").unwrap();
        std::fs::write(dir.path().join("notes.md"), "").unwrap();

        let found = discover(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.clnrm.toml", "b.clnrm.toml"]);
    }
}
