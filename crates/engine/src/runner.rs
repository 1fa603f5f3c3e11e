//! Top-level runner wiring the engine together from an [`EngineConfig`]

use chrono::Utc;
use clnrm_common::{Database, ExecutionPlan, Result, RunRecord, TestDefinition};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::coordinator::RunCoordinator;
use crate::executor::StepExecutor;
use crate::lifecycle::LifecycleManager;
use crate::plugin::PluginRegistry;
use crate::runtime::{CliRuntime, ContainerRuntime, ManagedContainer};
use crate::scheduler::{HttpOracle, Scheduler};
use crate::trace::{sink_from_config, TraceSink, TraceValidator};
use crate::workers::{SuiteResult, WorkerPool};

/// Result of one `health` probe
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub healthy: bool,
    /// Not configured; absence is not a failure
    pub optional: bool,
    pub detail: String,
}

impl ComponentHealth {
    fn ok(component: &str, detail: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            healthy: true,
            optional: false,
            detail: detail.into(),
        }
    }

    fn failed(component: &str, detail: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            healthy: false,
            optional: false,
            detail: detail.into(),
        }
    }

    fn absent(component: &str, detail: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            healthy: true,
            optional: true,
            detail: detail.into(),
        }
    }
}

pub struct TestRunner {
    config: EngineConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    registry: Arc<PluginRegistry>,
    lifecycle: Arc<LifecycleManager>,
    validator: Arc<TraceValidator>,
    coordinator: Arc<RunCoordinator>,
    scheduler: Scheduler,
    history: Option<Database>,
}

impl TestRunner {
    /// Runner with the docker/podman runtime, the built-in plugins, the
    /// configured trace sink and the history database
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let runtime: Arc<dyn ContainerRuntime> = match CliRuntime::new(&config.runtime) {
            Ok(runtime) => Arc::new(runtime),
            Err(e) => {
                warn!("{}; container services will fail to start", e);
                Arc::new(CliRuntime::fallback(&config.runtime))
            }
        };
        let registry = PluginRegistry::with_builtins(runtime.clone(), &config.runtime.host);
        let sink = sink_from_config(&config.trace)?;
        let history = match &config.history.path {
            Some(path) => Some(Database::open(path)?),
            None => None,
        };

        let mut runner = Self::from_parts(config, registry, sink, history)?;
        runner.runtime = Some(runtime);
        Ok(runner)
    }

    /// Runner over an explicit registry and sink, no container runtime
    pub fn from_parts(
        config: EngineConfig,
        registry: PluginRegistry,
        sink: Option<Arc<dyn TraceSink>>,
        history: Option<Database>,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let lifecycle = Arc::new(LifecycleManager::new(registry.clone(), config.lifecycle.clone()));
        let executor = Arc::new(StepExecutor::new(config.executor.clone()));
        let validator = Arc::new(TraceValidator::new(sink, &config.trace));

        let mut coordinator = RunCoordinator::new(lifecycle.clone(), executor, validator.clone());
        if let Some(history) = &history {
            coordinator = coordinator.with_history(history.clone());
        }
        let scheduler = Scheduler::from_config(config.scheduler.clone())?.with_registry(registry.clone());

        Ok(Self {
            config,
            runtime: None,
            registry,
            lifecycle,
            validator,
            coordinator: Arc::new(coordinator),
            scheduler,
            history,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn history(&self) -> Option<&Database> {
        self.history.as_ref()
    }

    /// Structural and plugin validation of one definition
    pub fn validate(&self, definition: &TestDefinition) -> Result<()> {
        self.coordinator.validate(definition)
    }

    /// History inside the configured window, oldest first
    pub fn history_snapshot(&self) -> Result<Vec<RunRecord>> {
        match &self.history {
            Some(db) => {
                let since = Utc::now() - chrono::Duration::days(self.config.scheduler.history_window_days);
                db.runs_since(since)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Plan a batch; an unreadable history degrades to the default plan
    pub async fn plan(&self, definitions: &[TestDefinition]) -> ExecutionPlan {
        match self.history_snapshot() {
            Ok(history) => self.scheduler.plan(definitions, &history).await,
            Err(e) => self
                .scheduler
                .default_plan(definitions, &format!("history unavailable: {}", e)),
        }
    }

    pub async fn run_one(&self, definition: &TestDefinition, cancel: CancellationToken) -> RunRecord {
        self.coordinator.run(definition, cancel).await
    }

    /// Plan and run a batch; `parallel` lets the pool grow past one worker
    pub async fn run_all(
        &self,
        definitions: Vec<TestDefinition>,
        parallel: bool,
        cancel: CancellationToken,
    ) -> SuiteResult {
        let plan = self.plan(&definitions).await;
        self.run_plan(&plan, definitions, parallel, cancel).await
    }

    pub async fn run_plan(
        &self,
        plan: &ExecutionPlan,
        definitions: Vec<TestDefinition>,
        parallel: bool,
        cancel: CancellationToken,
    ) -> SuiteResult {
        let (min, max) = if parallel {
            (self.config.scheduler.min_workers, self.config.scheduler.max_workers)
        } else {
            (1, 1)
        };
        let pool = WorkerPool::new(self.coordinator.clone(), min, max);
        let result = pool.run(plan, Arc::new(definitions), cancel).await;

        let drained = self.lifecycle.shutdown().await;
        if drained > 0 {
            info!("Stopped {} pooled instance(s)", drained);
        }
        result
    }

    /// Containers clnrm created that the runtime still knows about
    pub async fn managed_containers(&self) -> Result<Vec<ManagedContainer>> {
        match &self.runtime {
            Some(runtime) => runtime.list_managed().await,
            None => Ok(Vec::new()),
        }
    }

    /// Probe every external collaborator
    pub async fn health(&self) -> Vec<ComponentHealth> {
        let mut report = Vec::new();

        report.push(match &self.runtime {
            Some(runtime) => match runtime.ping().await {
                Ok(()) => ComponentHealth::ok("container_runtime", runtime.name()),
                Err(e) => ComponentHealth::failed("container_runtime", e.to_string()),
            },
            None => ComponentHealth::absent("container_runtime", "not configured"),
        });

        report.push(match self.validator.sink() {
            Some(sink) => match sink.probe().await {
                Ok(()) => ComponentHealth::ok("trace_sink", sink.describe()),
                Err(e) => ComponentHealth::failed("trace_sink", e.to_string()),
            },
            None => ComponentHealth::absent("trace_sink", "spans read from step output only"),
        });

        report.push(match &self.history {
            Some(db) => match db.count() {
                Ok(n) => ComponentHealth::ok("history", format!("{} run(s) recorded", n)),
                Err(e) => ComponentHealth::failed("history", e.to_string()),
            },
            None => ComponentHealth::absent("history", "disabled"),
        });

        report.push(match &self.config.scheduler.oracle_endpoint {
            Some(endpoint) => match HttpOracle::new(endpoint, self.config.scheduler.oracle_timeout) {
                Ok(oracle) => match oracle.probe().await {
                    Ok(()) => ComponentHealth::ok("oracle", endpoint.clone()),
                    Err(e) => ComponentHealth::failed("oracle", e.to_string()),
                },
                Err(e) => ComponentHealth::failed("oracle", e.to_string()),
            },
            None => ComponentHealth::absent("oracle", "historical scoring"),
        });

        report.push(ComponentHealth::ok(
            "plugins",
            self.registry.names().join(", "),
        ));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlugin;

    fn runner(history: Option<Database>) -> TestRunner {
        let mut registry = PluginRegistry::new();
        registry.register("mock", Arc::new(MockPlugin::new()));
        TestRunner::from_parts(EngineConfig::default(), registry, None, history).unwrap()
    }

    fn definition(name: &str) -> TestDefinition {
        TestDefinition::from_toml(&format!(
            "[metadata]\nname = \"{}\"\n[[steps]]\nname = \"s\"\ncommand = [\"sh\", \"-c\", \"echo ok\"]\n",
            name
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_runs_are_recorded_in_history() {
        let db = Database::open_memory().unwrap();
        let runner = runner(Some(db.clone()));

        let record = runner.run_one(&definition("one"), CancellationToken::new()).await;
        assert!(record.passed());
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(runner.history_snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_plan_is_degraded_then_informed() {
        let db = Database::open_memory().unwrap();
        let runner = runner(Some(db));
        let defs = vec![definition("a"), definition("b")];

        let first = runner.run_all(defs.clone(), true, CancellationToken::new()).await;
        assert_eq!(first.passed, 2);
        assert!(runner.plan(&defs).await.items.len() == 2);
        assert!(!runner.plan(&defs).await.degraded);
    }

    #[tokio::test]
    async fn test_health_without_collaborators() {
        let report = runner(None).health().await;
        assert!(report.iter().all(|c| c.healthy));
        assert!(report.iter().any(|c| c.component == "plugins" && c.detail == "mock"));
    }

    #[tokio::test]
    async fn test_no_runtime_lists_no_containers() {
        assert!(runner(None).managed_containers().await.unwrap().is_empty());
    }
}
