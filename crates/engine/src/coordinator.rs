//! Run coordinator
//!
//! Drives one test through `Validating -> StartingServices -> ExecutingSteps
//! -> CollectingTraces -> Verdict`. Whatever happens in between, including a
//! panic or a cancellation, started services are torn down before the run
//! record is produced.

use chrono::Utc;
use clnrm_common::{
    AssertionOutcome, Database, Error, ErrorClass, FailureCause, RunRecord, StepFailure, StepResult,
    StepStatus, TestDefinition, TraceBundleRef, Verdict,
};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{StepContext, StepExecutor};
use crate::lifecycle::{LifecycleManager, ServiceGroup};
use crate::trace::{parse_json_lines, ScopedAssertion, SpanSet, TraceContext, TraceValidator};

/// Coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Validating,
    StartingServices,
    ExecutingSteps,
    CollectingTraces,
    Verdict,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Validating => write!(f, "validating"),
            RunState::StartingServices => write!(f, "starting_services"),
            RunState::ExecutingSteps => write!(f, "executing_steps"),
            RunState::CollectingTraces => write!(f, "collecting_traces"),
            RunState::Verdict => write!(f, "verdict"),
        }
    }
}

/// Run-scoped context; nothing here outlives the run
struct RunContext {
    run_id: String,
    trace: TraceContext,
    cancel: CancellationToken,
    state: RunState,
}

impl RunContext {
    fn transition(&mut self, next: RunState) {
        debug!(run_id = %self.run_id, "{} -> {}", self.state, next);
        self.state = next;
    }
}

/// What the step and trace phases produced
struct ExecutionOutcome {
    step_results: Vec<StepResult>,
    assertions: Vec<AssertionOutcome>,
    span_count: usize,
    verdict: Verdict,
}

pub struct RunCoordinator {
    lifecycle: Arc<LifecycleManager>,
    executor: Arc<StepExecutor>,
    validator: Arc<TraceValidator>,
    history: Option<Database>,
}

impl RunCoordinator {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        executor: Arc<StepExecutor>,
        validator: Arc<TraceValidator>,
    ) -> Self {
        Self {
            lifecycle,
            executor,
            validator,
            history: None,
        }
    }

    /// Append every finished run to this store
    pub fn with_history(mut self, history: Database) -> Self {
        self.history = Some(history);
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Structural and plugin validation, no side effects
    pub fn validate(&self, definition: &TestDefinition) -> clnrm_common::Result<()> {
        definition.validate()?;
        self.lifecycle.registry().validate_definition(definition)
    }

    /// Run one test to a record
    pub async fn run(&self, definition: &TestDefinition, cancel: CancellationToken) -> RunRecord {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut ctx = RunContext {
            trace: TraceContext::new(&run_id),
            run_id,
            cancel,
            state: RunState::Validating,
        };
        info!(
            run_id = %ctx.run_id,
            trace_id = %ctx.trace.trace_id,
            "Running {}",
            definition.name
        );

        let mut resources = self.lifecycle.registry().estimate_definition(definition);
        let outcome = match self.prepare(definition, &mut ctx).await {
            Err(verdict) => ExecutionOutcome {
                step_results: skipped_all(definition),
                assertions: Vec::new(),
                span_count: 0,
                verdict,
            },
            Ok(group) => {
                ctx.transition(RunState::ExecutingSteps);
                let body = AssertUnwindSafe(self.execute(definition, &group, &mut ctx)).catch_unwind();
                let outcome = match body.await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let message = panic_message(&panic);
                        error!("Run of {} panicked: {}", definition.name, message);
                        ExecutionOutcome {
                            step_results: skipped_all(definition),
                            assertions: Vec::new(),
                            span_count: 0,
                            verdict: Verdict::Error(format!("run panicked: {}", message)),
                        }
                    }
                };

                if let Some(usage) = group.resource_usage().await {
                    resources = usage;
                }

                // Unconditional teardown; failures are logged inside
                let torn_down = self.lifecycle.stop_all(group).await;
                debug!("Tore down {} instance(s)", torn_down.len());
                outcome
            }
        };

        ctx.transition(RunState::Verdict);
        let record = RunRecord {
            run_id: ctx.run_id.clone(),
            test_name: definition.name.clone(),
            started_at,
            finished_at: Utc::now(),
            step_results: outcome.step_results,
            assertions: outcome.assertions,
            verdict: outcome.verdict,
            resources,
            trace: TraceBundleRef {
                trace_id: ctx.trace.trace_id.clone(),
                span_count: outcome.span_count,
                source: self.validator.source(),
            },
        };

        match &record.verdict {
            Verdict::Pass => info!("✓ {} ({} ms)", record.test_name, record.duration_ms()),
            verdict => warn!("✗ {} - {}", record.test_name, verdict),
        }

        if let Some(history) = &self.history {
            if let Err(e) = history.append_run(&record) {
                warn!("Failed to append run {} to history: {}", record.run_id, e);
            }
        }

        record
    }

    /// Validate, probe the trace sink, start services
    async fn prepare(
        &self,
        definition: &TestDefinition,
        ctx: &mut RunContext,
    ) -> std::result::Result<ServiceGroup, Verdict> {
        if let Err(e) = self.validate(definition) {
            warn!("{} is invalid: {}", definition.name, e);
            return Err(Verdict::Invalid(e.to_string()));
        }

        if definition.has_trace_assertions() {
            if let Err(e) = self.validator.probe().await {
                return Err(Verdict::Error(e.to_string()));
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(Verdict::Cancelled);
        }

        ctx.transition(RunState::StartingServices);
        match self.lifecycle.start_all(definition, &ctx.cancel).await {
            Ok(group) => Ok(group),
            Err(e) => Err(start_failure_verdict(e)),
        }
    }

    /// Steps in order, abort on first failure, then trace collection
    async fn execute(
        &self,
        definition: &TestDefinition,
        group: &ServiceGroup,
        ctx: &mut RunContext,
    ) -> ExecutionOutcome {
        let deadline = definition.timeout.map(|t| Instant::now() + t);
        let mut env = ctx.trace.env(&definition.name);
        env.extend(group.connection_env());

        let step_ctx = StepContext {
            services: group,
            env,
            deadline,
            cancel: &ctx.cancel,
        };

        let mut results = Vec::with_capacity(definition.steps.len());
        let mut harvested = SpanSet::new();
        let mut verdict = None;

        for step in &definition.steps {
            if ctx.cancel.is_cancelled() {
                verdict = Some(Verdict::Cancelled);
                break;
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                verdict = Some(run_timeout(definition.timeout));
                break;
            }

            let result = self.executor.execute(step, &step_ctx).await;
            harvested.extend(parse_json_lines(&result.stdout));

            match &result.status {
                StepStatus::Passed => results.push(result),
                StepStatus::Skipped => {
                    results.push(result);
                    verdict = Some(Verdict::Cancelled);
                    break;
                }
                StepStatus::Failed(failure) => {
                    let cut_by_deadline = matches!(failure, StepFailure::Timeout { .. })
                        && deadline.map(|d| Instant::now() >= d).unwrap_or(false);
                    verdict = Some(if cut_by_deadline {
                        run_timeout(definition.timeout)
                    } else {
                        Verdict::Fail(FailureCause::Step {
                            step: step.name.clone(),
                            failure: failure.clone(),
                        })
                    });
                    results.push(result);
                    break;
                }
            }
        }

        // Every declared step gets a result
        for step in definition.steps.iter().skip(results.len()) {
            results.push(StepResult::skipped(&step.name));
        }

        if matches!(verdict, Some(Verdict::Cancelled)) {
            return ExecutionOutcome {
                step_results: results,
                assertions: Vec::new(),
                span_count: harvested.len(),
                verdict: Verdict::Cancelled,
            };
        }

        if !definition.has_trace_assertions() {
            return ExecutionOutcome {
                step_results: results,
                assertions: Vec::new(),
                span_count: harvested.for_trace(&ctx.trace.trace_id).len(),
                verdict: verdict.unwrap_or(Verdict::Pass),
            };
        }

        ctx.transition(RunState::CollectingTraces);
        let assertions: Vec<ScopedAssertion> = definition
            .trace_assertions()
            .map(|(step, assertion)| ScopedAssertion {
                step: step.map(String::from),
                assertion: assertion.clone(),
            })
            .collect();

        // A failed run is already decided; do not wait for late spans
        let collected = if verdict.is_some() {
            self.validator
                .snapshot(&ctx.trace.trace_id, &harvested, &assertions, &ctx.cancel)
                .await
        } else {
            self.validator
                .collect(&ctx.trace.trace_id, &harvested, &assertions, &ctx.cancel)
                .await
        };

        match collected {
            Ok(collection) => {
                let verdict = verdict.unwrap_or_else(|| match collection.first_failure() {
                    Some(failure) => Verdict::Fail(FailureCause::Trace {
                        failure: failure.clone(),
                    }),
                    None => Verdict::Pass,
                });
                ExecutionOutcome {
                    step_results: results,
                    span_count: collection.spans.len(),
                    assertions: collection.outcomes,
                    verdict,
                }
            }
            Err(Error::Cancelled) => ExecutionOutcome {
                step_results: results,
                assertions: Vec::new(),
                span_count: harvested.len(),
                verdict: Verdict::Cancelled,
            },
            Err(e) => ExecutionOutcome {
                step_results: results,
                assertions: Vec::new(),
                span_count: harvested.len(),
                verdict: verdict.unwrap_or(Verdict::Error(e.to_string())),
            },
        }
    }
}

fn skipped_all(definition: &TestDefinition) -> Vec<StepResult> {
    definition
        .steps
        .iter()
        .map(|step| StepResult::skipped(&step.name))
        .collect()
}

fn run_timeout(timeout: Option<Duration>) -> Verdict {
    Verdict::Fail(FailureCause::Timeout {
        after: timeout.unwrap_or_default(),
    })
}

fn start_failure_verdict(err: Error) -> Verdict {
    match err {
        Error::Cancelled => Verdict::Cancelled,
        Error::ServiceStart { service, reason, .. } => {
            Verdict::Fail(FailureCause::ServiceStart { service, reason })
        }
        Error::HealthCheckTimeout { service, waited } => Verdict::Fail(FailureCause::ServiceStart {
            service,
            reason: format!("not healthy after {:?}", waited),
        }),
        other if other.class() == ErrorClass::Validation => Verdict::Invalid(other.to_string()),
        other => Verdict::Error(other.to_string()),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, LifecycleConfig};
    use crate::plugin::PluginRegistry;
    use crate::testing::MockPlugin;
    use clnrm_common::{LifecycleState, ResourceUsage};

    fn coordinator(plugin: Arc<MockPlugin>) -> RunCoordinator {
        let mut registry = PluginRegistry::new();
        registry.register("mock", plugin);
        let config = EngineConfig::default();
        let lifecycle = LifecycleManager::new(
            Arc::new(registry),
            LifecycleConfig {
                health_max_wait: Duration::from_millis(200),
                health_initial_backoff: Duration::from_millis(5),
                ..LifecycleConfig::default()
            },
        );
        RunCoordinator::new(
            Arc::new(lifecycle),
            Arc::new(StepExecutor::new(config.executor.clone())),
            Arc::new(TraceValidator::new(None, &config.trace)),
        )
    }

    fn definition() -> TestDefinition {
        TestDefinition::from_toml(
            r#"
[metadata]
name = "coordinated"

[services.db]
plugin = "mock"
image = "db"

[[steps]]
name = "first"
command = ["sh", "-c", "echo one"]

[[steps]]
name = "second"
command = ["sh", "-c", "exit 1"]
service = "db"

[[steps]]
name = "third"
command = ["sh", "-c", "echo three"]
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_abort_on_first_failure_keeps_step_count() {
        let plugin = Arc::new(MockPlugin::new());
        let record = coordinator(plugin.clone())
            .run(&definition(), CancellationToken::new())
            .await;

        assert_eq!(record.step_results.len(), 3);
        assert!(record.step_results[0].passed());
        assert!(record.step_results[1].failure().is_some());
        assert_eq!(record.step_results[2].status, StepStatus::Skipped);
        assert!(matches!(
            record.verdict,
            Verdict::Fail(FailureCause::Step { ref step, .. }) if step == "second"
        ));
        assert!(plugin.all_stopped());
    }

    #[tokio::test]
    async fn test_invalid_definition_starts_nothing() {
        let plugin = Arc::new(MockPlugin::new());
        let mut def = definition();
        def.steps[0].service = Some("missing".into());

        let record = coordinator(plugin.clone()).run(&def, CancellationToken::new()).await;
        assert!(matches!(record.verdict, Verdict::Invalid(_)));
        assert_eq!(record.step_results.len(), 3);
        assert!(record
            .step_results
            .iter()
            .all(|r| r.status == StepStatus::Skipped));
        assert_eq!(plugin.starts(), 0);
    }

    #[tokio::test]
    async fn test_service_start_failure() {
        let plugin = Arc::new(MockPlugin::new().unhealthy("db"));
        let record = coordinator(plugin.clone())
            .run(&definition(), CancellationToken::new())
            .await;

        assert!(matches!(
            record.verdict,
            Verdict::Fail(FailureCause::ServiceStart { ref service, .. }) if service == "db"
        ));
        assert_eq!(record.step_results.len(), 3);
        assert!(plugin.all_stopped());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let plugin = Arc::new(MockPlugin::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let record = coordinator(plugin.clone()).run(&definition(), cancel).await;
        assert_eq!(record.verdict, Verdict::Cancelled);
        assert_eq!(plugin.starts(), 0);
    }

    #[tokio::test]
    async fn test_panic_still_tears_down() {
        let plugin = Arc::new(MockPlugin::new().panic_on_exec("db"));
        let record = coordinator(plugin.clone())
            .run(&definition(), CancellationToken::new())
            .await;

        assert!(matches!(record.verdict, Verdict::Error(ref msg) if msg.contains("panicked")));
        assert_eq!(record.step_results.len(), 3);
        assert_eq!(plugin.starts(), 1);
        assert!(plugin.all_stopped());
    }

    #[tokio::test]
    async fn test_global_timeout() {
        let plugin = Arc::new(MockPlugin::new());
        let def = TestDefinition::from_toml(
            r#"
[metadata]
name = "slow"
timeout = "300ms"

[[steps]]
name = "sleep"
command = ["sh", "-c", "sleep 5"]

[[steps]]
name = "after"
command = ["true"]
"#,
        )
        .unwrap();

        let record = coordinator(plugin).run(&def, CancellationToken::new()).await;
        assert!(matches!(
            record.verdict,
            Verdict::Fail(FailureCause::Timeout { .. })
        ));
        assert_eq!(record.step_results[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_resources_from_stats() {
        let plugin = Arc::new(MockPlugin::new().with_usage(ResourceUsage::new(1.5, 300.0)));
        let def = definition();
        let record = coordinator(plugin).run(&def, CancellationToken::new()).await;
        assert_eq!(record.resources, ResourceUsage::new(1.5, 300.0));
    }

    #[tokio::test]
    async fn test_stopped_state_reported() {
        let plugin = Arc::new(MockPlugin::new());
        coordinator(plugin.clone())
            .run(&definition(), CancellationToken::new())
            .await;
        let states = plugin.instance_states();
        assert_eq!(states.len(), 1);
        assert!(states.values().all(|s| *s == LifecycleState::Stopped));
    }
}
