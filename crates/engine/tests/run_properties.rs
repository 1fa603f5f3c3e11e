//! End-to-end run properties against the host-backed mock plugin

use std::sync::Arc;
use std::time::Duration;

use clnrm_common::{
    FailureCause, LifecycleState, StepFailure, StepStatus, TestDefinition, TraceFailure, Verdict,
};
use clnrm_engine::config::{EngineConfig, RuntimeConfig};
use clnrm_engine::runtime::CliRuntime;
use clnrm_engine::testing::{MemoryTraceSink, MockPlugin};
use clnrm_engine::{PluginRegistry, TestRunner};
use tokio_util::sync::CancellationToken;

fn fast_config(reuse: bool) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.lifecycle.health_max_wait = Duration::from_secs(2);
    config.lifecycle.health_initial_backoff = Duration::from_millis(10);
    config.lifecycle.health_max_backoff = Duration::from_millis(50);
    config.lifecycle.reuse_containers = reuse;
    config.trace.poll_timeout = Duration::from_millis(300);
    config.trace.poll_interval = Duration::from_millis(50);
    config.history.path = None;
    config
}

fn runner_with(plugin: Arc<MockPlugin>, config: EngineConfig) -> TestRunner {
    let mut registry = PluginRegistry::new();
    registry.register("mock", plugin);
    TestRunner::from_parts(config, registry, None, None).unwrap()
}

fn runner(plugin: Arc<MockPlugin>) -> TestRunner {
    runner_with(plugin, fast_config(false))
}

const DB_ROUNDTRIP: &str = r#"
[metadata]
name = "db-roundtrip"

[services.db]
plugin = "mock"
image = "postgres:16"
health_check = { command = ["sh", "-c", "echo '(1 row)'"], pattern = "1 row" }

[[steps]]
name = "insert-select"
service = "db"
command = ["sh", "-c", '''
echo 'INSERT 0 1'
echo '(1 row)'
printf '{"traceId":"%s","spanId":"a1","name":"db.transaction"}\n' "$CLNRM_TRACE_ID"
printf '{"traceId":"%s","spanId":"b2","parentSpanId":"a1","name":"db.query","attributes":{"rows":"1"}}\n' "$CLNRM_TRACE_ID"
''']
expected_output_regex = "1 row"

[[steps.spans]]
name = "db.query"
attributes = { rows = "1" }
"#;

#[tokio::test]
async fn db_roundtrip_passes() {
    let plugin = Arc::new(MockPlugin::new());
    let def = TestDefinition::from_toml(DB_ROUNDTRIP).unwrap();

    let record = runner(plugin.clone()).run_one(&def, CancellationToken::new()).await;
    assert_eq!(record.verdict, Verdict::Pass, "{:?}", record);
    assert_eq!(record.trace.span_count, 2);
    assert_eq!(record.assertions.len(), 1);
    assert!(record.assertions[0].passed());
    assert!(plugin.all_stopped());
}

#[tokio::test]
async fn db_roundtrip_wrong_row_count_is_output_mismatch() {
    let plugin = Arc::new(MockPlugin::new());
    let def = TestDefinition::from_toml(&DB_ROUNDTRIP.replace(
        "expected_output_regex = \"1 row\"",
        "expected_output_regex = \"2 row\"",
    ))
    .unwrap();

    let record = runner(plugin.clone()).run_one(&def, CancellationToken::new()).await;
    match record.verdict {
        Verdict::Fail(FailureCause::Step { step, failure }) => {
            assert_eq!(step, "insert-select");
            assert_eq!(failure, StepFailure::OutputMismatch { pattern: "2 row".into() });
        }
        other => panic!("unexpected verdict {:?}", other),
    }
    assert!(plugin.all_stopped());
}

#[tokio::test]
async fn cyclic_dependencies_start_nothing() {
    let plugin = Arc::new(MockPlugin::new());
    let def = TestDefinition::from_toml(
        r#"
[metadata]
name = "cycle"

[services.a]
plugin = "mock"
image = "a"
depends_on = ["b"]

[services.b]
plugin = "mock"
image = "b"
depends_on = ["a"]

[[steps]]
name = "s"
command = ["true"]
"#,
    )
    .unwrap();

    let runner = runner(plugin.clone());
    assert!(runner.validate(&def).unwrap_err().is_validation());

    let record = runner.run_one(&def, CancellationToken::new()).await;
    assert!(matches!(record.verdict, Verdict::Invalid(_)));
    assert_eq!(record.step_results.len(), 1);
    assert_eq!(plugin.starts(), 0);
}

#[tokio::test]
async fn every_step_gets_a_result() {
    let plugin = Arc::new(MockPlugin::new());
    let def = TestDefinition::from_toml(
        r#"
[metadata]
name = "abort"

[[steps]]
name = "one"
command = ["true"]

[[steps]]
name = "two"
command = ["false"]

[scenario.later]
steps = [
    { name = "three", command = ["true"] },
    { name = "four", command = ["true"] },
]
"#,
    )
    .unwrap();

    let record = runner(plugin).run_one(&def, CancellationToken::new()).await;
    assert_eq!(record.step_results.len(), def.steps.len());
    let statuses: Vec<_> = record.step_results.iter().map(|r| r.status.clone()).collect();
    assert_eq!(statuses[0], StepStatus::Passed);
    assert!(matches!(
        statuses[1],
        StepStatus::Failed(StepFailure::NonZeroExit { actual: Some(1), .. })
    ));
    assert_eq!(statuses[2], StepStatus::Skipped);
    assert_eq!(statuses[3], StepStatus::Skipped);
}

#[tokio::test]
async fn reuse_skips_creation_but_still_health_checks() {
    let plugin = Arc::new(MockPlugin::new());
    let runner = runner_with(plugin.clone(), fast_config(true));
    let def = TestDefinition::from_toml(DB_ROUNDTRIP).unwrap();

    let first = runner.run_one(&def, CancellationToken::new()).await;
    assert!(first.passed());
    assert_eq!(plugin.starts(), 1);
    let checks = plugin.health_checks();

    let second = runner.run_one(&def, CancellationToken::new()).await;
    assert_eq!(second.verdict, first.verdict);
    assert_eq!(plugin.starts(), 1);
    assert!(plugin.health_checks() > checks);
    assert_eq!(runner.lifecycle().reuse_stats().reused, 1);

    assert_eq!(runner.lifecycle().shutdown().await, 1);
    assert!(plugin.all_stopped());
}

#[tokio::test]
async fn teardown_is_unconditional() {
    let failing_trace = DB_ROUNDTRIP.replace("name = \"db.query\"\nattributes", "name = \"db.missing\"\nattributes");
    let failing_step = DB_ROUNDTRIP.replace("expected_output_regex = \"1 row\"", "expected_output_regex = \"nope\"");

    for body in [DB_ROUNDTRIP.to_string(), failing_trace, failing_step] {
        let plugin = Arc::new(MockPlugin::new());
        let def = TestDefinition::from_toml(&body).unwrap();
        runner(plugin.clone()).run_one(&def, CancellationToken::new()).await;

        let states = plugin.instance_states();
        assert_eq!(states.len(), 1);
        assert!(states.values().all(|s| *s == LifecycleState::Stopped));
    }

    let plugin = Arc::new(MockPlugin::new().unhealthy("db"));
    let def = TestDefinition::from_toml(DB_ROUNDTRIP).unwrap();
    let record = runner(plugin.clone()).run_one(&def, CancellationToken::new()).await;
    assert!(matches!(record.verdict, Verdict::Fail(FailureCause::ServiceStart { .. })));
    assert!(plugin.instance_states().values().all(|s| *s == LifecycleState::Stopped));
}

const PARENT_CHILD: &str = r#"
[metadata]
name = "parentage"

[[steps]]
name = "emit"
command = ["sh", "-c", '''
printf '{"traceId":"%s","spanId":"aa","name":"A"}\n' "$CLNRM_TRACE_ID"
printf '{"traceId":"%s","spanId":"bb","parentSpanId":"aa","name":"B"}\n' "$CLNRM_TRACE_ID"
''']

[[expect.span]]
name = "B"
parent = "PARENT"
"#;

#[tokio::test]
async fn child_span_relationship() {
    let plugin = Arc::new(MockPlugin::new());
    let runner = runner(plugin);

    let ok = TestDefinition::from_toml(&PARENT_CHILD.replace("PARENT", "A")).unwrap();
    assert_eq!(runner.run_one(&ok, CancellationToken::new()).await.verdict, Verdict::Pass);

    let wrong = TestDefinition::from_toml(&PARENT_CHILD.replace("PARENT", "C")).unwrap();
    let record = runner.run_one(&wrong, CancellationToken::new()).await;
    assert!(matches!(
        record.verdict,
        Verdict::Fail(FailureCause::Trace {
            failure: TraceFailure::RelationshipMismatch { .. }
        })
    ));
}

#[tokio::test]
async fn missing_spans_time_out_waiting() {
    let sink = Arc::new(MemoryTraceSink::new());
    let mut registry = PluginRegistry::new();
    registry.register("mock", Arc::new(MockPlugin::new()));
    let runner = TestRunner::from_parts(fast_config(false), registry, Some(sink), None).unwrap();

    let def = TestDefinition::from_toml(
        r#"
[metadata]
name = "silent"

[[steps]]
name = "quiet"
command = ["true"]

[[expect.span]]
name = "never"
"#,
    )
    .unwrap();

    let record = runner.run_one(&def, CancellationToken::new()).await;
    assert!(matches!(
        record.verdict,
        Verdict::Fail(FailureCause::Trace {
            failure: TraceFailure::PollTimeout { .. }
        })
    ));
}

#[tokio::test]
async fn unreachable_sink_is_an_error_not_a_failure() {
    let sink = Arc::new(MemoryTraceSink::new());
    sink.set_unreachable(true);
    let plugin = Arc::new(MockPlugin::new());
    let mut registry = PluginRegistry::new();
    registry.register("mock", plugin.clone());
    let runner = TestRunner::from_parts(fast_config(false), registry, Some(sink), None).unwrap();

    let def = TestDefinition::from_toml(DB_ROUNDTRIP).unwrap();
    let record = runner.run_one(&def, CancellationToken::new()).await;
    assert!(matches!(record.verdict, Verdict::Error(_)));
    assert_eq!(plugin.starts(), 0);
}

/// Runner over the built-in plugins and a shell script standing in for docker
///
/// `run_case` is the script's reaction to `docker run`; `port` publishes
/// container port N on host port 4N and `exec` always succeeds.
fn scripted_runtime_runner(dir: &std::path::Path, run_case: &str) -> TestRunner {
    use std::os::unix::fs::PermissionsExt;

    let binary = dir.join("docker");
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n  version) echo 24.0.7 ;;\n  run) {} ;;\n  port) echo \"127.0.0.1:4$3\" ;;\n  *) exit 0 ;;\nesac\n",
        run_case
    );
    std::fs::write(&binary, script).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let runtime = CliRuntime::new(&RuntimeConfig {
        binary: Some(binary.to_string_lossy().to_string()),
        ..Default::default()
    })
    .unwrap();
    let registry = PluginRegistry::with_builtins(Arc::new(runtime), "127.0.0.1");
    TestRunner::from_parts(fast_config(false), registry, None, None).unwrap()
}

#[tokio::test]
async fn rejected_image_fails_service_start() {
    let dir = tempfile::tempdir().unwrap();
    let runner = scripted_runtime_runner(
        dir.path(),
        "echo \"Unable to find image 'nope/missing:1' locally\" >&2; echo 'docker: Error response from daemon: pull access denied for nope/missing' >&2; exit 125",
    );

    let def = TestDefinition::from_toml(
        r#"
[metadata]
name = "missing-image"

[services.db]
plugin = "generic_container"
image = "nope/missing:1"

[[steps]]
name = "query"
command = ["true"]
"#,
    )
    .unwrap();

    let record = runner.run_one(&def, CancellationToken::new()).await;
    match &record.verdict {
        Verdict::Fail(FailureCause::ServiceStart { service, reason }) => {
            assert_eq!(service, "db");
            assert!(reason.contains("pull access denied"), "{}", reason);
        }
        other => panic!("expected a service start failure, got {:?}", other),
    }
    assert!(record.step_results.iter().all(|r| r.status == StepStatus::Skipped));
}

#[tokio::test]
async fn steps_see_the_collector_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let runner = scripted_runtime_runner(dir.path(), "echo 0123456789abcdef");
    let def = TestDefinition::from_toml(
        r#"
[metadata]
name = "exports-to-collector"

[services.otel]
plugin = "otel_collector"
health_check = { command = ["true"] }

[[steps]]
name = "show-exporter"
command = ["sh", "-c", 'echo "$OTEL_EXPORTER_OTLP_ENDPOINT $OTEL_EXPORTER_OTLP_PROTOCOL"']
expected_output_regex = 'http://127\.0\.0\.1:44318 http/protobuf'
"#,
    )
    .unwrap();

    let record = runner.run_one(&def, CancellationToken::new()).await;
    assert_eq!(record.verdict, Verdict::Pass, "{:?}", record.step_results);
    assert!(record.step_results[0].stdout.contains("http://127.0.0.1:44318"));
}

#[tokio::test]
async fn cancellation_skips_and_tears_down() {
    let plugin = Arc::new(MockPlugin::new());
    let runner = runner(plugin.clone());
    let def = TestDefinition::from_toml(
        r#"
[metadata]
name = "long"

[services.db]
plugin = "mock"
image = "db"

[[steps]]
name = "sleep"
service = "db"
command = ["sh", "-c", "sleep 10"]

[[steps]]
name = "after"
command = ["true"]
"#,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let record = runner.run_one(&def, cancel).await;
    assert_eq!(record.verdict, Verdict::Cancelled);
    assert!(record.step_results.iter().all(|r| r.status == StepStatus::Skipped));
    assert!(plugin.all_stopped());
}

#[tokio::test]
async fn panicking_run_does_not_take_down_the_pool() {
    let plugin = Arc::new(MockPlugin::new().panic_on_exec("boom"));
    let runner = runner(plugin.clone());
    let defs = vec![
        TestDefinition::from_toml(
            r#"
[metadata]
name = "explodes"

[services.boom]
plugin = "mock"
image = "x"

[[steps]]
name = "s"
service = "boom"
command = ["true"]
"#,
        )
        .unwrap(),
        TestDefinition::from_toml("[metadata]\nname = \"fine\"\n[[steps]]\nname = \"s\"\ncommand = [\"true\"]\n")
            .unwrap(),
    ];

    let suite = runner.run_all(defs, true, CancellationToken::new()).await;
    assert_eq!(suite.total, 2);
    assert_eq!(suite.passed, 1);
    assert_eq!(suite.errored, 1);
    assert!(plugin.all_stopped());
}

fn trivial(name: &str) -> TestDefinition {
    TestDefinition::from_toml(&format!(
        "[metadata]\nname = \"{}\"\n[[steps]]\nname = \"s\"\ncommand = [\"true\"]\n",
        name
    ))
    .unwrap()
}

#[tokio::test]
async fn start_panic_becomes_an_error_record_in_plan_order() {
    let plugin = Arc::new(MockPlugin::new().panic_on_start("boom"));
    let runner = runner(plugin.clone());
    let defs = vec![
        trivial("fine-a"),
        TestDefinition::from_toml(
            r#"
[metadata]
name = "explodes"

[services.boom]
plugin = "mock"
image = "x"

[[steps]]
name = "first"
service = "boom"
command = ["true"]

[[steps]]
name = "second"
command = ["true"]
"#,
        )
        .unwrap(),
        trivial("fine-b"),
    ];

    let mut plan = runner.scheduler().default_plan(&defs, "fixed order");
    plan.items.reverse();
    plan.workers = 1;

    let suite = runner.run_plan(&plan, defs, false, CancellationToken::new()).await;
    let names: Vec<&str> = suite.records.iter().map(|r| r.test_name.as_str()).collect();
    assert_eq!(names, ["fine-b", "explodes", "fine-a"]);

    match &suite.records[1].verdict {
        Verdict::Error(reason) => assert!(reason.contains("panicked"), "{}", reason),
        other => panic!("unexpected verdict {:?}", other),
    }
    assert_eq!(suite.records[1].step_results.len(), 2);
    assert!(suite.records[1].step_results.iter().all(|r| r.status == StepStatus::Skipped));
    assert_eq!(suite.records[0].verdict, Verdict::Pass);
    assert_eq!(suite.records[2].verdict, Verdict::Pass);
    assert_eq!(suite.errored, 1);
    assert_eq!(suite.passed, 2);
    assert!(plugin.all_stopped());
}

#[tokio::test]
async fn unreachable_plan_item_is_filled_with_an_error() {
    let runner = runner(Arc::new(MockPlugin::new()));
    let defs = vec![trivial("present")];
    let mut plan = runner.scheduler().default_plan(&defs, "fixed order");
    let mut dangling = plan.items[0].clone();
    dangling.test_name = "vanished".to_string();
    dangling.definition_index = 7;
    plan.items.push(dangling);

    let suite = runner.run_plan(&plan, defs, false, CancellationToken::new()).await;
    assert_eq!(suite.total, 2);
    assert_eq!(suite.records[0].verdict, Verdict::Pass);
    assert_eq!(suite.records[1].test_name, "vanished");
    assert_eq!(suite.records[1].verdict, Verdict::Error("run never completed".to_string()));
    assert!(suite.records[1].step_results.is_empty());
}

#[tokio::test]
async fn concurrent_acquisitions_never_share_an_instance() {
    let plugin = Arc::new(MockPlugin::new());
    let runner = Arc::new(runner_with(plugin.clone(), fast_config(true)));
    let def = Arc::new(
        TestDefinition::from_toml(
            "[metadata]\nname = \"shared\"\n[services.db]\nplugin = \"mock\"\nimage = \"db\"\n[[steps]]\nname = \"s\"\ncommand = [\"true\"]\n",
        )
        .unwrap(),
    );

    // One warm instance in the pool
    let lifecycle = runner.lifecycle().clone();
    let group = lifecycle.start_all(&def, &CancellationToken::new()).await.unwrap();
    lifecycle.stop_all(group).await;
    assert_eq!(lifecycle.reuse_stats().idle, 1);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let lifecycle = lifecycle.clone();
        let def = def.clone();
        handles.push(tokio::spawn(async move {
            lifecycle.start_all(&def, &CancellationToken::new()).await.unwrap()
        }));
    }
    let mut groups = Vec::new();
    for handle in handles {
        groups.push(handle.await.unwrap());
    }

    let mut ids: Vec<String> = groups
        .iter()
        .flat_map(|g| g.instances().map(|i| i.id.clone()))
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);
    assert_eq!(lifecycle.reuse_stats().reused, 1);
    assert_eq!(plugin.starts(), 6);

    for group in groups {
        lifecycle.stop_all(group).await;
    }
    lifecycle.shutdown().await;
    assert!(plugin.all_stopped());
}
