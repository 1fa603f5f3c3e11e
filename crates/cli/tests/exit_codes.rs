//! Exit codes of the `clnrm` binary for host-only definitions

use std::path::Path;
use std::process::{Command, Output};

const PASSING: &str = r#"
[metadata]
name = "host-echo"

[[steps]]
name = "greet"
command = ["sh", "-c", "echo hello"]
expected_output_regex = "hello"
"#;

const FAILING: &str = r#"
[metadata]
name = "host-exit"

[[steps]]
name = "boom"
command = ["sh", "-c", "exit 4"]
"#;

const CYCLIC: &str = r#"
[metadata]
name = "cyclic"

[services.a]
image = "alpine:3"
depends_on = ["b"]

[services.b]
image = "alpine:3"
depends_on = ["a"]

[[steps]]
name = "never"
command = ["true"]
"#;

fn clnrm(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_clnrm"))
        .args(args)
        .current_dir(dir)
        .env("CLNRM_CONFIG", dir.join("clnrm.toml"))
        .env("CLNRM_HISTORY_DB", dir.join("history.db"))
        .env_remove("CLNRM_TRACE_ENDPOINT")
        .env_remove("CLNRM_TRACE_FILE")
        .env_remove("CLNRM_ORACLE_ENDPOINT")
        .env("NO_COLOR", "1")
        .output()
        .unwrap()
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::create_dir_all(dir.join("tests")).unwrap();
    std::fs::write(dir.join("tests").join(name), content).unwrap();
}

#[test]
fn passing_run_exits_zero_and_writes_results() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "echo.toml", PASSING);

    let out = clnrm(dir.path(), &["run", "tests", "--output", "results"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(dir.path().join("results/test-results.json").exists());
}

#[test]
fn failed_verdict_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "echo.toml", PASSING);
    write(dir.path(), "exit.toml", FAILING);

    let out = clnrm(dir.path(), &["--format", "json", "run", "tests"]);
    assert_eq!(out.status.code(), Some(1));

    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["passed"], 1);
    assert_eq!(report["failed"], 1);
}

#[test]
fn invalid_definition_exits_two_without_running() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "echo.toml", PASSING);
    write(dir.path(), "cyclic.toml", CYCLIC);

    let out = clnrm(dir.path(), &["run", "tests"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(!dir.path().join("history.db").exists() || history_is_empty(dir.path()));

    let out = clnrm(dir.path(), &["validate", "tests"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn validate_accepts_good_definitions() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "echo.toml", PASSING);

    let out = clnrm(dir.path(), &["--format", "csv", "validate", "tests"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("File,Test,Valid,Detail"));
    assert!(stdout.contains("host-echo"));
}

#[test]
fn missing_path_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let out = clnrm(dir.path(), &["validate", "does-not-exist"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn predict_with_history_reports_json() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "exit.toml", FAILING);
    for _ in 0..3 {
        assert_eq!(clnrm(dir.path(), &["run", "tests"]).status.code(), Some(1));
    }

    let out = clnrm(dir.path(), &["--format", "json", "ai-predict"]);
    assert_eq!(out.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["analysis"]["total_runs"], 3);
    assert_eq!(report["predictions"][0]["test"], "host-exit");
    assert!(report["predictions"][0]["probability"].as_f64().unwrap() > 0.5);
}

fn history_is_empty(dir: &Path) -> bool {
    clnrm_common::Database::open(dir.join("history.db"))
        .and_then(|db| db.count())
        .map(|n| n == 0)
        .unwrap_or(true)
}
