//! Integration tests for the procpool CLI.
//!
//! These tests run the binary end-to-end; its workers are further copies of the
//! same binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::time::{Duration, Instant};

/// Get a command for the procpool binary with a clean pool environment.
fn procpool() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("procpool").unwrap();
    cmd.env_remove("PROCPOOL_WORKERS")
        .env_remove("PROCPOOL_WORKER")
        .env_remove("PROCPOOL_POLL_INTERVAL_MS")
        .env_remove("PROCPOOL_LOG")
        .env_remove("PROCPOOL_LOG_LEVEL")
        .env_remove("RUST_LOG")
        .env_remove("PROCPOOL_LOG_FILE");
    cmd
}

/// Run with `--json` and parse the report.
fn run_json(args: &[&str]) -> serde_json::Value {
    let output = procpool()
        .arg("run")
        .args(args)
        .arg("--json")
        .assert()
        .success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    serde_json::from_str(&stdout).expect("Output should be valid JSON")
}

fn frequencies(report: &serde_json::Value) -> Vec<u64> {
    report["workers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["frequency"].as_u64().unwrap())
        .collect()
}

// ============================================================================
// Help and Version Tests
// ============================================================================

#[test]
fn test_help_displays() {
    procpool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker subprocesses"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_run_help() {
    procpool()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--timeout"))
        .stdout(predicate::str::contains("PROCPOOL_WORKERS"));
}

#[test]
fn test_version_displays() {
    procpool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("procpool"))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ============================================================================
// Run Tests
// ============================================================================

#[test]
fn test_run_spreads_tasks_evenly() {
    procpool()
        .args(["run", "--workers", "2", "--tasks", "4", "--sleep-ms", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "2 workers, 4 units dispatched, 0 failed",
        ));
}

#[test]
fn test_run_json_output() {
    let report = run_json(&["--workers", "3", "--tasks", "6", "--sleep-ms", "5"]);
    assert_eq!(report["stats"]["worker_count"], 3);
    assert_eq!(report["stats"]["total_dispatched"], 6);
    assert_eq!(report["stats"]["alive"], 0);
    assert_eq!(frequencies(&report), vec![2, 2, 2]);
}

#[test]
fn test_run_workers_from_env() {
    let output = procpool()
        .env("PROCPOOL_WORKERS", "2")
        .args(["run", "--tasks", "2", "--sleep-ms", "5", "--json"])
        .assert()
        .success();
    let report: serde_json::Value =
        serde_json::from_slice(&output.get_output().stdout).unwrap();
    assert_eq!(report["stats"]["worker_count"], 2);
}

#[test]
fn test_run_reports_failures() {
    let report = run_json(&[
        "--workers",
        "2",
        "--tasks",
        "2",
        "--sleep-ms",
        "10",
        "--fail",
        "1",
    ]);
    assert_eq!(report["stats"]["failed"], 1);
    assert_eq!(report["stats"]["total_dispatched"], 3);

    let failed: Vec<&serde_json::Value> = report["workers"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|w| w["failed"] == true)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(
        failed[0]["failure"]
            .as_str()
            .is_some_and(|f| f.contains("requested failure #1"))
    );
}

#[test]
fn test_run_failure_human_output() {
    procpool()
        .args(["run", "--workers", "1", "--tasks", "0", "--fail", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 failed"))
        .stdout(predicate::str::contains("requested failure #1"));
}

#[test]
fn test_run_broadcast() {
    let report = run_json(&["--workers", "3", "--tasks", "0", "--broadcast"]);
    assert_eq!(frequencies(&report), vec![1, 1, 1]);
}

#[test]
fn test_run_expand() {
    let report = run_json(&["--workers", "1", "--expand", "2", "--tasks", "3"]);
    assert_eq!(report["stats"]["worker_count"], 3);
    assert_eq!(frequencies(&report), vec![1, 1, 1]);
}

#[test]
fn test_run_shrink() {
    let report = run_json(&["--workers", "3", "--shrink", "1", "--tasks", "4"]);
    assert_eq!(report["stats"]["worker_count"], 2);
    assert_eq!(frequencies(&report), vec![2, 2]);
}

#[test]
fn test_run_shrink_too_far_fails() {
    procpool()
        .args(["run", "--workers", "1", "--shrink", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"))
        .stderr(predicate::str::contains("Cannot shrink pool by 2"));
}

#[test]
fn test_run_without_workers_fails() {
    procpool()
        .args(["run", "--workers", "0", "--tasks", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no alive workers"));
}

#[test]
fn test_run_timeout_kills_slow_workers() {
    let start = Instant::now();
    procpool()
        .args([
            "run",
            "--workers",
            "1",
            "--tasks",
            "3",
            "--sleep-ms",
            "3000",
            "--timeout",
            "100",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 units dispatched"));
    // Running all three tasks would take nine seconds.
    assert!(start.elapsed() < Duration::from_secs(6));
}

// ============================================================================
// Global Flag Tests
// ============================================================================

#[test]
fn test_no_color_option() {
    procpool()
        .args(["--no-color", "run", "--workers", "1", "--tasks", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\x1b[").not());
}

#[test]
fn test_verbose_conflicts_with_quiet() {
    procpool()
        .args(["-v", "-q", "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_quiet_mode_silences_logs() {
    procpool()
        .args(["--quiet", "run", "--workers", "1", "--tasks", "1"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_verbose_shows_debug_logs() {
    procpool()
        .args([
            "-v",
            "--log-format",
            "compact",
            "run",
            "--workers",
            "1",
            "--tasks",
            "1",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("DEBUG"))
        .stderr(predicate::str::contains("Spawned worker"));
}

#[test]
fn test_json_log_format() {
    procpool()
        .args(["--log-format", "json", "run", "--workers", "1", "--tasks", "1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("\"Initializing worker pool\""));
}

#[test]
fn test_invalid_log_format_rejected() {
    procpool()
        .args(["--log-format", "xml", "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown log format"));
}
