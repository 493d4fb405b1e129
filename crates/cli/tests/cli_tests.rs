//! CLI integration tests

use std::process::{Command, Output};

fn sentinelctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sentinelctl"))
        .args(args)
        .env_remove("SENTINEL_API_URL")
        .output()
        .expect("Failed to execute sentinelctl")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = sentinelctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("API Sentinel"), "Should show app name");
    assert!(stdout.contains("alerts"), "Should show alerts command");
    assert!(stdout.contains("summary"), "Should show summary command");
    assert!(stdout.contains("config"), "Should show config command");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = sentinelctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("sentinelctl"), "Should show binary name");
}

#[test]
fn test_alerts_list_help() {
    let output = sentinelctl(&["alerts", "list", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Alerts list help should succeed");
    assert!(stdout.contains("--api"), "Should show api option");
    assert!(stdout.contains("--env"), "Should show env option");
}

#[test]
fn test_alerts_snooze_help() {
    let output = sentinelctl(&["alerts", "snooze", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Snooze help should succeed");
    assert!(stdout.contains("--minutes"), "Should show minutes option");
    assert!(stdout.contains("--actor"), "Should show actor option");
}

#[test]
fn test_ack_requires_alert_id() {
    let output = sentinelctl(&["alerts", "ack"]);
    assert!(!output.status.success(), "Ack without an id should fail");
}

#[test]
fn test_invalid_format_is_rejected() {
    let output = sentinelctl(&["--format", "yaml", "summary"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Unknown format should fail");
    assert!(stderr.contains("yaml"), "Should name the rejected value");
}

#[test]
fn test_unreachable_daemon_fails() {
    let output = sentinelctl(&["--api-url", "http://127.0.0.1:1", "alerts", "list"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Unreachable daemon should fail");
    assert!(stderr.contains("Failed to send request"), "Should report the request failure");
}
