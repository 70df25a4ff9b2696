/// Integration tests for the phasegate CLI
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a scratch project root
fn create_project() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

fn phasegate(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("phasegate").expect("binary should build");
    cmd.arg("--project-root")
        .arg(root)
        .env("HOME", root)
        .env_remove("PHASEGATE_ROOT")
        .env_remove("RUST_LOG");
    cmd
}

#[cfg(unix)]
fn write_gate(root: &Path, phase: u32, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let path = root.join(format!("scripts/gates/phase{}_gate.sh", phase));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn state_json(root: &Path) -> serde_json::Value {
    let text = std::fs::read_to_string(root.join(".phasegate/orchestration-state.json"))
        .expect("state file should exist");
    serde_json::from_str(&text).expect("state file should be valid JSON")
}

#[test]
fn test_can_proceed_fresh_project() {
    let project = create_project();

    phasegate(project.path())
        .args(["can-proceed", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("may proceed"));

    phasegate(project.path())
        .args(["can-proceed", "3"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("has not been run"));
}

#[test]
fn test_blocked_run_records_nothing() {
    let project = create_project();

    phasegate(project.path())
        .args(["run-phase", "5"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("blocked"));

    assert!(!project
        .path()
        .join(".phasegate/orchestration-state.json")
        .exists());
}

#[test]
fn test_unknown_phase_is_fatal() {
    let project = create_project();

    phasegate(project.path())
        .args(["run-phase", "9"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown phase 9"));
}

#[test]
fn test_pass_through_phase_persists_state() {
    let project = create_project();

    phasegate(project.path())
        .args(["run-phase", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PASSED"));

    let state = state_json(project.path());
    assert_eq!(state["current_phase"], 2);
    assert_eq!(state["gate_history"].as_array().unwrap().len(), 1);
    assert_eq!(state["phase_gates"]["1"]["passed"], true);
    assert_eq!(state["orchestration_version"], "1.0");
}

#[cfg(unix)]
#[test]
fn test_full_workflow_verifies() {
    let project = create_project();
    for phase in 3..=6 {
        write_gate(project.path(), phase, &format!("echo phase {} ok", phase));
    }

    phasegate(project.path())
        .arg("verify-gates")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("NOT_RUN"));

    for phase in 1..=6 {
        phasegate(project.path())
            .args(["run-phase", &phase.to_string()])
            .assert()
            .success();
    }

    phasegate(project.path())
        .arg("verify-gates")
        .assert()
        .success()
        .stdout(predicate::str::contains("All blocking phases PASSED"));

    let state = state_json(project.path());
    assert_eq!(state["current_phase"], 7);
    let output_file = state["phase_gates"]["5"]["full_output_file"]
        .as_str()
        .expect("executed gates persist their output");
    assert!(project.path().join(output_file).exists());

    phasegate(project.path())
        .args(["show-output", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("phase 5 ok"));
}

#[cfg(unix)]
#[test]
fn test_failed_gate_blocks_next_phase() {
    let project = create_project();
    write_gate(project.path(), 3, "echo 'contract mismatch' 1>&2\nexit 4");

    for phase in 1..=2 {
        phasegate(project.path())
            .args(["run-phase", &phase.to_string()])
            .assert()
            .success();
    }

    phasegate(project.path())
        .args(["run-phase", "3"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("contract mismatch"));

    phasegate(project.path())
        .args(["can-proceed", "4"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("failed"));

    phasegate(project.path())
        .args(["history", "--phase", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("exit 4"));
}

#[cfg(unix)]
#[test]
fn test_timeout_from_config() {
    let project = create_project();
    let config_dir = project.path().join(".phasegate");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        r#"
gate_timeout = "500ms"

[[phases]]
number = 1
name = "Slow"
gate = "scripts/gates/phase1_gate.sh"
blocking = true
"#,
    )
    .unwrap();
    write_gate(project.path(), 1, "sleep 30");

    phasegate(project.path())
        .args(["run-phase", "1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("timed out"));

    let state = state_json(project.path());
    assert_eq!(state["current_phase"], 1);
    assert_eq!(state["phase_gates"]["1"]["exit_code"], -1);
}

#[test]
fn test_status_survives_corrupt_state() {
    let project = create_project();
    let state_dir = project.path().join(".phasegate");
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::write(state_dir.join("orchestration-state.json"), "{ truncated").unwrap();

    phasegate(project.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Current phase: 1"))
        .stderr(predicate::str::contains("corrupt"));
}

#[test]
fn test_status_json() {
    let project = create_project();
    phasegate(project.path())
        .args(["run-phase", "1"])
        .assert()
        .success();

    let output = phasegate(project.path())
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["current_phase"], 2);
}

#[test]
fn test_reset_requires_confirmation() {
    let project = create_project();
    phasegate(project.path())
        .args(["run-phase", "1"])
        .assert()
        .success();

    phasegate(project.path())
        .arg("reset")
        .write_stdin("n\n")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Reset cancelled"));
    assert_eq!(state_json(project.path())["current_phase"], 2);

    phasegate(project.path())
        .args(["reset", "--yes"])
        .assert()
        .success();
    let state = state_json(project.path());
    assert_eq!(state["current_phase"], 1);
    assert!(state["gate_history"].as_array().unwrap().is_empty());
    assert!(project.path().join(".phasegate/archive").exists());
}

#[test]
fn test_init_writes_config() {
    let project = create_project();

    phasegate(project.path()).arg("init").assert().success();
    let config = project.path().join(".phasegate/config.toml");
    assert!(config.exists());

    let content = std::fs::read_to_string(&config).unwrap();
    assert!(content.contains("gate_timeout"));
    assert!(content.contains("Integration Testing"));
}
