// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! `run` and `replay` against the fake s3270 subprocess.

mod common;

use common::{bridge, stdout_json, write_config, write_flow, LOGON_FLOW, SECRET};
use std::fs;
use tempfile::tempdir;

const WRONG_PANEL_FLOW: &str = r#"
name: wrong-panel
steps:
  - type: connect
  - type: assert
    predicate: text_present
    text: READY HERC02
"#;

// =============================================================================
// run
// =============================================================================

#[test]
fn run_logon_flow_succeeds_without_leaking_secret() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), None);
    let flow = write_flow(dir.path(), "logon.yaml", LOGON_FLOW);
    let artifacts = dir.path().join("run");

    let output = bridge()
        .args(["run", "--json", "--flow"])
        .arg(&flow)
        .arg("--config")
        .arg(&config)
        .arg("--artifacts")
        .arg(&artifacts)
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let outcome = stdout_json(&output);
    assert_eq!(outcome["status"], "succeeded");
    assert_eq!(outcome["flow"], "tso-logon");
    assert_eq!(outcome["log"]["records"].as_array().unwrap().len(), 7);

    assert!(!String::from_utf8_lossy(&output.stdout).contains(SECRET));
    assert!(!String::from_utf8_lossy(&output.stderr).contains(SECRET));
    let run_log = fs::read_to_string(artifacts.join("run-log.jsonl")).unwrap();
    assert_eq!(run_log.lines().count(), 7);
    assert!(!run_log.contains(SECRET));
    assert!(artifacts.join("checksums.json").exists());
}

#[test]
fn failed_assertion_exits_with_assertion_code() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), None);
    let flow = write_flow(dir.path(), "wrong.yaml", WRONG_PANEL_FLOW);

    let output = bridge()
        .args(["run", "--json", "--flow"])
        .arg(&flow)
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(11));
    let outcome = stdout_json(&output);
    assert_eq!(outcome["status"], "failed");
    assert_eq!(outcome["error"]["code"], "E_ASSERTION");
}

#[test]
fn invalid_flow_file_is_a_validation_error() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), None);
    let flow = write_flow(dir.path(), "broken.yaml", "name: broken\nsteps: nope\n");

    let output = bridge()
        .args(["run", "--flow"])
        .arg(&flow)
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("E_VALIDATION"));
}

#[test]
fn progress_goes_to_stderr() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), None);
    let flow = write_flow(dir.path(), "logon.yaml", LOGON_FLOW);

    let output = bridge()
        .args(["run", "--json", "--progress", "--flow"])
        .arg(&flow)
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("run started: tso-logon"), "stderr: {stderr}");
    assert!(stderr.contains("succeeded"));
    stdout_json(&output);
}

#[test]
fn tui_rejects_json_output() {
    let dir = tempdir().unwrap();
    let flow = write_flow(dir.path(), "logon.yaml", LOGON_FLOW);

    let output = bridge()
        .args(["run", "--tui", "--json", "--flow"])
        .arg(&flow)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stdout_json(&output)["code"], "E_VALIDATION");
}

#[test]
fn occupied_artifacts_dir_needs_overwrite() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), None);
    let flow = write_flow(dir.path(), "logon.yaml", LOGON_FLOW);
    let artifacts = dir.path().join("run");
    fs::create_dir_all(&artifacts).unwrap();
    fs::write(artifacts.join("stale.txt"), "x").unwrap();

    let run = |overwrite: bool| {
        let mut cmd = bridge();
        cmd.args(["run", "--json", "--flow"])
            .arg(&flow)
            .arg("--config")
            .arg(&config)
            .arg("--artifacts")
            .arg(&artifacts);
        if overwrite {
            cmd.arg("--overwrite");
        }
        cmd.output().unwrap()
    };

    assert_eq!(run(false).status.code(), Some(2));
    assert!(run(true).status.success());
}

// =============================================================================
// replay
// =============================================================================

#[test]
fn replay_of_identical_runs_passes() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), None);
    let flow = write_flow(dir.path(), "logon.yaml", LOGON_FLOW);

    for name in ["first", "second"] {
        let output = bridge()
            .args(["run", "--flow"])
            .arg(&flow)
            .arg("--config")
            .arg(&config)
            .arg("--artifacts")
            .arg(dir.path().join(name))
            .output()
            .unwrap();
        assert!(output.status.success());
    }

    let output = bridge()
        .args(["replay", "--json", "--strict", "--require-checksums", "--expected"])
        .arg(dir.path().join("first"))
        .arg("--actual")
        .arg(dir.path().join("second"))
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let summary = stdout_json(&output);
    assert_eq!(summary["status"], "passed");
    assert_eq!(summary["steps"], 7);
}

#[test]
fn replay_of_diverging_runs_exits_with_mismatch_code() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), None);
    let logon = write_flow(dir.path(), "logon.yaml", LOGON_FLOW);
    let wrong = write_flow(dir.path(), "wrong.yaml", WRONG_PANEL_FLOW);

    for (flow, name) in [(&logon, "good"), (&wrong, "bad")] {
        bridge()
            .args(["run", "--flow"])
            .arg(flow)
            .arg("--config")
            .arg(&config)
            .arg("--artifacts")
            .arg(dir.path().join(name))
            .output()
            .unwrap();
    }

    let output = bridge()
        .args(["replay", "--json", "--expected"])
        .arg(dir.path().join("good"))
        .arg("--actual")
        .arg(dir.path().join("bad"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(8));
    assert_eq!(stdout_json(&output)["code"], "E_REPLAY_MISMATCH");
}

#[test]
fn replay_of_missing_directory_is_an_io_error() {
    let dir = tempdir().unwrap();
    let output = bridge()
        .args(["replay", "--json", "--expected"])
        .arg(dir.path().join("absent-a"))
        .arg("--actual")
        .arg(dir.path().join("absent-b"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let code = stdout_json(&output)["code"].as_str().unwrap().to_string();
    assert!(code == "E_IO" || code == "E_VALIDATION", "code: {code}");
}
