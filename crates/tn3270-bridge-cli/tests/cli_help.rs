// Test module - relaxed lint rules
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

//! Help text and shell completions.

use std::process::Command;

fn bridge(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_tn3270-bridge"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn help_lists_every_command() {
    let output = bridge(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["serve", "run", "replay", "goldens", "completions"] {
        assert!(stdout.contains(command), "missing {command} in:\n{stdout}");
    }
}

#[test]
fn run_help_documents_artifacts_and_tui() {
    let output = bridge(&["run", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--artifacts"));
    assert!(stdout.contains("--overwrite"));
    assert!(stdout.contains("--tui"));
}

#[test]
fn completions_are_generated_for_bash() {
    let output = bridge(&["completions", "bash"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("tn3270-bridge"));
    assert!(stdout.contains("replay"));
}

#[test]
fn unknown_command_is_a_usage_error() {
    let output = bridge(&["frobnicate"]);
    assert_eq!(output.status.code(), Some(2));
}
