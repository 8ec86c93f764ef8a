// Test module - relaxed lint rules
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

pub const LOGON_FLOW: &str = r#"
name: tso-logon
steps:
  - type: connect
    host: "127.0.0.1:3270"
  - type: wait
    condition: ready
  - type: fill
    name: userid
    target: { label: "Logon ===>", offset: 1 }
    value: "${user}"
  - type: press
    key: Enter
  - type: fill
    name: password
    target: { label: "Password ===>", offset: 1 }
    value: "${secret}"
  - type: press
    key: Enter
  - type: assert
    predicate: text_present
    text: READY HERC02
"#;

pub const SECRET: &str = "CUL8TR";

pub fn bridge_bin() -> &'static str {
    env!("CARGO_BIN_EXE_tn3270-bridge")
}

/// Fixture binaries land next to the CLI binary.
pub fn fixture_path(name: &str) -> String {
    let bridge_dir = Path::new(bridge_bin()).parent().unwrap();
    let fixture = bridge_dir.join(name);
    if fixture.exists() {
        fixture.display().to_string()
    } else {
        panic!(
            "Fixture binary not found: {}. Run 'cargo build --workspace' first.",
            fixture.display()
        );
    }
}

/// Config pointing the emulator at the fake s3270 with a short retry backoff.
pub fn write_config(dir: &Path, goldens_dir: Option<&Path>) -> PathBuf {
    let mut config = format!(
        "emulator:\n  program: \"{}\"\nretry:\n  base_delay_ms: 10\n",
        fixture_path("tn3270-fake-s3270")
    );
    if let Some(goldens) = goldens_dir {
        config.push_str(&format!("goldens_dir: \"{}\"\n", goldens.display()));
    }
    let path = dir.join("bridge.yaml");
    fs::write(&path, config).unwrap();
    path
}

pub fn write_flow(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, yaml).unwrap();
    path
}

/// CLI command with the credential variables set and host overrides cleared.
pub fn bridge() -> Command {
    let mut cmd = Command::new(bridge_bin());
    cmd.env("TSO_USERNAME", "HERC02")
        .env("TSO_PASSWORD", SECRET)
        .env_remove("MAINFRAME_HOST")
        .env_remove("MAINFRAME_PORT")
        .env_remove("RUST_LOG");
    cmd
}

pub fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|err| {
        panic!(
            "stdout is not json ({err}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}
