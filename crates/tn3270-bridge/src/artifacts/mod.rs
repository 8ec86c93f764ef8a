use crate::error::{BridgeError, BridgeResult};
use crate::model::screen::hex_digest;
use crate::model::{FlowDefinition, FlowOutcome, StepRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File holding one JSON [`StepRecord`] per line.
pub const RUN_LOG_FILE: &str = "run-log.jsonl";
pub const FLOW_FILE: &str = "flow.json";
pub const OUTCOME_FILE: &str = "outcome.json";
pub const CHECKSUMS_FILE: &str = "checksums.json";
/// Screen text as it stood when the most recent step failed.
pub const FAILURE_SCREEN_FILE: &str = "failure-screen.txt";

#[derive(Clone, Debug)]
pub struct RunArtifactsConfig {
    pub dir: PathBuf,
    pub overwrite: bool,
}

/// Writes a run's artifacts as it progresses, so a crashed run still leaves
/// its log behind.
pub struct RunArtifacts {
    dir: PathBuf,
    run_log: fs::File,
    checksums: BTreeMap<String, String>,
}

impl RunArtifacts {
    pub fn new(config: RunArtifactsConfig) -> BridgeResult<Self> {
        if config.dir.exists() {
            let occupied = fs::read_dir(&config.dir)
                .map_err(|err| BridgeError::io("failed to read artifacts dir", err))?
                .next()
                .is_some();
            if occupied && !config.overwrite {
                return Err(BridgeError::validation(
                    "artifacts directory exists and overwrite is disabled",
                    serde_json::json!({"dir": config.dir}),
                ));
            }
        } else {
            fs::create_dir_all(&config.dir)
                .map_err(|err| BridgeError::io("failed to create artifacts dir", err))?;
        }
        let run_log = fs::File::create(config.dir.join(RUN_LOG_FILE))
            .map_err(|err| BridgeError::io("failed to create run log", err))?;
        Ok(Self {
            dir: config.dir,
            run_log,
            checksums: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_flow(&mut self, flow: &FlowDefinition) -> BridgeResult<()> {
        self.write_json(FLOW_FILE, flow)
    }

    pub fn write_outcome(&mut self, outcome: &FlowOutcome) -> BridgeResult<()> {
        self.write_json(OUTCOME_FILE, outcome)
    }

    /// Replace the failure dump with `text`, headed by the failing step.
    pub fn write_failure_screen(&mut self, step: &str, error: &str, text: &str) -> BridgeResult<()> {
        let data = format!("# step: {step}\n# error: {error}\n{text}\n");
        fs::write(self.dir.join(FAILURE_SCREEN_FILE), data)
            .map_err(|err| BridgeError::io("failed to write failure screen", err))?;
        self.record_checksum(FAILURE_SCREEN_FILE)
    }

    /// Append one record and flush.
    pub fn append_record(&mut self, record: &StepRecord) -> BridgeResult<()> {
        let mut data = serde_json::to_vec(record)
            .map_err(|err| BridgeError::io("failed to serialize step record", err))?;
        data.push(b'\n');
        self.run_log
            .write_all(&data)
            .and_then(|()| self.run_log.flush())
            .map_err(|err| BridgeError::io("failed to write run log", err))?;
        self.record_checksum(RUN_LOG_FILE)
    }

    fn write_json<T: Serialize>(&mut self, name: &str, value: &T) -> BridgeResult<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|err| BridgeError::io("failed to serialize artifact", err))?;
        fs::write(self.dir.join(name), data)
            .map_err(|err| BridgeError::io("failed to write artifact", err))?;
        self.record_checksum(name)
    }

    fn record_checksum(&mut self, name: &str) -> BridgeResult<()> {
        let data = fs::read(self.dir.join(name))
            .map_err(|err| BridgeError::io("failed to read artifact", err))?;
        self.checksums.insert(name.to_string(), hex_digest(&data));
        let data = serde_json::to_vec_pretty(&self.checksums)
            .map_err(|err| BridgeError::io("failed to serialize checksums", err))?;
        fs::write(self.dir.join(CHECKSUMS_FILE), data)
            .map_err(|err| BridgeError::io("failed to write checksums", err))
    }
}

/// Check every file listed in `checksums.json` under `dir` still matches.
pub fn verify_checksums(dir: &Path) -> BridgeResult<()> {
    let data = fs::read_to_string(dir.join(CHECKSUMS_FILE))
        .map_err(|err| BridgeError::io("failed to read checksums", err))?;
    let expected: BTreeMap<String, String> = serde_json::from_str(&data)
        .map_err(|err| BridgeError::io("failed to parse checksums", err))?;
    for (name, checksum) in expected {
        let data = fs::read(dir.join(&name))
            .map_err(|err| BridgeError::io("failed to read artifact", err))?;
        let actual = hex_digest(&data);
        if actual != checksum {
            return Err(BridgeError::new(
                crate::error::ErrorCode::ReplayMismatch,
                format!("checksum mismatch for {name}"),
                serde_json::json!({"file": name, "expected": checksum, "actual": actual}),
            ));
        }
    }
    Ok(())
}
