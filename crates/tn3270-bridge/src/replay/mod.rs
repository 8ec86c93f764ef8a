use crate::artifacts::{verify_checksums, RUN_LOG_FILE};
use crate::error::{BridgeError, BridgeResult, ErrorCode};
use crate::model::StepRecord;
use serde::Serialize;
use std::fs;
use std::path::Path;

pub const REPLAY_VERSION: u32 = 1;

#[derive(Clone, Debug, Default)]
pub struct ReplayOptions {
    /// Also compare screen digests and layout signatures.
    pub strict: bool,
    /// Fail when either directory has no `checksums.json`.
    pub require_checksums: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ReplayMismatch {
    pub kind: String,
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl ReplayMismatch {
    fn field(kind: &str, index: usize, expected: impl ToString, actual: impl ToString) -> Self {
        Self {
            kind: kind.to_string(),
            index: Some(index),
            expected: Some(expected.to_string()),
            actual: Some(actual.to_string()),
        }
    }

    pub fn to_error(&self) -> BridgeError {
        BridgeError::new(
            ErrorCode::ReplayMismatch,
            format!("run logs diverge ({})", self.kind),
            serde_json::to_value(self).ok(),
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplaySummary {
    pub replay_version: u32,
    pub status: String,
    pub strict: bool,
    pub steps: usize,
    pub mismatch: Option<ReplayMismatch>,
}

/// Read a run log; `path` may be the jsonl file or the artifacts directory holding it.
pub fn load_run_log(path: &Path) -> BridgeResult<Vec<StepRecord>> {
    let file = if path.is_dir() {
        path.join(RUN_LOG_FILE)
    } else {
        path.to_path_buf()
    };
    let data =
        fs::read_to_string(&file).map_err(|err| BridgeError::io("failed to read run log", err))?;
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_no, line)| {
            serde_json::from_str(line).map_err(|err| {
                BridgeError::validation(
                    "failed to parse run log line",
                    serde_json::json!({"line": line_no + 1, "source": err.to_string()}),
                )
            })
        })
        .collect()
}

/// Compare two logs step by step. Timings never count; digests only when strict.
pub fn compare_run_logs(
    expected: &[StepRecord],
    actual: &[StepRecord],
    options: &ReplayOptions,
) -> Result<(), ReplayMismatch> {
    for (index, (want, got)) in expected.iter().zip(actual).enumerate() {
        compare_record(index, want, got, options.strict)?;
    }
    if expected.len() != actual.len() {
        return Err(ReplayMismatch::field(
            "length",
            expected.len().min(actual.len()),
            expected.len(),
            actual.len(),
        ));
    }
    Ok(())
}

fn compare_record(
    index: usize,
    want: &StepRecord,
    got: &StepRecord,
    strict: bool,
) -> Result<(), ReplayMismatch> {
    if want.phase != got.phase {
        return Err(ReplayMismatch::field(
            "phase",
            index,
            format!("{:?}", want.phase),
            format!("{:?}", got.phase),
        ));
    }
    if want.step != got.step {
        return Err(ReplayMismatch::field("step", index, &want.step, &got.step));
    }
    if want.action != got.action {
        return Err(ReplayMismatch::field("action", index, &want.action, &got.action));
    }
    if want.redacted != got.redacted {
        return Err(ReplayMismatch::field("redacted", index, want.redacted, got.redacted));
    }
    if want.status != got.status {
        return Err(ReplayMismatch::field(
            "status",
            index,
            format!("{:?}", want.status),
            format!("{:?}", got.status),
        ));
    }
    if strict {
        if want.screen_digest != got.screen_digest {
            return Err(ReplayMismatch::field(
                "screen_digest",
                index,
                want.screen_digest.as_deref().unwrap_or("-"),
                got.screen_digest.as_deref().unwrap_or("-"),
            ));
        }
        if want.layout_signature != got.layout_signature {
            return Err(ReplayMismatch::field(
                "layout_signature",
                index,
                want.layout_signature.as_deref().unwrap_or("-"),
                got.layout_signature.as_deref().unwrap_or("-"),
            ));
        }
    }
    Ok(())
}

/// Check two artifact directories and compare their run logs.
///
/// Returns the summary on success; a divergence comes back as `E_REPLAY_MISMATCH`
/// whose context is the mismatch.
pub fn replay_dirs(
    expected_dir: &Path,
    actual_dir: &Path,
    options: &ReplayOptions,
) -> BridgeResult<ReplaySummary> {
    for dir in [expected_dir, actual_dir] {
        if options.require_checksums || dir.join(crate::artifacts::CHECKSUMS_FILE).exists() {
            verify_checksums(dir)?;
        }
    }
    let expected = load_run_log(expected_dir)?;
    let actual = load_run_log(actual_dir)?;
    match compare_run_logs(&expected, &actual, options) {
        Ok(()) => {
            tracing::info!(steps = expected.len(), strict = options.strict, "run logs match");
            Ok(ReplaySummary {
                replay_version: REPLAY_VERSION,
                status: "passed".to_string(),
                strict: options.strict,
                steps: expected.len(),
                mismatch: None,
            })
        }
        Err(mismatch) => {
            tracing::warn!(kind = %mismatch.kind, index = ?mismatch.index, "run logs diverge");
            Err(mismatch.to_error())
        }
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::model::{StepPhase, StepStatus};

    fn record(index: usize, action: &str, status: StepStatus) -> StepRecord {
        StepRecord {
            index,
            phase: StepPhase::Main,
            step: format!("step-{index}"),
            action: action.to_string(),
            status,
            duration_ms: 10,
            screen_digest: Some("aa".to_string()),
            layout_signature: Some("bb".to_string()),
            redacted: false,
            error: None,
        }
    }

    #[test]
    fn timings_and_digests_are_ignored_unless_strict() {
        let expected = vec![record(0, "press Enter", StepStatus::Passed)];
        let mut actual = expected.clone();
        actual[0].duration_ms = 999;
        actual[0].screen_digest = Some("cc".to_string());

        assert!(compare_run_logs(&expected, &actual, &ReplayOptions::default()).is_ok());
        let strict = ReplayOptions {
            strict: true,
            ..ReplayOptions::default()
        };
        let mismatch = compare_run_logs(&expected, &actual, &strict).err();
        assert_eq!(mismatch.map(|m| m.kind), Some("screen_digest".to_string()));
    }

    #[test]
    fn reports_first_divergence() {
        let expected = vec![
            record(0, "connect 127.0.0.1:3270", StepStatus::Passed),
            record(1, "press Enter", StepStatus::Passed),
        ];
        let mut actual = expected.clone();
        actual[1].action = "press PF3".to_string();
        let mismatch = compare_run_logs(&expected, &actual, &ReplayOptions::default()).err();
        assert_eq!(
            mismatch,
            Some(ReplayMismatch {
                kind: "action".to_string(),
                index: Some(1),
                expected: Some("press Enter".to_string()),
                actual: Some("press PF3".to_string()),
            })
        );

        let short = &expected[..1];
        let mismatch = compare_run_logs(&expected, short, &ReplayOptions::default()).err();
        assert_eq!(mismatch.map(|m| (m.kind, m.index)), Some(("length".to_string(), Some(1))));
    }

    #[test]
    fn mismatch_converts_to_replay_error() {
        let err = ReplayMismatch::field("status", 2, "Passed", "Failed").to_error();
        assert_eq!(err.code, ErrorCode::ReplayMismatch);
        assert!(err.context.is_some());
    }
}
