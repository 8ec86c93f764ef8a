//! Tracing subscriber setup for the CLI.
//!
//! Verbosity comes from repeated `-v`, `RUST_LOG` overrides it, and output goes
//! to stderr or a log file as text or JSON lines. Stdout stays reserved for
//! command results.

use clap::ValueEnum;
use miette::{IntoDiagnostic, Result};
use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Filter level for a `-v` count (0=error, 1=warn, 2=info, 3=debug, 4+=trace).
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = level_for(verbosity);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tn3270_bridge={level},tn3270_bridge_cli={level}")));
    let detailed = verbosity >= 3;

    match (log_file, format) {
        (None, LogFormat::Text) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init()
            .into_diagnostic(),
        (None, LogFormat::Json) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .into_diagnostic(),
        (Some(path), LogFormat::Text) => {
            let file = open_log(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true)
                        .with_file(detailed)
                        .with_line_number(detailed),
                )
                .try_init()
                .into_diagnostic()
        }
        (Some(path), LogFormat::Json) => {
            let file = open_log(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(file))
                .try_init()
                .into_diagnostic()
        }
    }
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .into_diagnostic()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(level_for(0), "error");
        assert_eq!(level_for(2), "info");
        assert_eq!(level_for(3), "debug");
        assert_eq!(level_for(9), "trace");
    }

    #[test]
    fn text_is_the_default_format() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}
