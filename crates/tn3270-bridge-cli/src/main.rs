//! tn3270-bridge CLI: drive TN3270 hosts through s3270.
//!
//! Serves the HTTP control surface, runs declarative flows, compares run logs
//! and manages the golden screen store.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes
#![allow(clippy::fn_params_excessive_bools)] // CLI flags are naturally bools

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use miette::{IntoDiagnostic, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tn3270_bridge::artifacts::RunArtifactsConfig;
use tn3270_bridge::config::{load_config_file, BridgeConfig};
use tn3270_bridge::executor::ActionExecutor;
use tn3270_bridge::flow::load_flow_file;
use tn3270_bridge::golden::GoldenRegistry;
use tn3270_bridge::replay::{replay_dirs, ReplayOptions};
use tn3270_bridge::runner::{CancelToken, FlowRunner, ProgressCallback, RunOptions};
use tn3270_bridge::server::{serve, AppState};
use tn3270_bridge::session::SessionManager;
use tn3270_bridge::{
    BridgeError, BridgeResult, Credentials, ErrorCode, FlowDefinition, FlowOutcome, RunStatus,
};

mod logging;
mod progress;
mod tui_mode;

use logging::LogFormat;

/// Environment variables read for flow credentials. Values never appear in
/// output or artifacts.
const USER_ENV: &str = "TSO_USERNAME";
const SECRET_ENV: &str = "TSO_PASSWORD";
/// Optional override of the configured default host.
const HOST_ENV: &str = "MAINFRAME_HOST";
const PORT_ENV: &str = "MAINFRAME_PORT";

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Debug, Parser)]
#[command(
    name = "tn3270-bridge",
    version,
    about = "Terminal bridge and automation engine for TN3270 hosts"
)]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    /// Increase log verbosity (-v warn, -vv info, -vvv debug, -vvvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP control surface on the configured loopback address
    Serve {
        #[arg(long, help = "Bridge config file (JSON or YAML)")]
        config: Option<PathBuf>,
        #[arg(long, help = "Override the listen address (loopback only)")]
        listen: Option<String>,
    },
    /// Run a flow file to completion
    Run(RunArgs),
    /// Compare the run logs of two artifacts directories
    Replay {
        #[arg(long)]
        json: bool,
        #[arg(long, help = "Artifacts directory of the reference run")]
        expected: PathBuf,
        #[arg(long, help = "Artifacts directory of the run under test")]
        actual: PathBuf,
        #[arg(long, help = "Also compare screen digests and layout signatures")]
        strict: bool,
        #[arg(long, help = "Fail when either directory lacks checksums")]
        require_checksums: bool,
    },
    /// Inspect or prune the golden screen store
    Goldens {
        #[arg(long, help = "Goldens directory (defaults to goldens_dir from --config)")]
        dir: Option<PathBuf>,
        #[arg(long, help = "Bridge config file (JSON or YAML)")]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[command(subcommand)]
        action: GoldensAction,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, help = "Flow file (JSON or YAML)")]
    flow: PathBuf,
    #[arg(long, help = "Bridge config file (JSON or YAML)")]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(long, help = "Show step-by-step progress on stderr")]
    progress: bool,
    #[arg(long, help = "Run with an interactive TUI showing the host screen")]
    tui: bool,
    #[arg(long, help = "Write run artifacts to this directory")]
    artifacts: Option<PathBuf>,
    #[arg(long, help = "Overwrite an existing artifacts directory")]
    overwrite: bool,
}

#[derive(Debug, Subcommand)]
enum GoldensAction {
    /// List golden names
    List,
    /// Print one golden entry
    Show { name: String },
    /// Delete one golden entry
    Remove { name: String },
}

/// Configure color output based on CLI flag and environment
fn configure_colors(mode: ColorMode) {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            std::env::var("NO_COLOR").is_err()
                && supports_color::on(supports_color::Stream::Stderr).is_some()
        }
    };
    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_colors(cli.color);
    logging::init_logging(cli.verbose, cli.log_file.as_deref(), cli.log_format)?;
    match cli.command {
        Commands::Serve { config, listen } => cmd_serve(config, listen),
        Commands::Run(args) => cmd_run(args),
        Commands::Replay {
            json,
            expected,
            actual,
            strict,
            require_checksums,
        } => cmd_replay(json, &expected, &actual, strict, require_checksums),
        Commands::Goldens {
            dir,
            config,
            json,
            action,
        } => cmd_goldens(dir, config, json, action),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

/// Handle the serve command.
fn cmd_serve(config: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    let mut config = load_config(config.as_deref())?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    let state = Arc::new(AppState::new(config)?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    runtime.block_on(serve(state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    }))?;
    Ok(())
}

/// Handle the run command.
fn cmd_run(args: RunArgs) -> Result<()> {
    if args.tui && (args.progress || args.json) {
        return emit_cli_error(
            args.json,
            "--tui cannot be combined with --progress or --json",
        );
    }
    let (runner, manager, flow) = match prepare_run(&args) {
        Ok(prepared) => prepared,
        Err(err) => return fail(args.json, &err),
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("cancel requested; stopping after the current step");
        handler_token.cancel();
    })
    .into_diagnostic()?;

    let artifacts = args.artifacts.map(|dir| RunArtifactsConfig {
        dir,
        overwrite: args.overwrite,
    });
    let credentials = credentials_from_env();

    if args.tui {
        let options = RunOptions {
            credentials,
            cancel,
            artifacts,
            ..RunOptions::default()
        };
        return match tui_mode::run_tui(runner, manager, flow, options)? {
            Some(outcome) => emit_outcome(false, Ok(outcome)),
            None => Ok(()),
        };
    }

    let verbose = progress::VerboseProgress::new();
    let progress: Option<&dyn ProgressCallback> = if args.progress {
        Some(&verbose)
    } else {
        None
    };
    let options = RunOptions {
        credentials,
        cancel,
        progress,
        artifacts,
        session: None,
    };
    let result = runner.run(&flow, options);
    emit_outcome(args.json, result)
}

fn prepare_run(
    args: &RunArgs,
) -> BridgeResult<(FlowRunner, Arc<SessionManager>, FlowDefinition)> {
    let config = load_config(args.config.as_deref())?;
    let flow = load_flow_file(&args.flow)?;
    let goldens = match &config.goldens_dir {
        Some(dir) => GoldenRegistry::open(dir)?,
        None => GoldenRegistry::new(),
    };
    let manager = Arc::new(SessionManager::new(config));
    let executor = Arc::new(ActionExecutor::new(Arc::clone(&manager)));
    let runner = FlowRunner::new(executor, Arc::new(goldens))?;
    Ok((runner, manager, flow))
}

/// Handle the replay command.
fn cmd_replay(
    json: bool,
    expected: &Path,
    actual: &Path,
    strict: bool,
    require_checksums: bool,
) -> Result<()> {
    let options = ReplayOptions {
        strict,
        require_checksums,
    };
    match replay_dirs(expected, actual, &options) {
        Ok(summary) => {
            if json {
                let payload = serde_json::to_string(&summary).into_diagnostic()?;
                println!("{payload}");
            } else {
                eprintln!("replay {}: {} steps match", summary.status, summary.steps);
            }
            Ok(())
        }
        Err(err) => fail(json, &err),
    }
}

/// Handle the goldens command.
fn cmd_goldens(
    dir: Option<PathBuf>,
    config: Option<PathBuf>,
    json: bool,
    action: GoldensAction,
) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => match load_config(config.as_deref())?.goldens_dir {
            Some(dir) => dir,
            None => return emit_cli_error(json, "no goldens directory; pass --dir or set goldens_dir"),
        },
    };
    let registry = GoldenRegistry::open(dir)?;
    match action {
        GoldensAction::List => {
            let names = registry.list();
            if json {
                println!("{}", serde_json::to_string(&names).into_diagnostic()?);
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        GoldensAction::Show { name } => {
            let Some(entry) = registry.get(&name) else {
                return fail(
                    json,
                    &BridgeError::golden(
                        format!("no golden named '{name}'"),
                        serde_json::json!({"name": name}),
                    ),
                );
            };
            if json {
                println!("{}", serde_json::to_string(&entry).into_diagnostic()?);
            } else {
                println!(
                    "{} ({}x{}, {} fields)",
                    entry.name,
                    entry.signature.rows,
                    entry.signature.cols,
                    entry.signature.fields.len()
                );
                for line in &entry.lines {
                    println!("{line}");
                }
            }
        }
        GoldensAction::Remove { name } => {
            if !registry.remove(&name)? {
                return fail(
                    json,
                    &BridgeError::golden(
                        format!("no golden named '{name}'"),
                        serde_json::json!({"name": name}),
                    ),
                );
            }
            if json {
                println!("{}", serde_json::json!({"removed": name}));
            } else {
                eprintln!("removed {name}");
            }
        }
    }
    Ok(())
}

/// Handle the completions command.
#[allow(clippy::unnecessary_wraps)] // Consistent with other command handlers
fn cmd_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn load_config(path: Option<&Path>) -> BridgeResult<BridgeConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(host) = host_from_env(
        std::env::var(HOST_ENV).ok().as_deref(),
        std::env::var(PORT_ENV).ok().as_deref(),
    ) {
        config.default_host = host;
    }
    config.validate()?;
    Ok(config)
}

/// `MAINFRAME_HOST` with an optional `MAINFRAME_PORT` (default 23).
fn host_from_env(host: Option<&str>, port: Option<&str>) -> Option<String> {
    let host = host.map(str::trim).filter(|host| !host.is_empty())?;
    if host.contains(':') {
        return Some(host.to_string());
    }
    let port = port.map(str::trim).filter(|port| !port.is_empty()).unwrap_or("23");
    Some(format!("{host}:{port}"))
}

fn credentials_from_env() -> Credentials {
    Credentials {
        user: std::env::var(USER_ENV).ok(),
        secret: std::env::var(SECRET_ENV).ok(),
    }
}

fn emit_outcome(json: bool, result: std::result::Result<FlowOutcome, BridgeError>) -> Result<()> {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => return fail(json, &err),
    };
    if json {
        let payload = serde_json::to_string(&outcome).into_diagnostic()?;
        println!("{payload}");
    } else {
        eprintln!(
            "run {:?}: {} ({} records, {}ms)",
            outcome.status,
            outcome.flow,
            outcome.log.len(),
            outcome.duration_ms
        );
        if let Some(err) = &outcome.error {
            eprintln!("error: {}: {}", err.code, err.message);
        }
    }
    match outcome_exit_code(&outcome) {
        0 => Ok(()),
        code => std::process::exit(code),
    }
}

/// 0 for completed runs, 130 for canceled ones, otherwise the failing error's code.
fn outcome_exit_code(outcome: &FlowOutcome) -> i32 {
    match outcome.status {
        RunStatus::Succeeded | RunStatus::Recovered => 0,
        RunStatus::Canceled => ErrorCode::Canceled.exit_code(),
        RunStatus::Failed | RunStatus::Pending | RunStatus::Running => outcome
            .error
            .as_ref()
            .map_or(1, |err| err.code.exit_code()),
    }
}

/// Report `err` and exit with its code.
fn fail(json: bool, err: &BridgeError) -> Result<()> {
    if json {
        let payload = serde_json::to_string(&err.to_error_info()).into_diagnostic()?;
        println!("{payload}");
    } else {
        eprintln!("error: {err}");
    }
    std::process::exit(err.exit_code());
}

fn emit_cli_error(json: bool, message: &str) -> Result<()> {
    fail(json, &BridgeError::validation(message, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_exit_codes() {
        let mut outcome = FlowOutcome::new(tn3270_bridge::RunId::new(), "logon");
        outcome.status = RunStatus::Recovered;
        assert_eq!(outcome_exit_code(&outcome), 0);

        outcome.status = RunStatus::Canceled;
        assert_eq!(outcome_exit_code(&outcome), 130);

        outcome.status = RunStatus::Failed;
        assert_eq!(outcome_exit_code(&outcome), 1);
        outcome.error = Some(BridgeError::assertion("text not present", None).to_error_info());
        assert_eq!(outcome_exit_code(&outcome), 11);
        outcome.error = Some(BridgeError::timeout("keyboard stayed locked", None).to_error_info());
        assert_eq!(outcome_exit_code(&outcome), 4);
    }

    #[test]
    fn host_env_adds_default_port() {
        assert_eq!(host_from_env(Some("localhost"), None), Some("localhost:23".to_string()));
        assert_eq!(
            host_from_env(Some("127.0.0.1"), Some("3270")),
            Some("127.0.0.1:3270".to_string())
        );
        assert_eq!(
            host_from_env(Some("localhost:992"), Some("23")),
            Some("localhost:992".to_string())
        );
        assert_eq!(host_from_env(Some(" "), None), None);
        assert_eq!(host_from_env(None, Some("23")), None);
    }

    #[test]
    fn cli_parses_global_logging_flags() {
        let cli = Cli::try_parse_from([
            "tn3270-bridge",
            "-vv",
            "--log-format",
            "json",
            "replay",
            "--expected",
            "a",
            "--actual",
            "b",
        ]);
        let cli = cli.ok();
        assert_eq!(cli.as_ref().map(|c| c.verbose), Some(2));
        assert_eq!(cli.map(|c| c.log_format), Some(LogFormat::Json));
    }
}
