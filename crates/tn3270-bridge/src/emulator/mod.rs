//! The terminal-emulation subprocess and the line transport it is reached through.
//!
//! [`ScriptIo`] is the seam: [`S3270Process`] implements it over a child
//! process's pipes, and tests implement it in-process. [`Emulator`] layers the
//! request/reply exchange on top, so every directive either completes with a
//! parsed [`ScriptReply`] or fails before control returns to the caller.

use crate::config::EmulatorConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{ScriptCommand, ScriptReply};
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Line transport to an emulator.
pub trait ScriptIo: Send {
    /// Write one request line (no trailing newline).
    fn send_line(&mut self, line: &str) -> BridgeResult<()>;

    /// Next reply line, `None` if `deadline` passes first.
    ///
    /// # Errors
    /// `E_SESSION_FAULTED` once the emulator has gone away.
    fn recv_line(&mut self, deadline: Instant) -> BridgeResult<Option<String>>;

    fn is_alive(&mut self) -> bool;

    /// Stop the emulator, forcing it after `grace`.
    fn shutdown(&mut self, grace: Duration) -> BridgeResult<()>;
}

/// Produces a fresh transport per connection.
pub trait EmulatorLauncher: Send + Sync {
    fn launch(&self) -> BridgeResult<Box<dyn ScriptIo>>;
}

/// Launches the configured emulator program.
#[derive(Clone, Debug)]
pub struct S3270Launcher {
    config: EmulatorConfig,
}

impl S3270Launcher {
    #[must_use]
    pub fn new(config: EmulatorConfig) -> Self {
        Self { config }
    }
}

impl EmulatorLauncher for S3270Launcher {
    fn launch(&self) -> BridgeResult<Box<dyn ScriptIo>> {
        let process = S3270Process::spawn(&self.config.program, &self.config.command_args())?;
        Ok(Box::new(process))
    }
}

/// A child emulator process driven over stdin/stdout.
///
/// The child runs in its own process group. Stdout is drained by a reader
/// thread into a channel so reads can honour deadlines.
pub struct S3270Process {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl S3270Process {
    /// # Errors
    /// `E_CONNECT` if the program cannot be started at all.
    pub fn spawn(program: &str, args: &[String]) -> BridgeResult<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|err| {
            BridgeError::connect(
                "failed to start emulator",
                serde_json::json!({"program": program, "args": args, "source": err.to_string()}),
            )
        })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::internal("emulator stdout not captured"))?;

        let (tx, rx) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("s3270-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|err| BridgeError::io("failed to start emulator reader", err))?;

        tracing::debug!(program, pid = child.id(), "emulator started");
        Ok(Self {
            child,
            stdin,
            lines: rx,
            reader: Some(reader),
        })
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> BridgeResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(BridgeError::io("failed to wait for emulator", err)),
            }
        }
    }

    /// SIGTERM the process group, wait up to `grace`, then SIGKILL.
    pub fn terminate_process_group(&mut self, grace: Duration) -> BridgeResult<()> {
        // Closing stdin lets a well-behaved emulator exit on its own.
        drop(self.stdin.take());
        #[cfg(unix)]
        if let Some(pgid) = self.pgid() {
            signal_process_group(pgid, Signal::SIGTERM)?;
            if !self.wait_for_exit(grace)? {
                signal_process_group(pgid, Signal::SIGKILL)?;
                self.wait_for_exit(Duration::from_millis(200))?;
            }
            self.join_reader();
            return Ok(());
        }
        if !self.wait_for_exit(grace)? {
            self.child
                .kill()
                .map_err(|err| BridgeError::io("failed to kill emulator", err))?;
            self.wait_for_exit(Duration::from_millis(200))?;
        }
        self.join_reader();
        Ok(())
    }

    #[cfg(unix)]
    fn pgid(&self) -> Option<Pid> {
        i32::try_from(self.child.id()).ok().map(Pid::from_raw)
    }

    fn join_reader(&mut self) {
        if let Some(handle) = self.reader.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }

    fn cleanup_process_best_effort(&mut self) {
        drop(self.stdin.take());
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        #[cfg(unix)]
        if let Some(pgid) = self.pgid() {
            let _ = signal_process_group(pgid, Signal::SIGTERM);
            let deadline = Instant::now() + Duration::from_millis(100);
            while Instant::now() < deadline {
                if self.child.try_wait().ok().flatten().is_some() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = signal_process_group(pgid, Signal::SIGKILL);
            let _ = self.child.wait();
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ScriptIo for S3270Process {
    fn send_line(&mut self, line: &str) -> BridgeResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BridgeError::faulted("emulator stdin closed"))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .map_err(|err| {
                BridgeError::new(
                    crate::error::ErrorCode::SessionFaulted,
                    "failed to write to emulator",
                    serde_json::json!({"source": err.to_string()}),
                )
            })
    }

    fn recv_line(&mut self, deadline: Instant) -> BridgeResult<Option<String>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.lines.recv_timeout(remaining) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BridgeError::faulted("emulator closed its output"))
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn shutdown(&mut self, grace: Duration) -> BridgeResult<()> {
        self.terminate_process_group(grace)
    }
}

impl Drop for S3270Process {
    /// Best effort: SIGTERM, 100ms, then SIGKILL. No emulator outlives its owner.
    fn drop(&mut self) {
        self.cleanup_process_best_effort();
    }
}

#[cfg(unix)]
fn signal_process_group(pgid: Pid, signal: Signal) -> BridgeResult<()> {
    match killpg(pgid, signal) {
        // ESRCH: already gone
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(BridgeError::io("failed to signal emulator process group", err)),
    }
}

/// Slack added on top of a directive's own timeout before the exchange is
/// considered hung.
const REPLY_SLACK: Duration = Duration::from_secs(2);

/// Request/reply exchange over a [`ScriptIo`].
pub struct Emulator {
    io: Box<dyn ScriptIo>,
}

impl Emulator {
    #[must_use]
    pub fn new(io: Box<dyn ScriptIo>) -> Self {
        Self { io }
    }

    /// Send one directive and collect its complete reply.
    ///
    /// Directives that wait inside the emulator carry their own timeout, so a
    /// reply normally arrives before `timeout`. If it does not arrive within
    /// `timeout` plus slack the exchange is abandoned and the emulator is
    /// treated as hung (`E_SESSION_FAULTED`).
    pub fn execute(&mut self, command: &ScriptCommand, timeout: Duration) -> BridgeResult<ScriptReply> {
        tracing::debug!(verb = command.verb(), "script directive");
        self.io.send_line(&command.render())?;
        let deadline = Instant::now() + timeout + REPLY_SLACK;
        let mut lines = Vec::new();
        loop {
            let Some(line) = self.io.recv_line(deadline)? else {
                return Err(BridgeError::new(
                    crate::error::ErrorCode::SessionFaulted,
                    "emulator did not answer in time",
                    serde_json::json!({
                        "verb": command.verb(),
                        "timeout_ms": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "partial_lines": lines.len(),
                    }),
                ));
            };
            let done = ScriptReply::is_terminator(&line);
            lines.push(line);
            if done {
                return ScriptReply::parse(&lines);
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        self.io.is_alive()
    }

    pub fn shutdown(&mut self, grace: Duration) -> BridgeResult<()> {
        self.io.shutdown(grace)
    }
}
