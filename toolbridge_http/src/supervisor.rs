//! Child process supervision for one provider.
//!
//! A [`ProcessSupervisor`] owns at most one live [`ChildProcess`] at a time.
//! `start()` is idempotent while the child runs; once the child has exited it
//! is discarded and the next `start()` spawns a fresh one. There is no restart
//! loop: restarts only happen when someone asks for the provider again.
//!
//! Each child gets a single I/O task that
//! - decodes stdout with [`FrameDecoder`] and forwards frames, in order, to
//!   the one frame subscriber,
//! - forwards stderr lines to the log (never mixed with protocol frames),
//! - waits for the process to end and publishes its [`ExitReason`].

use crate::config::ProviderSpec;
use crate::error::{BridgeError, Result};
use chrono::Local;
use futures::StreamExt;
use owo_colors::OwoColorize;
use serde_json::Value;
use std::{
    fmt,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, watch},
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use toolbridge_common::FrameDecoder;
use tracing::{debug, error, info, warn};

/// How long a child may linger after closing stdout before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Ordered stream of frames decoded from one child's stdout.
pub type FrameReceiver = mpsc::UnboundedReceiver<Value>;

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited on its own with this status code.
    Code(i32),
    /// Terminated by this signal (unix only).
    Signal(i32),
    /// Killed at the bridge's request.
    Killed,
    /// Exit status could not be determined.
    Unknown(String),
}

impl ExitReason {
    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitReason::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitReason::Signal(signal);
            }
        }
        ExitReason::Unknown(status.to_string())
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "exit code {code}"),
            ExitReason::Signal(signal) => write!(f, "signal {signal}"),
            ExitReason::Killed => write!(f, "terminated by bridge"),
            ExitReason::Unknown(detail) => write!(f, "unknown exit ({detail})"),
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Stdin,
    Stdout,
    Stderr,
}

/// Print one exchanged line to stderr with a timestamp and per-direction color.
fn echo_line(provider: &str, direction: Direction, line: &str) {
    let timestamp = format!("[{}]", Local::now().format("%H:%M:%S%.3f"));
    let tag = format!("[{provider}]");
    let body = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|parsed| serde_json::to_string_pretty(&parsed).ok())
        .unwrap_or_else(|| line.to_string());

    match direction {
        Direction::Stdin => {
            eprintln!("{} {} {}\n{}", timestamp, tag.cyan(), "→ STDIN:".cyan(), body.cyan())
        }
        Direction::Stdout => eprintln!(
            "{} {} {}\n{}",
            timestamp,
            tag.green(),
            "← STDOUT:".green(),
            body.green()
        ),
        Direction::Stderr => {
            eprintln!("{} {} {}\n{}", timestamp, tag.red(), "⚠ STDERR:".red(), body.red())
        }
    }
}

/// One spawned provider process.
pub struct ChildProcess {
    provider: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    frames: Mutex<Option<FrameReceiver>>,
    exit_rx: watch::Receiver<Option<ExitReason>>,
    kill: CancellationToken,
    colored_output: bool,
}

impl ChildProcess {
    /// Spawn the process described by `spec` and start its I/O task.
    pub fn spawn(spec: &ProviderSpec, colored_output: bool) -> Result<Self> {
        let spawn_error = |reason: String| BridgeError::Spawn {
            provider: spec.name.clone(),
            reason,
        };

        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child must not outlive the bridge.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();

        let pid = child.id();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        info!(
            provider = %spec.name,
            pid = ?pid,
            command = %spec.command,
            "Spawned provider process"
        );

        tokio::spawn(run_io(
            spec.name.clone(),
            child,
            stdout,
            stderr,
            frames_tx,
            exit_tx,
            kill.clone(),
            colored_output,
        ));

        Ok(Self {
            provider: spec.name.clone(),
            pid,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            frames: Mutex::new(Some(frames_rx)),
            exit_rx,
            kill,
            colored_output,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True until the process has exited or termination was requested.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none() && !self.kill.is_cancelled()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_rx.borrow().clone()
    }

    /// Wait until the process has exited.
    pub async fn wait_exit(&self) -> ExitReason {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| ExitReason::Unknown("I/O task ended".into()));
            }
        }
    }

    /// Take the frame stream. It has a single consumer, so only the first
    /// call returns `Some`.
    pub fn take_frames(&self) -> Option<FrameReceiver> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Write one message followed by `\n` to the child's stdin.
    pub async fn write(&self, message: &Value) -> Result<()> {
        if !self.is_running() {
            return Err(self.exited_error());
        }

        let line = serde_json::to_string(message)?;
        if self.colored_output {
            echo_line(&self.provider, Direction::Stdin, &line);
        }
        debug!(provider = %self.provider, "Sending to provider: {}", line);

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| self.exited_error())?;

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            error!(provider = %self.provider, "Failed to write to stdin: {}", e);
            // A broken pipe means the process is gone or going; stop writing.
            guard.take();
            return Err(BridgeError::ProcessExited {
                provider: self.provider.clone(),
                reason: format!("stdin write failed: {e}"),
            });
        }
        Ok(())
    }

    /// Request termination. Returns immediately; the exit is observed
    /// asynchronously through [`ChildProcess::wait_exit`].
    pub fn terminate(&self) {
        if !self.kill.is_cancelled() {
            info!(provider = %self.provider, pid = ?self.pid, "Terminating provider process");
            self.kill.cancel();
        }
    }

    fn exited_error(&self) -> BridgeError {
        let reason = self
            .exit_reason()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "termination requested".to_string());
        BridgeError::ProcessExited {
            provider: self.provider.clone(),
            reason,
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_io(
    provider: String,
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    frames_tx: mpsc::UnboundedSender<Value>,
    exit_tx: watch::Sender<Option<ExitReason>>,
    kill: CancellationToken,
    colored_output: bool,
) {
    let mut frames = FramedRead::new(stdout, FrameDecoder::new());
    let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                debug!(provider = %provider, "Termination requested, stopping I/O handler");
                break;
            }

            frame = frames.next() => match frame {
                Some(Ok(value)) => {
                    if colored_output {
                        echo_line(&provider, Direction::Stdout, &value.to_string());
                    }
                    debug!(provider = %provider, "Received from provider: {}", value);
                    if frames_tx.send(value).is_err() {
                        debug!(provider = %provider, "No frame subscriber; dropping frame");
                    }
                }
                Some(Err(e)) => {
                    error!(provider = %provider, "Failed to read stdout: {}", e);
                    break;
                }
                None => {
                    debug!(provider = %provider, "Provider stdout closed");
                    break;
                }
            },

            line = async {
                match stderr_lines.as_mut() {
                    Some(reader) => reader.next_line().await,
                    None => std::future::pending().await,
                }
            } => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if colored_output {
                        echo_line(&provider, Direction::Stderr, &line);
                    } else {
                        info!(target: "toolbridge::child_stderr", provider = %provider, "{}", line);
                    }
                }
                Ok(None) => stderr_lines = None,
                Err(e) => {
                    warn!(provider = %provider, "Failed to read stderr: {}", e);
                    stderr_lines = None;
                }
            },
        }
    }

    let reason = if kill.is_cancelled() {
        let _ = child.start_kill();
        let _ = child.wait().await;
        ExitReason::Killed
    } else {
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => ExitReason::from_status(status),
            Ok(Err(e)) => ExitReason::Unknown(e.to_string()),
            Err(_) => {
                warn!(provider = %provider, "Provider closed stdout but kept running; killing it");
                let _ = child.start_kill();
                let _ = child.wait().await;
                ExitReason::Killed
            }
        }
    };

    info!(provider = %provider, reason = %reason, "Provider process ended");
    let _ = exit_tx.send(Some(reason));
    // Closing the frame channel after publishing the exit lets the subscriber
    // read the reason as soon as it sees end-of-stream.
    drop(frames_tx);
}

/// Owner of the single live child process of one provider.
pub struct ProcessSupervisor {
    spec: ProviderSpec,
    colored_output: bool,
    current: Mutex<Option<Arc<ChildProcess>>>,
}

impl ProcessSupervisor {
    pub fn new(spec: ProviderSpec, colored_output: bool) -> Self {
        Self {
            spec,
            colored_output,
            current: Mutex::new(None),
        }
    }

    /// Return the running child, spawning one if there is none.
    ///
    /// A child that has exited (or is being terminated) is discarded first.
    pub fn start(&self) -> Result<Arc<ChildProcess>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = current.as_ref() {
            if child.is_running() {
                return Ok(child.clone());
            }
            debug!(provider = %self.spec.name, "Discarding terminated child handle");
        }

        let child = Arc::new(ChildProcess::spawn(&self.spec, self.colored_output)?);
        *current = Some(child.clone());
        Ok(child)
    }

    /// The current child, if one was started and is still running.
    pub fn current(&self) -> Option<Arc<ChildProcess>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|child| child.is_running())
            .cloned()
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    /// Write to the current child.
    pub async fn write(&self, message: &Value) -> Result<()> {
        let child = self.current().ok_or_else(|| BridgeError::NotReady {
            provider: self.spec.name.clone(),
        })?;
        child.write(message).await
    }

    /// Request termination of the current child, if any. Does not wait.
    pub fn terminate(&self) {
        if let Some(child) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            child.terminate();
        }
    }
}
