//! Lifecycle of the native compositor worker process.
//!
//! The supervisor owns exactly one current [`WorkerHandle`]. A crashed handle
//! is retired and replaced by a fresh one on [`Supervisor::start`]; it is never
//! revived in place.
//!
//! ```text
//! NotStarted ──start──▶ Starting ──alive──▶ Running ──stdout closed──▶ Crashed
//!                                              │                          │
//!                                              └────────shutdown──────────┴──▶ Stopped
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{self, DecodeEvent, FrameDecoder, SHUTDOWN_LINE};
use super::error::{CompositorError, CompositorResult};
use super::protocol::{StartLongRunningProcessParams, StartupCommand};
use super::translate::translate_exit;
use crate::config::{CompositorSettings, LogLevel, SettingsError};

/// Bytes of worker stderr kept for crash reports.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Size of a single read from the worker's stdout.
const READ_CHUNK: usize = 64 * 1024;

/// How long a crash report waits for the exited worker to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    Crashed,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How to launch the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable to run.
    pub program: PathBuf,
    /// Full argument list, startup command included.
    pub args: Vec<String>,
    pub log_level: LogLevel,
    pub indent: bool,
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// Launch configuration for a long-running worker.
    pub fn from_settings(settings: &CompositorSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let program = settings.resolve_binary()?;
        Ok(Self::with_program(program, settings))
    }

    /// Like [`WorkerConfig::from_settings`], with an explicit executable.
    pub fn with_program(program: impl Into<PathBuf>, settings: &CompositorSettings) -> Self {
        let mut args = settings.extra_args.clone();
        args.push(startup_argument(settings));
        Self {
            program: program.into(),
            args,
            log_level: settings.log_level,
            indent: settings.indent,
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

/// The `StartLongRunningProcess` envelope passed as the last argument.
fn startup_argument(settings: &CompositorSettings) -> String {
    let command = StartupCommand::StartLongRunningProcess(StartLongRunningProcessParams {
        concurrency: settings.concurrency,
        maximum_frame_cache_size_in_bytes: settings.maximum_frame_cache_items_in_bytes,
        verbose: settings.log_level.is_verbose(),
    });
    // Encoding a fixed-shape struct cannot fail; fall back to an empty object
    // rather than panic.
    codec::encode("0", &command)
        .map(|line| String::from_utf8_lossy(line.trim_ascii_end()).into_owned())
        .unwrap_or_else(|_| "{}".to_string())
}

/// Bounded tail of the worker's stderr.
#[derive(Debug, Default)]
struct StderrTail {
    bytes: VecDeque<u8>,
}

impl StderrTail {
    fn push(&mut self, line: &[u8]) {
        self.bytes.extend(line);
        let excess = self.bytes.len().saturating_sub(STDERR_TAIL_BYTES);
        self.bytes.drain(..excess);
    }

    fn contents(&self) -> String {
        let (a, b) = self.bytes.as_slices();
        let mut all = Vec::with_capacity(a.len() + b.len());
        all.extend_from_slice(a);
        all.extend_from_slice(b);
        String::from_utf8_lossy(&all).into_owned()
    }
}

/// One live worker process.
///
/// Input goes through `outbox` to a dedicated writer task, so a worker that
/// stops reading stdin never blocks callers or the lifecycle lock.
struct WorkerHandle {
    generation: u64,
    child: Child,
    outbox: Option<mpsc::UnboundedSender<Bytes>>,
    writer_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    stderr_tail: Arc<StdMutex<StderrTail>>,
}

impl WorkerHandle {
    fn stderr_contents(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contents()
    }

    /// Collect stderr after the process has exited.
    async fn drain_stderr(&mut self) -> String {
        let _ = tokio::time::timeout(REAP_TIMEOUT, &mut self.stderr_task).await;
        self.stderr_contents()
    }

    fn retire(&mut self) {
        self.outbox = None;
        let _ = self.child.start_kill();
        self.writer_task.abort();
        self.stderr_task.abort();
    }
}

/// Reads frames from the worker's stdout.
///
/// Handed to the command channel's background reader; one per worker
/// generation.
pub struct FrameReader {
    generation: u64,
    stdout: ChildStdout,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl FrameReader {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the next event on the output stream.
    ///
    /// Closure of the stream surfaces as `WorkerCrashed`.
    pub async fn read_next(&mut self) -> CompositorResult<DecodeEvent> {
        loop {
            if let Some(event) = self.decoder.next_event() {
                return Ok(event);
            }

            let n = self
                .stdout
                .read(&mut self.chunk)
                .await
                .map_err(|e| CompositorError::crashed(format!("failed to read from compositor: {e}")))?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    warn!(
                        bytes = self.decoder.buffered(),
                        "compositor output ended inside a frame"
                    );
                }
                return Err(CompositorError::crashed("compositor closed its output stream"));
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Exclusive access to the current worker's input queue.
///
/// Holding a writer serializes sends: frames never interleave. Sending only
/// enqueues, so a writer is never held across I/O.
pub struct WorkerWriter<'a> {
    guard: MutexGuard<'a, Option<WorkerHandle>>,
    generation: u64,
}

impl WorkerWriter<'_> {
    /// Generation of the worker this writer targets.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue one encoded command for the worker.
    pub fn send(&mut self, bytes: Bytes) -> CompositorResult<()> {
        self.guard
            .as_ref()
            .and_then(|handle| handle.outbox.as_ref())
            .ok_or_else(|| CompositorError::crashed("compositor input stream is closed"))?
            .send(bytes)
            .map_err(|_| CompositorError::crashed("compositor input stream is closed"))
    }
}

/// Owns the worker subprocess.
pub struct Supervisor {
    config: WorkerConfig,
    current: Mutex<Option<WorkerHandle>>,
    state: watch::Sender<SupervisorState>,
    generation: AtomicU64,
    last_crash: StdMutex<Option<CompositorError>>,
}

impl Supervisor {
    pub fn new(config: WorkerConfig) -> Self {
        let (state, _) = watch::channel(SupervisorState::NotStarted);
        Self {
            config,
            current: Mutex::new(None),
            state,
            generation: AtomicU64::new(0),
            last_crash: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "compositor state changed");
        }
    }

    /// The failure that retired the last worker, if any.
    pub fn last_crash(&self) -> Option<CompositorError> {
        self.last_crash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_crash(&self, err: &CompositorError) {
        *self.last_crash.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
    }

    /// Launch a fresh worker, retiring any current one.
    ///
    /// Returns the reader for the new worker's output stream.
    pub async fn start(&self) -> CompositorResult<FrameReader> {
        let mut current = self.current.lock().await;
        if self.state() == SupervisorState::Stopped {
            return Err(CompositorError::crashed("compositor has been shut down"));
        }

        if let Some(mut old) = current.take() {
            warn!(generation = old.generation, "retiring previous compositor");
            old.retire();
        }

        self.set_state(SupervisorState::Starting);
        match self.spawn().and_then(|(mut handle, reader)| {
            confirm_alive(&mut handle)?;
            Ok((handle, reader))
        }) {
            Ok((handle, reader)) => {
                info!(
                    generation = handle.generation,
                    pid = ?handle.child.id(),
                    program = %self.config.program.display(),
                    "compositor started"
                );
                *current = Some(handle);
                *self.last_crash.lock().unwrap_or_else(PoisonError::into_inner) = None;
                self.set_state(SupervisorState::Running);
                Ok(reader)
            }
            Err(err) => {
                warn!(error = %err, "failed to start compositor");
                self.record_crash(&err);
                self.set_state(SupervisorState::Crashed);
                Err(err)
            }
        }
    }

    fn spawn(&self) -> CompositorResult<(WorkerHandle, FrameReader)> {
        let program = self.config.program.display().to_string();
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CompositorError::spawn_failed(&program, &e))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(CompositorError::crashed("compositor streams were not captured"));
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbox, queued) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_commands(stdin, queued, generation));
        let stderr_tail = Arc::new(StdMutex::new(StderrTail::default()));
        let stderr_task = tokio::spawn(forward_stderr(
            stderr,
            stderr_tail.clone(),
            self.config.log_level,
            self.config.indent,
        ));

        let handle = WorkerHandle {
            generation,
            child,
            outbox: Some(outbox),
            writer_task,
            stderr_task,
            stderr_tail,
        };
        let reader = FrameReader {
            generation,
            stdout,
            decoder: FrameDecoder::new(),
            chunk: vec![0; READ_CHUNK],
        };
        Ok((handle, reader))
    }

    /// Fail with the error a command would get unless a worker is `Running`.
    pub fn ensure_running(&self) -> CompositorResult<()> {
        match self.state() {
            SupervisorState::Running => Ok(()),
            SupervisorState::Stopped => {
                Err(CompositorError::crashed("compositor has been shut down"))
            }
            state => Err(self.last_crash().unwrap_or_else(|| {
                CompositorError::crashed(format!("compositor is not running ({state})"))
            })),
        }
    }

    /// Acquire the write path of the running worker.
    ///
    /// Fails with `WorkerCrashed` unless a worker is `Running`.
    pub async fn writer(&self) -> CompositorResult<WorkerWriter<'_>> {
        let guard = self.current.lock().await;
        self.ensure_running()?;
        let generation = guard
            .as_ref()
            .map(|handle| handle.generation)
            .ok_or_else(|| CompositorError::crashed("compositor is not running"))?;
        Ok(WorkerWriter { guard, generation })
    }

    /// Queue bytes for the running worker.
    pub async fn send(&self, bytes: &[u8]) -> CompositorResult<()> {
        self.writer().await?.send(Bytes::copy_from_slice(bytes))
    }

    /// Called by the output reader when a worker's stdout closed.
    ///
    /// Retires the handle and returns the error every caller waiting on that
    /// worker should see. Reports for an already retired generation only
    /// describe the closure.
    pub async fn report_crash(&self, generation: u64, cause: CompositorError) -> CompositorError {
        let mut current = self.current.lock().await;

        let is_current = current.as_ref().map(|h| h.generation) == Some(generation);
        if !is_current {
            return match self.state() {
                SupervisorState::Stopped => CompositorError::crashed("compositor was shut down"),
                _ => cause,
            };
        }
        if self.state() == SupervisorState::Stopped {
            return CompositorError::crashed("compositor was shut down");
        }

        let Some(mut handle) = current.take() else {
            return cause;
        };
        let status = match tokio::time::timeout(REAP_TIMEOUT, handle.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                let _ = handle.child.start_kill();
                None
            }
        };
        handle.writer_task.abort();
        let stderr = handle.drain_stderr().await;
        let err = translate_exit(status, &stderr);

        warn!(generation, error = %err, "compositor crashed");
        self.record_crash(&err);
        self.set_state(SupervisorState::Crashed);
        err
    }

    /// Stop the worker.
    ///
    /// No new commands are accepted once this begins. The worker is asked to
    /// finish and exit; after the shutdown timeout it is killed.
    pub async fn shutdown(&self) -> CompositorResult<()> {
        let mut current = self.current.lock().await;
        self.set_state(SupervisorState::Stopped);

        let Some(mut handle) = current.take() else {
            return Ok(());
        };

        // Queued after any pending commands; dropping the sender lets the
        // writer task close stdin once everything is written.
        if let Some(outbox) = handle.outbox.take() {
            if outbox.send(Bytes::from_static(SHUTDOWN_LINE)).is_err() {
                debug!("could not queue shutdown line");
            }
        }

        let result = match tokio::time::timeout(self.config.shutdown_timeout, handle.child.wait()).await
        {
            Ok(Ok(status)) if status.success() => {
                info!(generation = handle.generation, "compositor exited");
                Ok(())
            }
            Ok(Ok(status)) => {
                let stderr = handle.drain_stderr().await;
                Err(translate_exit(Some(status), &stderr))
            }
            Ok(Err(e)) => Err(CompositorError::crashed(format!(
                "failed to wait for compositor: {e}"
            ))),
            Err(_) => {
                warn!(
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "compositor did not exit in time, killing it"
                );
                let _ = handle.child.kill().await;
                Ok(())
            }
        };

        handle.writer_task.abort();
        handle.stderr_task.abort();
        result
    }
}

/// The worker must survive its own startup; one that exits straight away
/// never gets `Running`.
fn confirm_alive(handle: &mut WorkerHandle) -> CompositorResult<()> {
    match handle.child.try_wait() {
        Ok(None) => Ok(()),
        Ok(Some(status)) => {
            let err = translate_exit(Some(status), &handle.stderr_contents());
            handle.retire();
            Err(err)
        }
        Err(e) => {
            handle.retire();
            Err(CompositorError::crashed(format!(
                "failed to check compositor status: {e}"
            )))
        }
    }
}

/// Drain the input queue into the worker's stdin.
///
/// Ends when the queue is closed (stdin is then shut down) or a write fails.
async fn write_commands(
    stdin: ChildStdin,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
    generation: u64,
) {
    let mut stdin = BufWriter::new(stdin);
    while let Some(bytes) = queued.recv().await {
        let written = match stdin.write_all(&bytes).await {
            Ok(()) if queued.is_empty() => stdin.flush().await,
            other => other,
        };
        if let Err(e) = written {
            debug!(generation, error = %e, "stopped writing to compositor");
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

/// Drain the worker's stderr into the log and the crash tail.
async fn forward_stderr(
    stderr: ChildStderr,
    tail: Arc<StdMutex<StderrTail>>,
    log_level: LogLevel,
    indent: bool,
) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let prefix = if indent { "  " } else { "" };

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                tail.lock().unwrap_or_else(PoisonError::into_inner).push(&line);
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                match log_level.tracing_level() {
                    tracing::Level::TRACE => {
                        tracing::trace!(target: "compositor::worker", "{prefix}{text}")
                    }
                    tracing::Level::DEBUG => {
                        tracing::debug!(target: "compositor::worker", "{prefix}{text}")
                    }
                    tracing::Level::INFO => {
                        tracing::info!(target: "compositor::worker", "{prefix}{text}")
                    }
                    tracing::Level::WARN => {
                        tracing::warn!(target: "compositor::worker", "{prefix}{text}")
                    }
                    _ => tracing::error!(target: "compositor::worker", "{prefix}{text}"),
                }
            }
            Err(e) => {
                debug!(error = %e, "stopped reading compositor stderr");
                break;
            }
        }
    }
}
