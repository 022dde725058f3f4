//! Multiplexes concurrent commands over the single worker pipe.
//!
//! Every command gets a fresh correlation token and a single-resolution slot
//! in the pending registry. A background reader drains the worker's output,
//! and the token in each frame, never arrival order, decides which caller is
//! resolved.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::{self, DecodeEvent, DecodedMessage, Frame};
use super::error::{CompositorError, CompositorResult, ErrorKind};
use super::protocol::{Command, CommandType, RawCommand};
use super::supervisor::{FrameReader, Supervisor};
use super::translate::ErrorTranslator;
use crate::cache::FrameCache;

type Slot = oneshot::Sender<CompositorResult<Bytes>>;

/// A command awaiting its response.
struct PendingCall {
    /// Worker generation the command was written to.
    generation: u64,
    slot: Slot,
}

type Registry = DashMap<String, PendingCall>;

/// Removes a pending call when its caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a Registry,
    token: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.token);
    }
}

/// Request/response multiplexer over one [`Supervisor`].
pub struct CommandChannel {
    supervisor: Arc<Supervisor>,
    pending: Arc<Registry>,
    translator: Arc<ErrorTranslator>,
    cache: Arc<FrameCache>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl CommandChannel {
    pub fn new(
        supervisor: Arc<Supervisor>,
        cache: Arc<FrameCache>,
        translator: Arc<ErrorTranslator>,
    ) -> Self {
        Self {
            supervisor,
            pending: Arc::new(DashMap::new()),
            translator,
            cache,
            reader_task: StdMutex::new(None),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    /// Number of commands awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start a worker and begin draining its output.
    ///
    /// Also used to restart after a crash: the previous reader is replaced.
    pub async fn start(&self) -> CompositorResult<()> {
        let reader = self.supervisor.start().await?;
        self.attach(reader);
        Ok(())
    }

    fn attach(&self, reader: FrameReader) {
        let orphaned = fail_generation(
            &self.pending,
            reader.generation().saturating_sub(1),
            &CompositorError::crashed("compositor was restarted"),
        );
        if orphaned > 0 {
            info!(orphaned, "failed commands sent to the previous compositor");
        }

        let task = tokio::spawn(drain_output(
            reader,
            self.supervisor.clone(),
            self.pending.clone(),
            self.translator.clone(),
        ));
        let previous = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Execute a command, answering from the frame cache when possible.
    ///
    /// Cached answers are only given while a worker is running.
    pub async fn execute_command(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> CompositorResult<Bytes> {
        self.supervisor.ensure_running()?;

        let key = command.cache_key();
        if let Some(key) = &key {
            if let Some(payload) = self.cache.lookup(key) {
                debug!(command = %command.command_type(), source = key.source(), "frame cache hit");
                return Ok(payload);
            }
        }

        let payload = self.round_trip(command, timeout).await?;
        command.check_result(&payload)?;

        match command {
            Command::FreeUpMemory(params) => self.cache.shrink_to(params.remaining_bytes),
            Command::CloseAllVideos {} => self.cache.clear(),
            _ => {}
        }
        if let Some(key) = key {
            self.cache.store(key, payload.clone());
        }
        Ok(payload)
    }

    /// Execute a command by wire name with untyped parameters.
    ///
    /// Known command types go through [`CommandChannel::execute_command`] and
    /// the cache. Unknown ones are passed through to the worker uncached.
    pub async fn execute_raw(
        &self,
        command_type: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> CompositorResult<Bytes> {
        if let Some(known) = CommandType::from_name(command_type) {
            let command = Command::from_parts(known, params).map_err(|e| {
                CompositorError::new(
                    ErrorKind::Unknown,
                    format!("invalid parameters for {known}: {e}"),
                )
            })?;
            return self.execute_command(&command, timeout).await;
        }

        let command = RawCommand {
            command_type: command_type.to_string(),
            params,
        };
        self.round_trip(&command, timeout).await
    }

    /// Send one command and wait for its own response.
    ///
    /// The timeout covers the whole exchange, waiting for the writer included.
    async fn round_trip<P: Serialize>(
        &self,
        payload: &P,
        timeout: Option<Duration>,
    ) -> CompositorResult<Bytes> {
        let Some(limit) = timeout else {
            return self.exchange(payload).await;
        };
        match tokio::time::timeout(limit, self.exchange(payload)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(timeout_ms = limit.as_millis() as u64, "command timed out");
                Err(CompositorError::timeout(limit))
            }
        }
    }

    async fn exchange<P: Serialize>(&self, payload: &P) -> CompositorResult<Bytes> {
        let token = Uuid::new_v4().to_string();
        let line = codec::encode(&token, payload)?;
        let (tx, rx) = oneshot::channel();

        // Registered under the write lock, before the bytes leave, so the
        // response can never arrive ahead of its slot.
        let _guard = {
            let mut writer = self.supervisor.writer().await?;
            match self.pending.entry(token.clone()) {
                Entry::Occupied(_) => {
                    return Err(CompositorError::protocol(format!(
                        "correlation token {token} is already in use"
                    )))
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(PendingCall {
                        generation: writer.generation(),
                        slot: tx,
                    });
                }
            }
            let guard = PendingGuard {
                pending: &self.pending,
                token: &token,
            };
            writer.send(Bytes::from(line))?;
            guard
        };

        rx.await?
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Background loop: decode worker output and resolve pending calls.
async fn drain_output(
    mut reader: FrameReader,
    supervisor: Arc<Supervisor>,
    pending: Arc<Registry>,
    translator: Arc<ErrorTranslator>,
) {
    let generation = reader.generation();
    loop {
        match reader.read_next().await {
            Ok(DecodeEvent::Frame(frame)) => resolve(&pending, &translator, frame),
            Ok(DecodeEvent::Chatter(text)) => {
                let text = text.trim();
                if !text.is_empty() {
                    debug!(target: "compositor::worker", "{text}");
                }
            }
            Ok(DecodeEvent::Malformed { nonce, reason }) => {
                warn!(nonce = ?nonce, %reason, "malformed frame from compositor");
                if let Some(nonce) = nonce {
                    if let Some((_, call)) = pending.remove(&nonce) {
                        let _ = call.slot.send(Err(CompositorError::protocol(reason)));
                    }
                }
            }
            Err(cause) => {
                let err = supervisor.report_crash(generation, cause).await;
                let failed = fail_generation(&pending, generation, &err);
                if failed > 0 {
                    info!(failed, "failed pending commands after compositor exit");
                }
                break;
            }
        }
    }
}

fn resolve(pending: &Registry, translator: &ErrorTranslator, frame: Frame) {
    let nonce = frame.nonce.clone();
    let Some((_, call)) = pending.remove(&nonce) else {
        warn!(nonce = %nonce, "discarding response with no pending command");
        return;
    };

    let outcome = match frame.into_message() {
        Ok(DecodedMessage::Success(payload)) => Ok(payload),
        Ok(DecodedMessage::Failure { message, backtrace }) => {
            Err(translator.to_error(message, backtrace))
        }
        Err(err) => {
            warn!(nonce = %nonce, error = %err, "undecodable frame from compositor");
            Err(err)
        }
    };

    // The caller may have stopped waiting; nothing observes the result then.
    let _ = call.slot.send(outcome);
}

/// Fail every call written to `generation` or earlier.
fn fail_generation(pending: &Registry, generation: u64, err: &CompositorError) -> usize {
    let stale: Vec<String> = pending
        .iter()
        .filter(|entry| entry.value().generation <= generation)
        .map(|entry| entry.key().clone())
        .collect();

    let mut failed = 0;
    for token in stale {
        if let Some((_, call)) = pending.remove(&token) {
            let _ = call.slot.send(Err(err.clone()));
            failed += 1;
        }
    }
    failed
}
