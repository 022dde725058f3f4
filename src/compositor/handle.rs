//! Caller-facing entry point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::info;

use super::channel::CommandChannel;
use super::error::{CompositorError, CompositorResult};
use super::protocol::{
    decode_json, Command, EchoParams, ExtractAudioParams, ExtractFrameParams, FreeUpMemoryParams,
    GetSilencesParams, GetVideoMetadataParams, OpenVideoStats, SilencesResult, VideoMetadata,
};
use super::supervisor::{Supervisor, SupervisorState, WorkerConfig};
use super::translate::ErrorTranslator;
use crate::cache::FrameCache;
use crate::config::CompositorSettings;

/// Anything that can execute compositor commands.
///
/// Collaborators depend on this rather than on [`CompositorHandle`] so they
/// can be exercised without a worker process.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command and return the raw result payload.
    async fn execute_command(&self, command: Command) -> CompositorResult<Bytes>;
}

/// Start a long-running compositor.
///
/// Resolves the worker binary from the settings and launches it.
pub async fn start_compositor(settings: &CompositorSettings) -> CompositorResult<CompositorHandle> {
    let config = WorkerConfig::from_settings(settings)
        .map_err(|e| CompositorError::crashed(e.to_string()))?;
    CompositorHandle::start(config, settings, ErrorTranslator::new()).await
}

/// Handle to one compositor instance.
///
/// Instances are fully independent; dropping the handle kills the worker.
pub struct CompositorHandle {
    channel: CommandChannel,
    default_timeout: Option<Duration>,
}

impl CompositorHandle {
    /// Start a compositor with an explicit launch configuration and
    /// translation table.
    pub async fn start(
        config: WorkerConfig,
        settings: &CompositorSettings,
        translator: ErrorTranslator,
    ) -> CompositorResult<Self> {
        let supervisor = Arc::new(Supervisor::new(config));
        let cache = Arc::new(FrameCache::new(settings.maximum_frame_cache_items_in_bytes));
        let channel = CommandChannel::new(supervisor, cache, Arc::new(translator));
        channel.start().await?;

        Ok(Self {
            channel,
            default_timeout: settings.command_timeout(),
        })
    }

    /// Execute a command with the configured default timeout.
    pub async fn execute_command(&self, command: Command) -> CompositorResult<Bytes> {
        self.channel
            .execute_command(&command, self.default_timeout)
            .await
    }

    /// Execute a command with an explicit timeout (`None` waits indefinitely).
    pub async fn execute_command_with_timeout(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> CompositorResult<Bytes> {
        self.channel.execute_command(&command, timeout).await
    }

    /// Execute a command type by name with untyped parameters.
    pub async fn execute_raw(
        &self,
        command_type: &str,
        params: serde_json::Value,
    ) -> CompositorResult<Bytes> {
        self.channel
            .execute_raw(command_type, params, self.default_timeout)
            .await
    }

    pub async fn get_video_metadata(&self, src: impl Into<String>) -> CompositorResult<VideoMetadata> {
        let payload = self
            .execute_command(Command::GetVideoMetadata(GetVideoMetadataParams {
                src: src.into(),
            }))
            .await?;
        decode_json(&payload)
    }

    /// Extract one encoded frame.
    pub async fn extract_frame(&self, params: ExtractFrameParams) -> CompositorResult<Bytes> {
        self.execute_command(Command::ExtractFrame(params)).await
    }

    pub async fn get_silences(&self, params: GetSilencesParams) -> CompositorResult<SilencesResult> {
        let payload = self.execute_command(Command::GetSilences(params)).await?;
        decode_json(&payload)
    }

    pub async fn extract_audio(
        &self,
        input_path: impl Into<String>,
        output_path: impl Into<String>,
    ) -> CompositorResult<()> {
        self.execute_command(Command::ExtractAudio(ExtractAudioParams {
            input_path: input_path.into(),
            output_path: output_path.into(),
        }))
        .await
        .map(|_| ())
    }

    /// Ask the worker to shrink its frame cache; the local cache follows.
    pub async fn free_up_memory(&self, remaining_bytes: u64) -> CompositorResult<()> {
        self.execute_command(Command::FreeUpMemory(FreeUpMemoryParams { remaining_bytes }))
            .await
            .map(|_| ())
    }

    pub async fn close_all_videos(&self) -> CompositorResult<()> {
        self.execute_command(Command::CloseAllVideos {})
            .await
            .map(|_| ())
    }

    pub async fn get_open_video_stats(&self) -> CompositorResult<OpenVideoStats> {
        let payload = self.execute_command(Command::GetOpenVideoStats {}).await?;
        decode_json(&payload)
    }

    pub async fn echo(&self, message: impl Into<String>) -> CompositorResult<Bytes> {
        self.execute_command(Command::Echo(EchoParams {
            message: message.into(),
        }))
        .await
    }

    pub fn state(&self) -> SupervisorState {
        self.channel.supervisor().state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.channel.supervisor().subscribe()
    }

    pub fn cache(&self) -> &FrameCache {
        self.channel.cache()
    }

    /// Commands currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.channel.pending_count()
    }

    /// Replace the worker with a fresh process.
    pub async fn restart(&self) -> CompositorResult<()> {
        info!("restarting compositor");
        self.channel.start().await
    }

    /// Let the worker finish outstanding commands and exit.
    pub async fn shutdown(&self) -> CompositorResult<()> {
        self.channel.supervisor().shutdown().await
    }
}

#[async_trait]
impl CommandExecutor for CompositorHandle {
    async fn execute_command(&self, command: Command) -> CompositorResult<Bytes> {
        CompositorHandle::execute_command(self, command).await
    }
}
