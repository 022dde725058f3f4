//! Typed commands and results exchanged with the compositor worker.
//!
//! Every command is one variant of [`Command`], carrying its own parameter
//! struct. On the wire a command is serialized as
//! `{"type": "<CommandType>", "params": {...}}` inside a request envelope.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{CompositorError, CompositorResult};
use crate::cache::{fingerprint, CacheKey};

// ============================================================================
// Request Envelope
// ============================================================================

/// Request envelope written to the worker's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope<'a, P: Serialize> {
    /// Correlation token echoed back in the response frame.
    pub nonce: &'a str,
    /// The tagged command.
    pub payload: &'a P,
}

/// A command type the [`Command`] enum does not model yet.
#[derive(Debug, Clone, Serialize)]
pub struct RawCommand {
    #[serde(rename = "type")]
    pub command_type: String,
    pub params: serde_json::Value,
}

/// Error payload carried by a failure frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default)]
    pub backtrace: String,
}

// ============================================================================
// Commands
// ============================================================================

/// A command understood by the compositor worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Command {
    Echo(EchoParams),
    GetVideoMetadata(GetVideoMetadataParams),
    ExtractFrame(ExtractFrameParams),
    GetSilences(GetSilencesParams),
    ExtractAudio(ExtractAudioParams),
    FreeUpMemory(FreeUpMemoryParams),
    CloseAllVideos {},
    GetOpenVideoStats {},
}

/// Discriminant of [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandType {
    Echo,
    GetVideoMetadata,
    ExtractFrame,
    GetSilences,
    ExtractAudio,
    FreeUpMemory,
    CloseAllVideos,
    GetOpenVideoStats,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Echo => "Echo",
            Self::GetVideoMetadata => "GetVideoMetadata",
            Self::ExtractFrame => "ExtractFrame",
            Self::GetSilences => "GetSilences",
            Self::ExtractAudio => "ExtractAudio",
            Self::FreeUpMemory => "FreeUpMemory",
            Self::CloseAllVideos => "CloseAllVideos",
            Self::GetOpenVideoStats => "GetOpenVideoStats",
        }
    }

    /// Parse a wire name back into a command type.
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "Echo" => Self::Echo,
            "GetVideoMetadata" => Self::GetVideoMetadata,
            "ExtractFrame" => Self::ExtractFrame,
            "GetSilences" => Self::GetSilences,
            "ExtractAudio" => Self::ExtractAudio,
            "FreeUpMemory" => Self::FreeUpMemory,
            "CloseAllVideos" => Self::CloseAllVideos,
            "GetOpenVideoStats" => Self::GetOpenVideoStats,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Command {
    /// Build a typed command from its wire name and untyped parameters.
    ///
    /// Missing (`null`) parameters are read as an empty object.
    pub fn from_parts(
        command_type: CommandType,
        params: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let params = match params {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            params => params,
        };
        serde_json::from_value(serde_json::json!({
            "type": command_type.as_str(),
            "params": params,
        }))
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Echo(_) => CommandType::Echo,
            Self::GetVideoMetadata(_) => CommandType::GetVideoMetadata,
            Self::ExtractFrame(_) => CommandType::ExtractFrame,
            Self::GetSilences(_) => CommandType::GetSilences,
            Self::ExtractAudio(_) => CommandType::ExtractAudio,
            Self::FreeUpMemory(_) => CommandType::FreeUpMemory,
            Self::CloseAllVideos {} => CommandType::CloseAllVideos,
            Self::GetOpenVideoStats {} => CommandType::GetOpenVideoStats,
        }
    }

    /// Key under which the result of this command may be cached.
    ///
    /// Returns `None` for commands with side effects or volatile results.
    pub fn cache_key(&self) -> Option<CacheKey> {
        match self {
            Self::GetVideoMetadata(params) => Some(CacheKey::new(
                params.src.clone(),
                None,
                CommandType::GetVideoMetadata,
                String::new(),
            )),
            Self::ExtractFrame(params) => {
                let params_hash = fingerprint(&(
                    &params.original_src,
                    params.transparent,
                    params.tone_mapped,
                ))
                .ok()?;
                Some(CacheKey::new(
                    params.src.clone(),
                    Some(seconds_to_micros(params.time)),
                    CommandType::ExtractFrame,
                    params_hash,
                ))
            }
            _ => None,
        }
    }

    /// Validate the success payload against this command's result shape.
    pub fn check_result(&self, payload: &Bytes) -> CompositorResult<()> {
        match self {
            Self::GetVideoMetadata(_) => decode_json::<VideoMetadata>(payload).map(|_| ()),
            Self::GetSilences(_) => decode_json::<SilencesResult>(payload).map(|_| ()),
            Self::GetOpenVideoStats {} => decode_json::<OpenVideoStats>(payload).map(|_| ()),
            Self::ExtractFrame(_) if payload.is_empty() => Err(CompositorError::protocol(
                "ExtractFrame returned an empty frame",
            )),
            _ => Ok(()),
        }
    }
}

fn seconds_to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}

/// Decode a JSON result payload.
///
/// An empty or unparsable payload is a protocol violation.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> CompositorResult<T> {
    if payload.is_empty() {
        return Err(CompositorError::protocol("empty payload where JSON was expected"));
    }
    serde_json::from_slice(payload)
        .map_err(|e| CompositorError::protocol(format!("failed to decode result: {e}")))
}

// ============================================================================
// Command Parameters
// ============================================================================

/// Parameters for `Echo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoParams {
    pub message: String,
}

/// Parameters for `GetVideoMetadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetVideoMetadataParams {
    /// Path of the source file.
    pub src: String,
}

/// Parameters for `ExtractFrame`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractFrameParams {
    /// Local path the worker reads from.
    pub src: String,
    /// Source as the caller referenced it (URL or path).
    pub original_src: String,
    /// Timestamp in seconds.
    pub time: f64,
    pub transparent: bool,
    pub tone_mapped: bool,
}

/// Parameters for `GetSilences`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSilencesParams {
    pub src: String,
    pub noise_threshold_in_decibels: f64,
    pub minimum_duration_in_seconds: f64,
}

/// Parameters for `ExtractAudio`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractAudioParams {
    pub input_path: String,
    pub output_path: String,
}

/// Parameters for `FreeUpMemory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeUpMemoryParams {
    /// Bytes of frame cache the worker may keep.
    pub remaining_bytes: u64,
}

/// Parameters of the startup command passed on the worker's command line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartLongRunningProcessParams {
    pub concurrency: usize,
    pub maximum_frame_cache_size_in_bytes: Option<u64>,
    pub verbose: bool,
}

/// Startup command; only ever sent as a process argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "params")]
pub enum StartupCommand {
    StartLongRunningProcess(StartLongRunningProcessParams),
}

// ============================================================================
// Results
// ============================================================================

/// Result of `GetVideoMetadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub duration_in_seconds: Option<f64>,
    /// Video codec identifier (`h264`, `h265`, `vp8`, `vp9`, `av1`, `prores`, ...).
    pub codec: String,
    pub can_play_in_video_tag: bool,
    pub supports_seeking: bool,
    pub color_space: String,
    pub audio_codec: Option<String>,
    pub audio_file_extension: Option<String>,
    pub pixel_format: Option<String>,
}

impl VideoMetadata {
    /// Whether the source carries an audio stream.
    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

/// A silent range within a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SilentPart {
    pub start_in_seconds: f64,
    pub end_in_seconds: f64,
}

/// Result of `GetSilences`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SilencesResult {
    pub silent_parts: Vec<SilentPart>,
    pub duration_in_seconds: f64,
}

/// Result of `GetOpenVideoStats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenVideoStats {
    pub open_videos: u64,
    pub open_streams: u64,
    pub frames_in_cache: u64,
}
