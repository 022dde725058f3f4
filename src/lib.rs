//! # Compositor Bridge
//!
//! Communication and caching layer between an orchestrating process and a
//! long-running native media worker ("the compositor").
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ execute_command(Command)
//!   ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  FrameCache ◀── hit? ── CommandChannel                  │
//! │                          │ nonce + pending registry     │
//! │                          ▼                              │
//! │                 codec::encode (JSON line)               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼ [Supervisor: stdin]
//! ┌─────────────────────────────────────────────────────────┐
//! │                  compositor process                      │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼ [Supervisor: stdout]
//! ┌─────────────────────────────────────────────────────────┐
//! │  FrameDecoder ──▶ resolve pending call by nonce          │
//! │        failure ──▶ ErrorTranslator ──▶ ErrorKind         │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod compositor;
pub mod config;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::cache::{CacheKey, FrameCache};
    pub use crate::compositor::protocol::{
        Command, CommandType, ExtractFrameParams, GetSilencesParams, OpenVideoStats,
        SilencesResult, VideoMetadata,
    };
    pub use crate::compositor::{
        start_compositor, CommandExecutor, CompositorError, CompositorHandle, CompositorResult,
        ErrorKind, SupervisorState,
    };
    pub use crate::config::{CompositorSettings, LogLevel};
}

pub use compositor::{start_compositor, CompositorError, CompositorHandle, ErrorKind};
pub use config::CompositorSettings;
