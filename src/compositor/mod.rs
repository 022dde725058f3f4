//! Compositor communication module.
//!
//! This module drives a long-running native compositor process that does all
//! media decoding. The orchestrator sends it structured commands and gets
//! back correlated, typed responses.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Orchestrator (Rust + Tokio)                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                 CompositorHandle (Async)                  │  │
//! │  │  - CommandChannel: nonce correlation, pending registry    │  │
//! │  │  - FrameCache: byte-budgeted LRU, hits skip the worker    │  │
//! │  │  - ErrorTranslator: native text -> ErrorKind              │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                   │
//! │          stdin (JSON lines)  │  stdout (length-prefixed frames) │
//! │                              ▼                                   │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │   Supervisor: spawn, crash detection, restart, shutdown   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             Compositor (Long-Running Child Process)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use compositor_bridge::compositor::start_compositor;
//! use compositor_bridge::config::CompositorSettings;
//!
//! let compositor = start_compositor(&CompositorSettings::default()).await?;
//! let metadata = compositor.get_video_metadata("./framer-24fps.mp4").await?;
//! assert_eq!(metadata.fps, 24.0);
//!
//! compositor.shutdown().await?;
//! ```

mod channel;
pub mod codec;
mod error;
mod handle;
pub mod protocol;
mod supervisor;
pub mod translate;

pub use channel::CommandChannel;
pub use error::{CompositorError, CompositorResult, ErrorKind};
pub use handle::{start_compositor, CommandExecutor, CompositorHandle};
pub use supervisor::{FrameReader, Supervisor, SupervisorState, WorkerConfig, WorkerWriter};
pub use translate::{translate_exit, ErrorTranslator, TranslationRule};
