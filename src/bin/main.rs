//! compositor-probe - Talk to a compositor binary from the command line
//!
//! Usage:
//!   compositor-probe metadata <src>
//!   compositor-probe frame <src> --time <seconds> [--transparent]
//!   compositor-probe echo <message>
//!
//! Examples:
//!   compositor-probe metadata video.mp4
//!   compositor-probe --log-level verbose frame video.mp4 --time 1.5 --output frame.bmp
//!   compositor-probe --binary ./target/release/compositor echo hello

use clap::{Parser, Subcommand};
use compositor_bridge::config::LogLevel;
use compositor_bridge::compositor::protocol::ExtractFrameParams;
use compositor_bridge::{
    start_compositor, CompositorError, CompositorHandle, CompositorSettings, ErrorKind,
};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "compositor-probe")]
#[command(about = "Run single commands against a long-running compositor")]
#[command(version)]
struct Cli {
    /// Compositor binary (overrides config and COMPOSITOR_BINARY)
    #[arg(long, global = true)]
    binary: Option<PathBuf>,

    /// Worker log level: trace, verbose, info, warn, error
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Frame cache budget in bytes
    #[arg(long, global = true)]
    cache_bytes: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the metadata of a video as JSON
    Metadata {
        /// Path or URL of the video
        src: String,
    },

    /// Extract one frame
    Frame {
        /// Path of the video
        src: String,

        /// Timestamp in seconds
        #[arg(short, long)]
        time: f64,

        /// Keep the alpha channel
        #[arg(long)]
        transparent: bool,

        /// Write the frame here instead of printing its size
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Round-trip a message through the worker
    Echo {
        message: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match CompositorSettings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(binary) = &cli.binary {
        settings.binary_path = Some(binary.display().to_string());
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    if cli.cache_bytes.is_some() {
        settings.maximum_frame_cache_items_in_bytes = cli.cache_bytes;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(settings.log_level.tracing_level().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let compositor = match start_compositor(&settings).await {
        Ok(c) => c,
        Err(e) => return report(e),
    };

    let result = match cli.command {
        Commands::Metadata { src } => cmd_metadata(&compositor, src).await,
        Commands::Frame {
            src,
            time,
            transparent,
            output,
        } => cmd_frame(&compositor, src, time, transparent, output).await,
        Commands::Echo { message } => cmd_echo(&compositor, message).await,
    };

    if let Err(e) = compositor.shutdown().await {
        tracing::warn!(error = %e, "compositor did not shut down cleanly");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(e),
    }
}

fn report(err: CompositorError) -> ExitCode {
    eprintln!("{} [{}]", err, err.kind());
    if let Some(backtrace) = err.backtrace() {
        eprintln!("{}", backtrace);
    }
    ExitCode::FAILURE
}

async fn cmd_metadata(compositor: &CompositorHandle, src: String) -> Result<(), CompositorError> {
    let metadata = compositor.get_video_metadata(src).await?;
    let json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| CompositorError::protocol(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

async fn cmd_frame(
    compositor: &CompositorHandle,
    src: String,
    time: f64,
    transparent: bool,
    output: Option<PathBuf>,
) -> Result<(), CompositorError> {
    let frame = compositor
        .extract_frame(ExtractFrameParams {
            original_src: src.clone(),
            src,
            time,
            transparent,
            tone_mapped: false,
        })
        .await?;

    match output {
        Some(path) => {
            fs::write(&path, &frame).map_err(|e| {
                CompositorError::new(
                    ErrorKind::Unknown,
                    format!("failed to write '{}': {}", path.display(), e),
                )
            })?;
            println!("{} bytes written to {}", frame.len(), path.display());
        }
        None => println!("{} bytes", frame.len()),
    }
    Ok(())
}

async fn cmd_echo(compositor: &CompositorHandle, message: String) -> Result<(), CompositorError> {
    let reply = compositor.echo(message).await?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
