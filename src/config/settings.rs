//! TOML-based configuration for a compositor instance.
//!
//! Supports a config file (compositor.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! binary_path = "${COMPOSITOR_HOME}/bin/compositor"
//! maximum_frame_cache_items_in_bytes = 536870912
//! log_level = "verbose"
//! indent = false
//! concurrency = 4
//! command_timeout_ms = 30000
//! shutdown_timeout_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable that points at the compositor binary.
pub const BINARY_ENV_VAR: &str = "COMPOSITOR_BINARY";

/// Environment variable that points at a config file.
pub const CONFIG_ENV_VAR: &str = "COMPOSITOR_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Compositor binary not found. Set binary_path in config or {BINARY_ENV_VAR}")]
    BinaryNotFound,

    #[error("Unknown log level: {0}")]
    UnknownLogLevel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Verbosity of the compositor and of the diagnostics it forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Verbose,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Whether the worker should be started in verbose mode.
    pub fn is_verbose(&self) -> bool {
        *self <= LogLevel::Verbose
    }

    /// The `tracing` level used for worker diagnostics at this verbosity.
    pub fn tracing_level(&self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Verbose => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Verbose => "verbose",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "verbose" | "debug" => Ok(Self::Verbose),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(SettingsError::UnknownLogLevel(s.to_string())),
        }
    }
}

/// Configuration of one compositor instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompositorSettings {
    /// Path to the compositor binary (supports ${ENV_VAR} expansion).
    pub binary_path: Option<String>,

    /// Frame cache budget in bytes. `None` disables eviction.
    pub maximum_frame_cache_items_in_bytes: Option<u64>,

    /// Verbosity.
    pub log_level: LogLevel,

    /// Indent forwarded worker diagnostics.
    pub indent: bool,

    /// Number of threads the worker may use.
    pub concurrency: usize,

    /// Default per-command timeout. `None` waits indefinitely.
    pub command_timeout_ms: Option<u64>,

    /// How long shutdown waits for the worker before killing it.
    pub shutdown_timeout_ms: u64,

    /// Extra arguments placed before the startup command.
    pub extra_args: Vec<String>,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            binary_path: None,
            maximum_frame_cache_items_in_bytes: None,
            log_level: LogLevel::Info,
            indent: false,
            concurrency: 1,
            command_timeout_ms: None,
            shutdown_timeout_ms: 5_000,
            extra_args: Vec::new(),
        }
    }
}

impl CompositorSettings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: CompositorSettings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `COMPOSITOR_CONFIG`
    /// 2. `./compositor.toml`
    /// 3. `~/.config/compositor/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("compositor.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("compositor").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(CompositorSettings::default())
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.concurrency == 0 {
            return Err(SettingsError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(SettingsError::InvalidConfig(
                "shutdown_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Resolve the compositor binary.
    ///
    /// Uses the configured path, then `COMPOSITOR_BINARY`, then common
    /// locations, then `PATH`.
    pub fn resolve_binary(&self) -> Result<PathBuf, SettingsError> {
        if let Some(path) = &self.binary_path {
            return Ok(PathBuf::from(expand_env_vars(path)?));
        }

        if let Ok(path) = env::var(BINARY_ENV_VAR) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let candidates = ["./compositor", "./bin/compositor", "./target/release/compositor"];
        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(output) = std::process::Command::new("which")
            .arg("compositor")
            .output()
        {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }

        Err(SettingsError::BinaryNotFound)
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            // $VAR ends at the first non-alphanumeric/underscore character.
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
