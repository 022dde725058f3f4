//! Configuration module for the compositor.
//!
//! Handles settings files, environment variables, and verbosity.

mod settings;

pub use settings::{
    expand_env_vars, CompositorSettings, LogLevel, SettingsError, BINARY_ENV_VAR, CONFIG_ENV_VAR,
};
