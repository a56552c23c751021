//! Error types for herd.

use thiserror::Error;

/// Main error type for the supervisor.
#[derive(Error, Debug)]
pub enum HerdError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("No workers could be started (target {target}): {reason}")]
    NoCapacity { target: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Config file error: {0}")]
    ConfigFormat(#[from] toml::de::Error),

    #[error("Unknown signal name '{0}'")]
    UnknownSignal(String),

    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Supervisor event channel closed")]
    ChannelClosed,
}

/// Result type alias for herd operations.
pub type Result<T> = std::result::Result<T, HerdError>;
