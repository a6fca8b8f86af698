//! Error taxonomy for the driver

use std::io;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by the driver and its collaborators
#[derive(Debug, Error)]
pub enum DriverError {
    /// The child process could not be launched. The caller may retry.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Writing to the child's input failed even after the automatic restart.
    #[error("child input is closed: {0}")]
    BrokenPipe(#[source] io::Error),

    /// The caller interrupted an in-flight submit; the driver was shut down.
    #[error("interrupted while submitting command")]
    Interrupted,

    /// The command could not be framed without desynchronising the protocol.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// An operation needed a live process and there was none.
    #[error("no process is running")]
    NotRunning,

    /// A previous fatal error stopped the run loop.
    #[error("driver halted: {0}")]
    Halted(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session file: {0}")]
    Session(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl DriverError {
    /// Whether this error ends the run loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BrokenPipe(_) | Self::Interrupted | Self::Malformed(_) | Self::Halted(_)
        )
    }
}
