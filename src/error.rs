//! Error types for the playback engine.
//!
//! Each concern gets its own enum so callers can decide locally whether a
//! failure is a skip, a retry, a pause or fatal. The binary edge (`main`,
//! process glue) folds everything into `anyhow`.

use std::path::PathBuf;

use thiserror::Error;

/// A playlist line that looks like a command but cannot be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    /// 1-based line number in the playlist text.
    pub line: usize,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// The state file exists but does not hold `index\nelapsed`.
    #[error("corrupt playback state in {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("playback state I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("media file not found: {0}")]
    NotFound(PathBuf),

    #[error("duration probe failed for {path}: {reason}")]
    Probe { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Errors that terminate the playback controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A playable entry stayed missing after every retry and the config asks
    /// to abort rather than skip.
    #[error("media file not found after retries: {0}")]
    MissingMedia(PathBuf),

    #[error("stream process failure: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("playlist has no entries")]
    EmptyPlaylist,
}
