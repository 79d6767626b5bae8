//! Error types for earshot
//!
//! Uses thiserror for ergonomic error definitions. Every surfaced error
//! carries the entity id or operation it relates to, so failures can be
//! diagnosed without re-running with extra logging.

use crate::session::{SessionId, UserId};
use thiserror::Error;

/// Top-level error type for the earshot library
#[derive(Error, Debug)]
pub enum EarshotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Recording error: {0}")]
    Engine(#[from] EngineError),

    #[error("Recall error: {0}")]
    Recall(#[from] RecallError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the session store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Session store thread is gone")]
    Disconnected,

    #[error("No session with id {0}")]
    SessionNotFound(SessionId),

    #[error("Unknown leave reason in storage: '{0}'")]
    BadLeaveReason(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the recording engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to compress session payload: {0}")]
    Compress(#[source] std::io::Error),

    #[error("Split loop did not converge for user {0} (zero split threshold?)")]
    SplitLoop(UserId),

    #[error("Buffer map lock poisoned")]
    Lock,

    #[error("{failed} of {total} finalizes failed during cleanup")]
    CleanupIncomplete { failed: usize, total: usize },
}

/// Errors from the recall pipeline
#[derive(Error, Debug)]
pub enum RecallError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid lookback window: {0}")]
    InvalidWindow(String),

    #[error("No recorded audio for user {0} in the requested window")]
    NothingFound(UserId),

    #[error("Failed to decompress session {session}: {source}")]
    Decompress {
        session: SessionId,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Recording error during forced split: {0}")]
    Engine(#[from] EngineError),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Errors from the external transcoder
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("ffmpeg not found. Install ffmpeg or set recall.ffmpeg_path in config.")]
    FfmpegNotFound,

    #[error("Configured ffmpeg path not found: {0}")]
    ConfiguredPathMissing(String),

    #[error("Transcoder was given no input segments")]
    NoInput,

    #[error("ffmpeg exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from lookback shorthand parsing
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WindowError {
    #[error("Empty lookback string")]
    Empty,

    #[error("No unit of time in '{0}'. Use e.g. 30s, 5m, 1h30m, 2d, 1w.")]
    NoUnit(String),

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Invalid number '{0}'")]
    BadNumber(String),

    #[error("Lookback resolves to zero duration")]
    Zero,
}

impl From<WindowError> for RecallError {
    fn from(e: WindowError) -> Self {
        RecallError::InvalidWindow(e.to_string())
    }
}

/// Result type alias using EarshotError
pub type Result<T> = std::result::Result<T, EarshotError>;
