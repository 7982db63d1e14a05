//! Error taxonomy for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Registry corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("Target {0} is not defined")]
    UnknownTarget(String),

    #[error("Target {0} already defined")]
    DuplicateTarget(String),

    #[error("Conflicting destination with target {0}")]
    ConflictingDestination(String),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Backup destination corrupt: {}", .0.display())]
    DestinationCorrupt(PathBuf),

    #[error("Target is not connected: {}", .0.display())]
    TargetNotConnected(PathBuf),

    #[error("Manifest not loaded for target {0}")]
    ManifestNotLoaded(String),

    #[error("Malformed manifest line {line} in {}: {content:?}", .path.display())]
    ManifestParseError {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("Mirror process exited with {}", .code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    MirrorProcessFailed { code: Option<i32> },

    #[error("Checksum tool failed for {}: {reason}", .path.display())]
    ChecksumFailed { path: PathBuf, reason: String },

    #[error("Target {0} is busy with another operation")]
    TargetBusy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Engine configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
