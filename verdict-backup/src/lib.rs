//! Verdict Backup Library
//!
//! Verified incremental directory backups. A mirror tool (rsync) copies each
//! target's source into its destination while the engine keeps a per-target
//! manifest of checksums up to date from the tool's output; verification
//! recomputes those checksums with an external checksum tool (md5sum).

pub mod check;
pub mod config;
pub mod connection;
pub mod engine;
pub mod fs;
pub mod manifest;
pub mod mirror;
pub mod progress;
pub mod registry;
pub mod shutdown;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{BackupReport, Engine, TargetSummary};
pub use mirror::RunOptions;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
