//! Layout of the control area kept at every backup destination.
//!
//! ```text
//! <dest>/<control dir>/
//!     id                      identity token
//!     <basename>.ver          manifest for the source named <basename>
//!     mirror_log/             per-run mirror logs and exclude files
//!     mirror_dry_log/         same, for dry runs
//!     verify_log/             verification logs
//!     mirror_backup/          files moved aside by the mirror tool
//! ```

use std::io;
use std::path::{Path, PathBuf};

const ID_FILE: &str = "id";
const MANIFEST_EXT: &str = "ver";
const MIRROR_LOG_DIR: &str = "mirror_log";
const MIRROR_DRY_LOG_DIR: &str = "mirror_dry_log";
const VERIFY_LOG_DIR: &str = "verify_log";
const BACKUP_DIR: &str = "mirror_backup";

/// Paths of one source's control files at one destination.
#[derive(Debug, Clone)]
pub struct ControlArea {
    dir: PathBuf,
    basename: String,
}

impl ControlArea {
    pub fn new(dest: &Path, source: &Path, dir_name: &str) -> Self {
        Self {
            dir: dest.join(dir_name),
            basename: source_basename(source),
        }
    }

    /// The control directory itself.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn id_file(&self) -> PathBuf {
        self.dir.join(ID_FILE)
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.basename, MANIFEST_EXT))
    }

    pub fn mirror_log_dir(&self, dry: bool) -> PathBuf {
        self.dir.join(if dry { MIRROR_DRY_LOG_DIR } else { MIRROR_LOG_DIR })
    }

    pub fn verify_log_dir(&self) -> PathBuf {
        self.dir.join(VERIFY_LOG_DIR)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    /// `<dir>/<basename>_<timestamp>.<ext>`
    pub fn run_file(&self, dir: &Path, timestamp: &str, ext: &str) -> PathBuf {
        dir.join(format!("{}_{}.{}", self.basename, timestamp, ext))
    }

    /// Read the identity token, trimmed of surrounding whitespace.
    pub fn read_token(&self) -> io::Result<String> {
        Ok(std::fs::read_to_string(self.id_file())?.trim().to_string())
    }
}

/// Final path component of a source directory, the name it gets at the destination.
pub fn source_basename(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Normalize a user-supplied path: trailing separators and `.` components are dropped.
pub fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}
