//! External checksum tool wrapper (`md5sum`-compatible output).

use crate::{BackupError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ChecksumTool {
    program: String,
}

impl ChecksumTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Hex digest of the file at `path`.
    pub async fn digest(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(BackupError::ChecksumFailed {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_digest(&stdout).ok_or_else(|| BackupError::ChecksumFailed {
            path: path.to_path_buf(),
            reason: format!("unexpected output: {:?}", stdout.trim()),
        })
    }
}

/// First token of a `<hex>  <file>` line. A leading backslash marks an
/// escaped file name and is not part of the digest.
fn parse_digest(output: &str) -> Option<String> {
    let token = output.split_whitespace().next()?;
    let token = token.strip_prefix('\\').unwrap_or(token);
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(token.to_ascii_lowercase())
}
