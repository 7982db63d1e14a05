//! Consistency check between a manifest and the destination tree.
//!
//! Three passes: manifest entries whose file is gone, a walk of the
//! destination copy of the source, and destination files with no manifest
//! entry. With `repair`, missing files are dropped from the manifest and
//! missing checksums are filled in from the corresponding source file.
//! Destination files are never modified.

use crate::fs::control::source_basename;
use crate::fs::walker::collect_files;
use crate::manifest::checksum::ChecksumTool;
use crate::manifest::{Checksum, Verdict};
use crate::progress::{format_duration, ProgressSink, ProgressTracker};
use crate::registry::target::Target;
use crate::{BackupError, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Findings of one consistency check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Manifest entries whose destination file does not exist
    pub missing_files: Vec<String>,
    /// Destination files without a manifest entry
    pub missing_checksums: Vec<String>,
    /// Entries removed from the manifest (repair only)
    pub removed: usize,
    /// Entries added from the source tree (repair only)
    pub added: Vec<String>,
    /// Missing checksums that could not be filled because the source file is gone
    pub unresolved: Vec<String>,
    pub repaired: bool,
    pub elapsed: Duration,
}

impl CheckReport {
    /// True when neither pass found a discrepancy.
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty() && self.missing_checksums.is_empty()
    }
}

pub struct ConsistencyChecker<'a> {
    checksum: &'a ChecksumTool,
    progress: &'a dyn ProgressSink,
    cancel_token: CancellationToken,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(checksum: &'a ChecksumTool, progress: &'a dyn ProgressSink, cancel_token: CancellationToken) -> Self {
        Self {
            checksum,
            progress,
            cancel_token,
        }
    }

    pub async fn check(&self, target: &Target, verdict: &mut Verdict, repair: bool) -> Result<CheckReport> {
        let start_time = Instant::now();
        let mut report = CheckReport {
            repaired: repair,
            ..Default::default()
        };

        // Pass 1: manifest entries without a file
        let mut tracker = ProgressTracker::start(self.progress, "Scanning for missing files", verdict.len() as u64);
        for (path, _) in verdict.iter() {
            self.ensure_running()?;
            tracker.inc();
            if !target.dest_path.join(path).exists() {
                tracker.message(&format!("  File not found: {}", path));
                warn!("File not found: {}", path);
                report.missing_files.push(path.to_string());
            }
        }
        tracker.finish();

        if repair {
            let mut tracker =
                ProgressTracker::start(self.progress, "Removing missing files", report.missing_files.len() as u64);
            for path in &report.missing_files {
                self.ensure_running()?;
                tracker.inc();
                if verdict.remove(path).is_some() {
                    report.removed += 1;
                }
            }
            tracker.finish();
        }

        // Pass 2: regular files of the destination copy
        let tracker = ProgressTracker::start(self.progress, "Scanning destination directory", 1);
        let root = target.dest_path.join(source_basename(&target.source_path));
        let base = target.dest_path.clone();
        let files = tokio::task::spawn_blocking(move || collect_files(&root, &base))
            .await
            .map_err(std::io::Error::other)??;
        tracker.finish();

        // Pass 3: files without a checksum
        let source_parent = target
            .source_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| target.source_path.clone());
        let mut tracker =
            ProgressTracker::start(self.progress, "Scanning for missing checksums", files.len() as u64);
        for file in &files {
            self.ensure_running()?;
            tracker.inc();
            let relative = &file.relative_path;
            if verdict.contains(relative) {
                continue;
            }
            tracker.message(&format!("  Checksum not found: {}", relative));
            warn!("Checksum not found: {}", relative);
            report.missing_checksums.push(relative.clone());

            if repair {
                let source_file = source_parent.join(relative);
                if source_file.is_file() {
                    match self.checksum.digest(&source_file).await {
                        Ok(digest) => {
                            verdict.insert(relative.clone(), Checksum::Digest(digest));
                            report.added.push(relative.clone());
                        }
                        Err(BackupError::ChecksumFailed { reason, .. }) => {
                            tracker.message(&format!("  WARNING: could not hash source of {}", relative));
                            warn!("Could not hash source of {}: {}", relative, reason);
                            report.unresolved.push(relative.clone());
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    tracker.message(&format!("  WARNING: {} not found in source directory", relative));
                    warn!("{} not found in source directory", relative);
                    report.unresolved.push(relative.clone());
                }
            }
        }
        tracker.finish();

        report.elapsed = start_time.elapsed();
        self.progress
            .message(&format!("-- The operation took {}.", format_duration(report.elapsed)));
        info!(
            "Check of {} done in {}: {} missing files, {} missing checksums",
            target.name,
            format_duration(report.elapsed),
            report.missing_files.len(),
            report.missing_checksums.len()
        );
        Ok(report)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }
}
