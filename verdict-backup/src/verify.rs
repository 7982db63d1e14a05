//! Backup verification: recompute every stored checksum and compare.
//!
//! Mismatches are reported and logged to `verify_log/<basename>_<timestamp>.log`
//! at the destination. The manifest is never modified here.

use crate::manifest::checksum::ChecksumTool;
use crate::manifest::Verdict;
use crate::progress::{format_duration, ProgressSink, ProgressTracker};
use crate::registry::target::Target;
use crate::{BackupError, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path: String,
    pub expected: String,
    /// `None` when the file could not be hashed (missing or unreadable).
    pub actual: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub checked: usize,
    pub skipped_hard_links: usize,
    pub mismatches: Vec<Mismatch>,
    pub log_file: PathBuf,
    pub elapsed: Duration,
}

impl VerifyReport {
    pub fn success(&self) -> bool {
        self.mismatches.is_empty()
    }
}

pub struct Verifier<'a> {
    checksum: &'a ChecksumTool,
    control_dir: &'a str,
    progress: &'a dyn ProgressSink,
    cancel_token: CancellationToken,
}

impl<'a> Verifier<'a> {
    pub fn new(
        checksum: &'a ChecksumTool,
        control_dir: &'a str,
        progress: &'a dyn ProgressSink,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            checksum,
            control_dir,
            progress,
            cancel_token,
        }
    }

    pub async fn verify(&self, target: &Target, verdict: &Verdict, timestamp: &str) -> Result<VerifyReport> {
        let start_time = Instant::now();
        let area = target.control_area(self.control_dir);
        let log_dir = area.verify_log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let log_file = area.run_file(&log_dir, timestamp, "log");
        let mut log = BufWriter::new(File::create(&log_file)?);

        let mut report = VerifyReport {
            checked: 0,
            skipped_hard_links: 0,
            mismatches: Vec::new(),
            log_file: log_file.clone(),
            elapsed: Duration::ZERO,
        };

        let label = format!("Verifying backup {}", timestamp);
        let mut tracker = ProgressTracker::start(self.progress, &label, verdict.len() as u64);
        for (path, checksum) in verdict.iter() {
            if self.cancel_token.is_cancelled() {
                log.flush()?;
                return Err(BackupError::Cancelled);
            }
            tracker.inc();
            if checksum.is_hard_link() {
                report.skipped_hard_links += 1;
                continue;
            }

            report.checked += 1;
            let actual = match self.checksum.digest(&target.dest_path.join(path)).await {
                Ok(digest) => Some(digest),
                Err(BackupError::ChecksumFailed { reason, .. }) => {
                    warn!("Could not hash {}: {}", path, reason);
                    None
                }
                Err(e) => return Err(e),
            };

            if actual.as_deref() != Some(checksum.as_str()) {
                let got = actual.as_deref().unwrap_or("<unreadable>");
                tracker.message(&format!("Invalid checksum: {}", path));
                warn!("Invalid checksum: {}, expected: {}, got: {}", path, checksum, got);
                writeln!(log, "Invalid checksum: {}, expected: {}, got: {}", path, checksum, got)?;
                report.mismatches.push(Mismatch {
                    path: path.to_string(),
                    expected: checksum.to_string(),
                    actual,
                });
            }
        }

        report.elapsed = start_time.elapsed();
        writeln!(log, "Verification took {:.1} seconds.", report.elapsed.as_secs_f64())?;
        log.flush()?;
        tracker.finish();

        info!(
            "Verified {} of target {} in {}: {} mismatch(es)",
            report.checked,
            target.name,
            format_duration(report.elapsed),
            report.mismatches.len()
        );
        Ok(report)
    }
}
