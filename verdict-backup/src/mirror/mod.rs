//! Backup runs: drives the mirror tool and patches the manifest from its output.
//!
//! A run prepares the per-run log and exclude files under the destination's
//! control area, spawns the mirror tool, and streams its output line by line.
//! Each item line is classified and applied to the manifest, so the manifest
//! tracks deletions, hard links and new content without re-hashing anything.
//!
//! The size of the backup-aside folder is summed in-process by the walker
//! rather than by a second subprocess; the total is the same apparent size.

pub mod classify;

use crate::config::ToolsConfig;
use crate::fs::control::ControlArea;
use crate::fs::walker::calculate_total_size;
use crate::manifest::{Checksum, Verdict};
use crate::progress::{format_gigabytes, ProgressSink, ProgressTracker};
use crate::registry::target::Target;
use crate::{BackupError, Result};
use classify::{classify_line, LineKind, ITEM_FORMAT};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options for one backup run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Report what would change without touching the destination or the manifest
    pub dry: bool,
    /// Include paths matched by the target's optional patterns
    pub full: bool,
}

/// Files a run writes under the control area
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub log_dir: PathBuf,
    pub log_file: PathBuf,
    pub exclude_file: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_suffix: String,
}

impl RunPaths {
    pub fn new(area: &ControlArea, timestamp: &str, dry: bool) -> Self {
        let log_dir = area.mirror_log_dir(dry);
        Self {
            log_file: area.run_file(&log_dir, timestamp, "log"),
            exclude_file: area.run_file(&log_dir, timestamp, "exc"),
            backup_dir: area.backup_dir(),
            backup_suffix: format!(".backup_{}", timestamp),
            log_dir,
        }
    }
}

/// Manifest changes applied from one run's output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestChanges {
    pub deleted: usize,
    pub hard_linked: usize,
    pub updated: usize,
    /// Written paths the tool printed no checksum for; their entries were dropped.
    pub unhashed: Vec<String>,
}

/// Result of the mirror phase of a backup run
#[derive(Debug, Clone)]
pub struct MirrorOutcome {
    pub changes: ManifestChanges,
    pub status: ExitStatus,
    pub paths: RunPaths,
}

/// Apply a classified line to the manifest.
pub fn apply_line(verdict: &mut Verdict, kind: LineKind, changes: &mut ManifestChanges) {
    match kind {
        LineKind::Delete(path) => {
            verdict.remove(&path);
            changes.deleted += 1;
        }
        LineKind::HardLink(path) => {
            verdict.insert(path, Checksum::HardLink);
            changes.hard_linked += 1;
        }
        LineKind::Update { path, checksum } => {
            verdict.insert(path, Checksum::Digest(checksum));
            changes.updated += 1;
        }
        LineKind::Unhashed(path) => {
            warn!("No checksum reported for {}; dropping its manifest entry", path);
            verdict.remove(&path);
            changes.unhashed.push(path);
        }
        LineKind::Other => {}
    }
}

/// Argument list for the mirror tool.
pub fn build_args(
    tools: &ToolsConfig,
    target: &Target,
    paths: &RunPaths,
    dry: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if dry {
        args.push("-n".into());
    }
    // -a = -rlptgoD, plus verbose and human-readable output
    args.push("-avh".into());
    args.push("--delete".into());
    args.push("--hard-links".into());
    args.push("--stats".into());
    args.push(format!("--log-file={}", paths.log_file.display()).into());
    args.push(format!("--checksum-choice={}", tools.checksum_choice).into());
    args.push(format!("--out-format={}", ITEM_FORMAT).into());
    args.push("--backup".into());
    args.push(format!("--suffix={}", paths.backup_suffix).into());
    args.push(format!("--backup-dir={}", paths.backup_dir.display()).into());
    args.push(format!("--exclude-from={}", paths.exclude_file.display()).into());
    args.push(target.source_path.clone().into_os_string());
    args.push(target.dest_path.clone().into_os_string());
    args
}

/// Exclude file contents: the target's exclusions, plus optional ones unless `full`.
pub fn exclude_list(target: &Target, full: bool) -> String {
    let mut content = String::new();
    let optional: &[String] = if full { &[] } else { &target.optional_patterns };
    for pattern in target.exclude_patterns.iter().chain(optional) {
        content.push_str(pattern);
        content.push('\n');
    }
    content
}

/// Runs the mirror tool for one target
pub struct MirrorExecutor<'a> {
    tools: &'a ToolsConfig,
    control_dir: &'a str,
    progress: &'a dyn ProgressSink,
    cancel_token: CancellationToken,
}

impl<'a> MirrorExecutor<'a> {
    /// Create a new executor (no cancellation support)
    pub fn new(tools: &'a ToolsConfig, control_dir: &'a str, progress: &'a dyn ProgressSink) -> Self {
        Self::with_cancel(tools, control_dir, progress, CancellationToken::new())
    }

    /// Create a new executor with cancellation support
    pub fn with_cancel(
        tools: &'a ToolsConfig,
        control_dir: &'a str,
        progress: &'a dyn ProgressSink,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            tools,
            control_dir,
            progress,
            cancel_token,
        }
    }

    /// Prepare run files, run the mirror tool and patch `verdict` from its output.
    ///
    /// In dry mode the manifest is left untouched. A non-zero exit is returned
    /// in the outcome, not as an error, so the caller can still persist what
    /// was applied.
    pub async fn mirror(
        &self,
        target: &Target,
        verdict: &mut Verdict,
        timestamp: &str,
        options: RunOptions,
    ) -> Result<MirrorOutcome> {
        let area = target.control_area(self.control_dir);
        let paths = RunPaths::new(&area, timestamp, options.dry);

        std::fs::create_dir_all(&paths.log_dir)?;
        std::fs::create_dir_all(&paths.backup_dir)?;
        std::fs::write(&paths.exclude_file, exclude_list(target, options.full))?;

        if self.cancel_token.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let label = if options.dry {
            format!("Running dry backup {}", timestamp)
        } else {
            format!("Running backup {}", timestamp)
        };
        let tracker = ProgressTracker::start(self.progress, &label, 1);

        let args = build_args(self.tools, target, &paths, options.dry);
        info!("Starting {} for target {} ({:?})", self.tools.mirror, target.name, options);
        debug!("{} {:?}", self.tools.mirror, args);

        let mut child = Command::new(&self.tools.mirror)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| std::io::Error::other("mirror stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .map(BufReader::new)
            .ok_or_else(|| std::io::Error::other("mirror stderr not captured"))?;

        let mut changes = ManifestChanges::default();
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    warn!("Backup of {} cancelled, stopping {}", target.name, self.tools.mirror);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(BackupError::Cancelled);
                }
                line = next_line(&mut stdout, &mut out_buf), if out_open => match line? {
                    Some(line) => {
                        debug!("{}", line);
                        tracker.message(&line);
                        if !options.dry {
                            apply_line(verdict, classify_line(&line), &mut changes);
                        }
                    }
                    None => out_open = false,
                },
                line = next_line(&mut stderr, &mut err_buf), if err_open => match line? {
                    Some(line) => {
                        warn!("{}: {}", self.tools.mirror, line);
                        tracker.message(&line);
                    }
                    None => err_open = false,
                },
            }
        }

        let status = child.wait().await?;
        tracker.finish();

        if status.success() {
            info!(
                "Mirror finished for {}: {} updated, {} hard links, {} deleted",
                target.name, changes.updated, changes.hard_linked, changes.deleted
            );
        } else {
            warn!("{} exited with {} for target {}", self.tools.mirror, status, target.name);
        }

        Ok(MirrorOutcome {
            changes,
            status,
            paths,
        })
    }

    /// Total size of files moved aside by the mirror tool.
    pub async fn measure_backup_dir(&self, backup_dir: &Path) -> Result<u64> {
        let tracker = ProgressTracker::start(self.progress, "Obtaining size of backup folder", 1);
        let dir = backup_dir.to_path_buf();
        let size = tokio::task::spawn_blocking(move || calculate_total_size(&dir))
            .await
            .map_err(std::io::Error::other)??;
        tracker.message(&format!("Backup folder size: {}", format_gigabytes(size)));
        tracker.finish();
        Ok(size)
    }
}

/// Read one line into `buf`, returning it without the line terminator.
///
/// Partial reads stay in `buf` if the future is dropped, so this is safe to
/// use as a `select!` branch.
async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = match std::str::from_utf8(buf) {
        Ok(text) => text.trim_end_matches(['\n', '\r']).to_string(),
        Err(_) => {
            let text = String::from_utf8_lossy(buf).trim_end_matches(['\n', '\r']).to_string();
            warn!("Output line is not valid UTF-8, paths in it will not match: {}", text);
            text
        }
    };
    buf.clear();
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::target::TargetRecord;

    fn target() -> Target {
        Target::from_record(
            "photos",
            TargetRecord {
                source_path: PathBuf::from("/data/photos"),
                dest_path: PathBuf::from("/mnt/disk"),
                identity_token: "t".into(),
                last_backup_time: None,
                last_verify_time: None,
                backup_interval_days: None,
                verify_interval_days: None,
                exclude_patterns: vec!["*.tmp".into(), "cache/".into()],
                optional_patterns: vec!["videos/".into()],
            },
        )
    }

    fn digest(s: &str) -> Checksum {
        Checksum::Digest(s.to_string())
    }

    #[test]
    fn test_exclude_list() {
        let t = target();
        assert_eq!(exclude_list(&t, false), "*.tmp\ncache/\nvideos/\n");
        assert_eq!(exclude_list(&t, true), "*.tmp\ncache/\n");
    }

    #[test]
    fn test_build_args() {
        let t = target();
        let area = t.control_area(".verdict");
        let paths = RunPaths::new(&area, "2024-01-02_03:04:05", false);
        let args: Vec<String> = build_args(&ToolsConfig::default(), &t, &paths, false)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[0], "-avh");
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--hard-links".to_string()));
        assert!(args.contains(&"--checksum-choice=md5".to_string()));
        assert!(args.contains(&"--suffix=.backup_2024-01-02_03:04:05".to_string()));
        assert!(args.contains(&"--backup-dir=/mnt/disk/.verdict/mirror_backup".to_string()));
        assert!(args.contains(
            &"--exclude-from=/mnt/disk/.verdict/mirror_log/photos_2024-01-02_03:04:05.exc".to_string()
        ));
        assert_eq!(&args[args.len() - 2..], ["/data/photos", "/mnt/disk"]);

        let dry: Vec<String> = build_args(&ToolsConfig::default(), &t, &RunPaths::new(&area, "x", true), true)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(dry[0], "-n");
        assert!(dry.iter().any(|a| a.contains("mirror_dry_log")));
    }

    #[test]
    fn test_apply_lines() {
        let mut verdict = Verdict::new();
        verdict.insert("photos/old", digest("11111111111111111111111111111111"));
        verdict.insert("photos/keep", digest("22222222222222222222222222222222"));
        verdict.insert("photos/changed", digest("33333333333333333333333333333333"));

        let blank = " ".repeat(32);
        let output = [
            "sending incremental file list".to_string(),
            format!("*deleting   sum:{blank} photos/old"),
            ">f.st...... sum:44444444444444444444444444444444 photos/changed".to_string(),
            ">f+++++++++ sum:55555555555555555555555555555555 photos/new".to_string(),
            format!("hf+++++++++ sum:{blank} photos/new2 => photos/new"),
            format!(">f+++++++++ sum:{blank} photos/mystery"),
        ];

        let mut changes = ManifestChanges::default();
        for line in &output {
            apply_line(&mut verdict, classify_line(line), &mut changes);
        }

        assert_eq!(changes.deleted, 1);
        assert_eq!(changes.updated, 2);
        assert_eq!(changes.hard_linked, 1);
        assert_eq!(changes.unhashed, vec!["photos/mystery".to_string()]);

        let entries: Vec<(&str, &str)> = verdict.iter().map(|(p, c)| (p, c.as_str())).collect();
        assert_eq!(
            entries,
            vec![
                ("photos/keep", "22222222222222222222222222222222"),
                ("photos/changed", "44444444444444444444444444444444"),
                ("photos/new", "55555555555555555555555555555555"),
                ("photos/new2", "HL"),
            ]
        );
    }

    #[cfg(unix)]
    fn fake_mirror(dir: &Path, body: &str) -> std::io::Result<String> {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-rsync");
        std::fs::write(&script, format!("#!/bin/sh\n{}", body))?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        Ok(script.to_string_lossy().into_owned())
    }

    #[cfg(unix)]
    fn item_script() -> String {
        let blank = " ".repeat(32);
        format!(
            "echo 'rsync: vanished file warning' >&2\n\
             echo 'sending incremental file list'\n\
             echo '*deleting   sum:{blank} photos/old'\n\
             echo '>f+++++++++ sum:0cc175b9c0f1b6a831c399e269772661 photos/a'\n\
             echo 'hf+++++++++ sum:{blank} photos/b => photos/a'\n"
        )
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_mirror_streams_items_and_stderr() -> Result<()> {
        let root = tempfile::TempDir::new()?;
        let mut t = target();
        t.dest_path = root.path().join("disk");
        std::fs::create_dir_all(&t.dest_path)?;
        let tools = ToolsConfig {
            mirror: fake_mirror(root.path(), &item_script())?,
            ..ToolsConfig::default()
        };
        let (sink, mut rx) = crate::progress::ChannelProgress::channel();
        let executor = MirrorExecutor::new(&tools, ".verdict", &sink);

        let mut verdict = Verdict::new();
        verdict.insert("photos/old", digest("11111111111111111111111111111111"));
        let outcome = executor
            .mirror(&t, &mut verdict, "2024-01-02_03:04:05", RunOptions::default())
            .await?;

        assert!(outcome.status.success());
        assert_eq!(outcome.changes.deleted, 1);
        assert_eq!(outcome.changes.updated, 1);
        assert_eq!(outcome.changes.hard_linked, 1);
        let entries: Vec<(&str, &str)> = verdict.iter().map(|(p, c)| (p, c.as_str())).collect();
        assert_eq!(
            entries,
            vec![("photos/a", "0cc175b9c0f1b6a831c399e269772661"), ("photos/b", "HL")]
        );
        assert_eq!(std::fs::read_to_string(&outcome.paths.exclude_file)?, "*.tmp\ncache/\nvideos/\n");

        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::progress::ProgressEvent::Message(line) = event {
                messages.push(line);
            }
        }
        assert!(messages.iter().any(|m| m == "rsync: vanished file warning"));
        assert!(messages.iter().any(|m| m.starts_with(">f+++++++++")));
        Ok(())
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_dry_mirror_leaves_manifest_alone() -> Result<()> {
        let root = tempfile::TempDir::new()?;
        let mut t = target();
        t.dest_path = root.path().join("disk");
        std::fs::create_dir_all(&t.dest_path)?;
        let tools = ToolsConfig {
            mirror: fake_mirror(root.path(), &item_script())?,
            ..ToolsConfig::default()
        };
        let executor = MirrorExecutor::new(&tools, ".verdict", &crate::progress::NullProgress);

        let mut verdict = Verdict::new();
        verdict.insert("photos/old", digest("11111111111111111111111111111111"));
        let dry = RunOptions { dry: true, full: true };
        let outcome = executor.mirror(&t, &mut verdict, "2024-01-02_03:04:05", dry).await?;

        assert_eq!(outcome.changes, ManifestChanges::default());
        assert_eq!(verdict.len(), 1);
        assert!(outcome.paths.log_dir.ends_with("mirror_dry_log"));
        assert_eq!(std::fs::read_to_string(&outcome.paths.exclude_file)?, "*.tmp\ncache/\n");
        Ok(())
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_cancel_kills_running_mirror() -> Result<()> {
        let root = tempfile::TempDir::new()?;
        let mut t = target();
        t.dest_path = root.path().join("disk");
        std::fs::create_dir_all(&t.dest_path)?;
        let body = "echo '>f+++++++++ sum:0cc175b9c0f1b6a831c399e269772661 photos/a'\nexec sleep 30\n";
        let tools = ToolsConfig {
            mirror: fake_mirror(root.path(), body)?,
            ..ToolsConfig::default()
        };
        let cancel = CancellationToken::new();
        let executor = MirrorExecutor::with_cancel(&tools, ".verdict", &crate::progress::NullProgress, cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            cancel.cancel();
        });
        let mut verdict = Verdict::new();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            executor.mirror(&t, &mut verdict, "2024-01-02_03:04:05", RunOptions::default()),
        )
        .await
        .map_err(std::io::Error::other)?;
        trigger.await.map_err(std::io::Error::other)?;

        assert!(matches!(result, Err(BackupError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn test_next_line_handles_missing_newline_and_invalid_utf8() -> std::io::Result<()> {
        let data: &[u8] = b"first\r\nsecond \xff\nlast";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert_eq!(next_line(&mut reader, &mut buf).await?.as_deref(), Some("first"));
        assert_eq!(next_line(&mut reader, &mut buf).await?.as_deref(), Some("second \u{fffd}"));
        assert_eq!(next_line(&mut reader, &mut buf).await?.as_deref(), Some("last"));
        assert_eq!(next_line(&mut reader, &mut buf).await?, None);
        Ok(())
    }
}
