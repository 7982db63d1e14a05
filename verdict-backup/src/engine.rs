//! Engine: the command surface used by the CLI and any other front end.
//!
//! Owns the registry behind a mutex, so registry writes are serialized. Each
//! operation checks the target's manifest out of the registry for its whole
//! duration; a second operation on the same target fails with `TargetBusy`,
//! while operations on different targets run independently.

use crate::check::{CheckReport, ConsistencyChecker};
use crate::config::EngineConfig;
use crate::connection::{self, ConnectionState};
use crate::manifest::checksum::ChecksumTool;
use crate::manifest::Verdict;
use crate::mirror::{ManifestChanges, MirrorExecutor, RunOptions};
use crate::progress::{format_gigabytes, ProgressSink};
use crate::registry::target::{format_timestamp, now, ManifestSlot, Target};
use crate::registry::Registry;
use crate::verify::{Verifier, VerifyReport};
use crate::{BackupError, Result};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Read-only view of a target for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSummary {
    pub name: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub connected: bool,
    pub busy: bool,
    pub last_backup_time: Option<NaiveDateTime>,
    pub last_verify_time: Option<NaiveDateTime>,
    /// Days since the last backup, if past the configured interval
    pub backup_overdue_days: Option<i64>,
    /// Days since the last verification, if past the configured interval
    pub verify_overdue_days: Option<i64>,
}

impl TargetSummary {
    fn new(target: &Target, now: NaiveDateTime) -> Self {
        Self {
            name: target.name.clone(),
            source_path: target.source_path.clone(),
            dest_path: target.dest_path.clone(),
            connected: target.is_connected(),
            busy: target.is_busy(),
            last_backup_time: target.last_backup_time,
            last_verify_time: target.last_verify_time,
            backup_overdue_days: target.backup_overdue(now),
            verify_overdue_days: target.verify_overdue(now),
        }
    }
}

/// Outcome of a backup run
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub timestamp: NaiveDateTime,
    pub options: RunOptions,
    pub changes: ManifestChanges,
    pub exit_code: Option<i32>,
    pub log_file: PathBuf,
    /// Total size of files moved aside into the backup folder
    pub backup_dir_bytes: u64,
    pub elapsed: Duration,
}

/// What to write back when an operation returns its manifest.
#[derive(Debug, Default)]
struct Checkin {
    save_manifest: bool,
    last_backup_time: Option<NaiveDateTime>,
    last_verify_time: Option<NaiveDateTime>,
}

pub struct Engine {
    config: EngineConfig,
    registry: Mutex<Registry>,
    checksum: ChecksumTool,
}

impl Engine {
    /// Open the registry named in `config`.
    ///
    /// An unreadable registry does not stop the engine: the file is copied to
    /// `<file>.corrupt`, a warning is logged, and the engine starts empty.
    pub fn open(config: EngineConfig) -> Self {
        let registry = match Registry::load(&config.registry.path, &config.control.dir_name) {
            Ok(registry) => registry,
            Err(e) => {
                warn!("Could not load registry: {}", e);
                preserve_corrupt_registry(&config.registry.path);
                Registry::empty(&config.registry.path, &config.control.dir_name)
            }
        };
        Self::with_registry(config, registry)
    }

    /// Open the registry, failing on any load error.
    pub fn try_open(config: EngineConfig) -> Result<Self> {
        let registry = Registry::load(&config.registry.path, &config.control.dir_name)?;
        Ok(Self::with_registry(config, registry))
    }

    fn with_registry(config: EngineConfig, registry: Registry) -> Self {
        let checksum = ChecksumTool::new(config.tools.checksum.clone());
        Self {
            config,
            registry: Mutex::new(registry),
            checksum,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn control_dir(&self) -> &str {
        &self.config.control.dir_name
    }

    pub async fn list_targets(&self) -> Vec<TargetSummary> {
        let registry = self.registry.lock().await;
        let now = now();
        registry.targets().map(|t| TargetSummary::new(t, now)).collect()
    }

    pub async fn target(&self, name: &str) -> Option<TargetSummary> {
        let registry = self.registry.lock().await;
        registry.get(name).map(|t| TargetSummary::new(t, now()))
    }

    /// Names of registry entries that failed validation and are ignored.
    pub async fn skipped_targets(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        registry.skipped().map(str::to_string).collect()
    }

    pub async fn add_target(&self, name: &str, source: &Path, dest: &Path) -> Result<TargetSummary> {
        let mut registry = self.registry.lock().await;
        let target = registry.add_target(name, source, dest)?;
        Ok(TargetSummary::new(target, now()))
    }

    pub async fn remove_target(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.get(name).is_some_and(Target::is_busy) {
            return Err(BackupError::TargetBusy(name.to_string()));
        }
        registry.remove_target(name)
    }

    /// Re-check every destination; returns one entry per connect/disconnect.
    pub async fn refresh_connections(&self) -> Vec<(String, ConnectionState)> {
        let mut registry = self.registry.lock().await;
        registry.refresh_connections()
    }

    /// Cross-check the manifest against the destination tree.
    pub async fn check_target(
        &self,
        name: &str,
        repair: bool,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<CheckReport> {
        let (target, mut verdict) = self.checkout(name).await?;
        let checker = ConsistencyChecker::new(&self.checksum, progress, cancel);
        let result = checker.check(&target, &mut verdict, repair).await;

        let checkin = Checkin {
            save_manifest: repair && result.is_ok(),
            ..Default::default()
        };
        self.checkin(name, verdict, checkin).await?;
        result
    }

    /// Recompute every checksum of the manifest and compare.
    pub async fn verify_target(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<VerifyReport> {
        let (target, verdict) = self.checkout(name).await?;
        let timestamp = now();
        let verifier = Verifier::new(&self.checksum, self.control_dir(), progress, cancel);
        let result = verifier.verify(&target, &verdict, &format_timestamp(&timestamp)).await;

        let checkin = Checkin {
            last_verify_time: result.is_ok().then_some(timestamp),
            ..Default::default()
        };
        self.checkin(name, verdict, checkin).await?;
        result
    }

    /// Run the mirror tool for a target and update its manifest.
    ///
    /// A non-zero mirror exit still persists the manifest changes applied from
    /// the output seen so far, then fails with `MirrorProcessFailed`.
    /// Cancellation persists nothing.
    pub async fn run_backup(
        &self,
        name: &str,
        options: RunOptions,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<BackupReport> {
        let start_time = Instant::now();
        let (target, mut verdict) = self.checkout(name).await?;
        let timestamp = now();
        let label = format_timestamp(&timestamp);

        let executor = MirrorExecutor::with_cancel(&self.config.tools, self.control_dir(), progress, cancel);
        let outcome = match executor.mirror(&target, &mut verdict, &label, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let checkin = Checkin {
                    save_manifest: !options.dry && !matches!(e, BackupError::Cancelled),
                    ..Default::default()
                };
                self.checkin(name, verdict, checkin).await?;
                return Err(e);
            }
        };

        let success = outcome.status.success();
        let checkin = Checkin {
            save_manifest: !options.dry,
            last_backup_time: (!options.dry && success).then_some(timestamp),
            ..Default::default()
        };
        self.checkin(name, verdict, checkin).await?;

        let backup_dir_bytes = match executor.measure_backup_dir(&outcome.paths.backup_dir).await {
            Ok(size) => size,
            Err(e) if !success => {
                warn!("Could not measure backup folder: {}", e);
                0
            }
            Err(e) => return Err(e),
        };
        info!("Backup folder size: {}", format_gigabytes(backup_dir_bytes));

        if !success {
            return Err(BackupError::MirrorProcessFailed {
                code: outcome.status.code(),
            });
        }

        Ok(BackupReport {
            timestamp,
            options,
            changes: outcome.changes,
            exit_code: outcome.status.code(),
            log_file: outcome.paths.log_file,
            backup_dir_bytes,
            elapsed: start_time.elapsed(),
        })
    }

    /// Take the target's manifest for the duration of one operation.
    async fn checkout(&self, name: &str) -> Result<(Target, Verdict)> {
        let mut registry = self.registry.lock().await;
        let control_dir = registry.control_dir().to_string();
        let target = registry.target_mut(name)?;

        connection::check(target, &control_dir);
        if !target.is_connected() {
            return Err(BackupError::TargetNotConnected(target.dest_path.clone()));
        }
        target.prepare_manifest(&control_dir)?;

        let verdict = match std::mem::replace(&mut target.manifest, ManifestSlot::CheckedOut) {
            ManifestSlot::Loaded(verdict) => verdict,
            other => {
                target.manifest = other;
                return Err(BackupError::ManifestNotLoaded(name.to_string()));
            }
        };

        let mut snapshot = target.clone();
        snapshot.manifest = ManifestSlot::Unloaded;
        Ok((snapshot, verdict))
    }

    /// Return a checked-out manifest and persist what the operation produced.
    ///
    /// Order: timestamps and registry first, then the manifest. A failed
    /// registry write does not skip the manifest.
    async fn checkin(&self, name: &str, verdict: Verdict, checkin: Checkin) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let control_dir = registry.control_dir().to_string();

        let Some(target) = registry.get_mut(name) else {
            warn!("Target {} was removed during the operation; dropping its manifest", name);
            return Ok(());
        };
        if !target.is_connected() {
            target.manifest = ManifestSlot::Unloaded;
            return if checkin.save_manifest || checkin.last_backup_time.is_some() {
                Err(BackupError::TargetNotConnected(target.dest_path.clone()))
            } else {
                Ok(())
            };
        }
        target.manifest = ManifestSlot::Loaded(verdict);

        let mut registry_changed = false;
        if let Some(ts) = checkin.last_backup_time {
            target.last_backup_time = Some(ts);
            registry_changed = true;
        }
        if let Some(ts) = checkin.last_verify_time {
            target.last_verify_time = Some(ts);
            registry_changed = true;
        }

        let registry_result = if registry_changed { registry.save() } else { Ok(()) };
        let manifest_result = match registry.get(name) {
            Some(target) if checkin.save_manifest => target.save_manifest(&control_dir),
            _ => Ok(()),
        };
        registry_result.and(manifest_result)
    }
}

fn preserve_corrupt_registry(path: &Path) {
    if !path.is_file() {
        return;
    }
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    match std::fs::copy(path, &aside) {
        Ok(_) => warn!("Copied unreadable registry to {}", PathBuf::from(aside).display()),
        Err(e) => warn!("Could not copy unreadable registry aside: {}", e),
    }
}
