//! Target records: what is persisted in the registry and what is derived at runtime.

use crate::fs::control::ControlArea;
use crate::manifest::Verdict;
use crate::{BackupError, Result};
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Format of persisted timestamps and of per-run file labels.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local time truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

mod opt_timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Persisted subset of a target, as stored under `targets.<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub identity_token: String,
    #[serde(default, with = "opt_timestamp")]
    pub last_backup_time: Option<NaiveDateTime>,
    #[serde(default, with = "opt_timestamp")]
    pub last_verify_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub backup_interval_days: Option<u32>,
    #[serde(default)]
    pub verify_interval_days: Option<u32>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub optional_patterns: Vec<String>,
}

/// In-memory manifest state of a target.
#[derive(Debug, Clone, Default)]
pub enum ManifestSlot {
    #[default]
    Unloaded,
    Loaded(Verdict),
    /// Taken by a running operation.
    CheckedOut,
}

/// A named backup relationship.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub identity_token: String,
    pub last_backup_time: Option<NaiveDateTime>,
    pub last_verify_time: Option<NaiveDateTime>,
    pub backup_interval_days: Option<u32>,
    pub verify_interval_days: Option<u32>,
    pub exclude_patterns: Vec<String>,
    pub optional_patterns: Vec<String>,
    pub(crate) connected: bool,
    pub(crate) manifest: ManifestSlot,
}

impl Target {
    pub fn from_record(name: impl Into<String>, record: TargetRecord) -> Self {
        Self {
            name: name.into(),
            source_path: record.source_path,
            dest_path: record.dest_path,
            identity_token: record.identity_token,
            last_backup_time: record.last_backup_time,
            last_verify_time: record.last_verify_time,
            backup_interval_days: record.backup_interval_days,
            verify_interval_days: record.verify_interval_days,
            exclude_patterns: record.exclude_patterns,
            optional_patterns: record.optional_patterns,
            connected: false,
            manifest: ManifestSlot::Unloaded,
        }
    }

    pub fn to_record(&self) -> TargetRecord {
        TargetRecord {
            source_path: self.source_path.clone(),
            dest_path: self.dest_path.clone(),
            identity_token: self.identity_token.clone(),
            last_backup_time: self.last_backup_time,
            last_verify_time: self.last_verify_time,
            backup_interval_days: self.backup_interval_days,
            verify_interval_days: self.verify_interval_days,
            exclude_patterns: self.exclude_patterns.clone(),
            optional_patterns: self.optional_patterns.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.manifest, ManifestSlot::CheckedOut)
    }

    pub fn control_area(&self, dir_name: &str) -> ControlArea {
        ControlArea::new(&self.dest_path, &self.source_path, dir_name)
    }

    /// Read the manifest file from the destination.
    pub fn load_manifest(&self, dir_name: &str) -> Result<Verdict> {
        if !self.connected {
            return Err(BackupError::TargetNotConnected(self.dest_path.clone()));
        }
        Verdict::load(&self.control_area(dir_name).manifest_file())
    }

    /// Write the loaded manifest back to the destination.
    pub fn save_manifest(&self, dir_name: &str) -> Result<()> {
        if !self.connected {
            return Err(BackupError::TargetNotConnected(self.dest_path.clone()));
        }
        match &self.manifest {
            ManifestSlot::Loaded(verdict) => {
                tracing::info!("Saving manifest for target {} ({} entries)", self.name, verdict.len());
                verdict.save(&self.control_area(dir_name).manifest_file())
            }
            _ => Err(BackupError::ManifestNotLoaded(self.name.clone())),
        }
    }

    /// Load the manifest once per connected session and return it.
    pub fn prepare_manifest(&mut self, dir_name: &str) -> Result<&mut Verdict> {
        match self.manifest {
            ManifestSlot::CheckedOut => return Err(BackupError::TargetBusy(self.name.clone())),
            ManifestSlot::Unloaded => {
                let verdict = self.load_manifest(dir_name)?;
                self.manifest = ManifestSlot::Loaded(verdict);
            }
            ManifestSlot::Loaded(_) => {
                if !self.connected {
                    return Err(BackupError::TargetNotConnected(self.dest_path.clone()));
                }
            }
        }
        match &mut self.manifest {
            ManifestSlot::Loaded(verdict) => Ok(verdict),
            _ => Err(BackupError::ManifestNotLoaded(self.name.clone())),
        }
    }

    /// Days since the last backup, when that exceeds the configured interval.
    pub fn backup_overdue(&self, now: NaiveDateTime) -> Option<i64> {
        overdue(self.last_backup_time, self.backup_interval_days, now)
    }

    /// Days since the last verification, when that exceeds the configured interval.
    pub fn verify_overdue(&self, now: NaiveDateTime) -> Option<i64> {
        overdue(self.last_verify_time, self.verify_interval_days, now)
    }
}

fn overdue(last: Option<NaiveDateTime>, interval: Option<u32>, now: NaiveDateTime) -> Option<i64> {
    let days = (now - last?).num_days();
    (days > i64::from(interval?)).then_some(days)
}
