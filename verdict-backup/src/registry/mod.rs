//! Target registry: the persisted list of backup targets.
//!
//! Stored as JSON (`{"targets": {<name>: {...}}}`). Entries that fail
//! validation are skipped with a warning but kept verbatim, so saving the
//! registry never drops them.

pub mod target;

use crate::connection::{self, ConnectionState};
use crate::fs::control::{normalize, source_basename, ControlArea};
use crate::manifest::Verdict;
use crate::{BackupError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use target::{Target, TargetRecord};
use tracing::{info, warn};

const REQUIRED_FIELDS: [&str; 3] = ["source_path", "dest_path", "identity_token"];

pub struct Registry {
    path: PathBuf,
    control_dir: String,
    targets: BTreeMap<String, Target>,
    /// Raw entries that failed validation on load.
    skipped: BTreeMap<String, Value>,
}

impl Registry {
    /// Empty registry bound to `path`; nothing is written until `save`.
    pub fn empty(path: impl Into<PathBuf>, control_dir: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            control_dir: control_dir.into(),
            targets: BTreeMap::new(),
            skipped: BTreeMap::new(),
        }
    }

    /// Load the registry, creating an empty one on disk if the file is absent.
    ///
    /// A file that is not valid JSON or has no `targets` mapping is
    /// `ConfigCorrupt`. Individual bad entries are skipped and logged.
    /// Every loaded target gets a connection check.
    pub fn load(path: impl Into<PathBuf>, control_dir: impl Into<String>) -> Result<Self> {
        let mut registry = Self::empty(path, control_dir);

        if !registry.path.exists() {
            info!("Creating empty registry at {}", registry.path.display());
            registry.save()?;
            return Ok(registry);
        }

        let content = std::fs::read_to_string(&registry.path)?;
        let data: Value = serde_json::from_str(&content)
            .map_err(|e| BackupError::ConfigCorrupt(format!("{}: {}", registry.path.display(), e)))?;
        let entries = data
            .get("targets")
            .and_then(Value::as_object)
            .ok_or_else(|| BackupError::ConfigCorrupt("Could not find any targets".to_string()))?;

        for (name, entry) in entries {
            match validate_entry(name, entry) {
                Ok(mut target) => {
                    connection::check(&mut target, &registry.control_dir);
                    registry.targets.insert(name.clone(), target);
                }
                Err(e) => {
                    warn!("Skipping target {}: {}", name, e);
                    registry.skipped.insert(name.clone(), entry.clone());
                }
            }
        }

        info!(
            "Loaded {} target(s) from {}",
            registry.targets.len(),
            registry.path.display()
        );
        Ok(registry)
    }

    /// Persist the registry via a temp file and rename.
    pub fn save(&self) -> Result<()> {
        let mut targets = Map::new();
        for (name, raw) in &self.skipped {
            targets.insert(name.clone(), raw.clone());
        }
        for (name, target) in &self.targets {
            targets.insert(name.clone(), serde_json::to_value(target.to_record())?);
        }
        let mut data = Map::new();
        data.insert("targets".to_string(), Value::Object(targets));
        let content = serde_json::to_string_pretty(&Value::Object(data))?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.write_all(b"\n")?;
        temp_file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn control_dir(&self) -> &str {
        &self.control_dir
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Target> {
        self.targets.get_mut(name)
    }

    pub fn target_mut(&mut self, name: &str) -> Result<&mut Target> {
        self.targets
            .get_mut(name)
            .ok_or_else(|| BackupError::UnknownTarget(name.to_string()))
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    /// Names of entries that failed validation on load.
    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.skipped.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name) || self.skipped.contains_key(name)
    }

    /// Register a new target and prepare its destination.
    pub fn add_target(&mut self, name: &str, source: &Path, dest: &Path) -> Result<&Target> {
        let source = normalize(source);
        let dest = normalize(dest);

        if self.contains(name) {
            return Err(BackupError::DuplicateTarget(name.to_string()));
        }
        if !source.is_dir() || source_basename(&source).is_empty() {
            return Err(BackupError::NotADirectory(source));
        }

        let basename = source_basename(&source);
        if let Some(other) = self.targets.values().find(|t| {
            t.dest_path == dest && source_basename(&t.source_path) == basename && t.source_path != source
        }) {
            return Err(BackupError::ConflictingDestination(other.name.clone()));
        }

        if !dest.is_dir() {
            return Err(BackupError::NotADirectory(dest));
        }

        let identity_token = prepare_destination(&source, &dest, &self.control_dir)?;

        if dest.join(&basename).exists() {
            warn!(
                "The destination already contains an entry named {}. If it is not a backup, \
                 consider moving it; if it is, consider checking the manifest.",
                basename
            );
        }

        let mut target = Target::from_record(
            name,
            TargetRecord {
                source_path: source,
                dest_path: dest,
                identity_token,
                last_backup_time: None,
                last_verify_time: None,
                backup_interval_days: None,
                verify_interval_days: None,
                exclude_patterns: Vec::new(),
                optional_patterns: Vec::new(),
            },
        );
        connection::check(&mut target, &self.control_dir);
        self.targets.insert(name.to_string(), target);

        if let Err(e) = self.save() {
            self.targets.remove(name);
            return Err(e);
        }
        info!("Added target {}", name);
        self.targets
            .get(name)
            .ok_or_else(|| BackupError::UnknownTarget(name.to_string()))
    }

    /// Forget a target. Destination data is left in place.
    pub fn remove_target(&mut self, name: &str) -> Result<()> {
        let removed_target = self.targets.remove(name);
        let removed_raw = match removed_target {
            Some(_) => None,
            None => self.skipped.remove(name),
        };
        if removed_target.is_none() && removed_raw.is_none() {
            return Err(BackupError::UnknownTarget(name.to_string()));
        }

        if let Err(e) = self.save() {
            if let Some(target) = removed_target {
                self.targets.insert(name.to_string(), target);
            }
            if let Some(raw) = removed_raw {
                self.skipped.insert(name.to_string(), raw);
            }
            return Err(e);
        }
        info!("Removed target {}", name);
        Ok(())
    }

    /// Re-run connection detection for every target, returning the transitions.
    pub fn refresh_connections(&mut self) -> Vec<(String, ConnectionState)> {
        let control_dir = self.control_dir.clone();
        self.targets
            .iter_mut()
            .filter_map(|(name, target)| {
                let state = connection::check(target, &control_dir);
                state.changed.then(|| (name.clone(), state))
            })
            .collect()
    }
}

fn validate_entry(name: &str, entry: &Value) -> Result<Target> {
    let object = entry
        .as_object()
        .ok_or_else(|| BackupError::ConfigCorrupt(format!("Target {} not defined as a mapping", name)))?;
    for key in REQUIRED_FIELDS {
        if !object.contains_key(key) {
            return Err(BackupError::ConfigCorrupt(format!("Key {} missing in target {}", key, name)));
        }
    }
    let record: TargetRecord = serde_json::from_value(entry.clone())
        .map_err(|e| BackupError::ConfigCorrupt(format!("Target {}: {}", name, e)))?;
    if !record.source_path.is_dir() {
        return Err(BackupError::ConfigCorrupt(format!(
            "Path does not exist or is not a directory: {}",
            record.source_path.display()
        )));
    }
    Ok(Target::from_record(name, record))
}

/// Ensure the destination has a control area and a manifest for `source`,
/// returning the destination's identity token.
fn prepare_destination(source: &Path, dest: &Path, control_dir: &str) -> Result<String> {
    let area = ControlArea::new(dest, source, control_dir);
    let manifest_file = area.manifest_file();

    if area.dir().is_dir() {
        let token = area
            .read_token()
            .map_err(|_| BackupError::DestinationCorrupt(dest.to_path_buf()))?;
        if token.is_empty() {
            return Err(BackupError::DestinationCorrupt(dest.to_path_buf()));
        }
        if manifest_file.is_file() {
            warn!(
                "A manifest already exists for the folder {}. You might want to check it.",
                area.basename()
            );
        } else {
            Verdict::new().save(&manifest_file)?;
        }
        Ok(token)
    } else {
        std::fs::create_dir(area.dir())?;
        let token = uuid::Uuid::new_v4().to_string();
        std::fs::write(area.id_file(), &token)?;
        Verdict::new().save(&manifest_file)?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONTROL: &str = ".verdict";

    struct Fixture {
        root: TempDir,
        registry_path: PathBuf,
    }

    impl Fixture {
        fn new() -> std::io::Result<Self> {
            let root = TempDir::new()?;
            fs::create_dir_all(root.path().join("src/photos"))?;
            fs::create_dir_all(root.path().join("disk"))?;
            let registry_path = root.path().join("registry.json");
            Ok(Self { root, registry_path })
        }

        fn src(&self) -> PathBuf {
            self.root.path().join("src/photos")
        }

        fn dst(&self) -> PathBuf {
            self.root.path().join("disk")
        }

        fn load(&self) -> Result<Registry> {
            Registry::load(&self.registry_path, CONTROL)
        }
    }

    #[test]
    fn test_load_creates_missing_file() -> Result<()> {
        let fx = Fixture::new()?;
        let registry = fx.load()?;
        assert_eq!(registry.targets().count(), 0);

        let content: Value = serde_json::from_str(&fs::read_to_string(&fx.registry_path)?)?;
        assert_eq!(content, serde_json::json!({"targets": {}}));
        Ok(())
    }

    #[test]
    fn test_load_rejects_invalid_json() -> Result<()> {
        let fx = Fixture::new()?;
        fs::write(&fx.registry_path, "{ not json")?;
        assert!(matches!(fx.load(), Err(BackupError::ConfigCorrupt(_))));

        fs::write(&fx.registry_path, r#"{"targets": []}"#)?;
        assert!(matches!(fx.load(), Err(BackupError::ConfigCorrupt(_))));
        Ok(())
    }

    #[test]
    fn test_add_creates_control_area_and_connects() -> Result<()> {
        let fx = Fixture::new()?;
        let mut registry = fx.load()?;

        let target = registry.add_target("photos", &fx.src(), &fx.dst())?;
        assert!(target.is_connected());
        let token = target.identity_token.clone();

        let control = fx.dst().join(CONTROL);
        assert_eq!(fs::read_to_string(control.join("id"))?, token);
        assert_eq!(fs::read_to_string(control.join("photos.ver"))?, "");

        let reloaded = fx.load()?;
        let target = reloaded.get("photos").expect("target persisted");
        assert_eq!(target.identity_token, token);
        assert!(target.is_connected());
        Ok(())
    }

    #[test]
    fn test_add_strips_trailing_separator() -> Result<()> {
        let fx = Fixture::new()?;
        let mut registry = fx.load()?;
        let src = format!("{}/", fx.src().display());
        let target = registry.add_target("photos", Path::new(&src), &fx.dst())?;
        assert_eq!(target.source_path, fx.src());
        Ok(())
    }

    #[test]
    fn test_add_duplicate_leaves_registry_unchanged() -> Result<()> {
        let fx = Fixture::new()?;
        let mut registry = fx.load()?;
        registry.add_target("photos", &fx.src(), &fx.dst())?;
        let before = fs::read_to_string(&fx.registry_path)?;

        let result = registry.add_target("photos", &fx.src(), &fx.dst());
        assert!(matches!(result, Err(BackupError::DuplicateTarget(_))));
        assert_eq!(fs::read_to_string(&fx.registry_path)?, before);
        Ok(())
    }

    #[test]
    fn test_add_source_not_a_directory() -> Result<()> {
        let fx = Fixture::new()?;
        let mut registry = fx.load()?;
        let before = fs::read_to_string(&fx.registry_path)?;

        let file = fx.root.path().join("plain.txt");
        fs::write(&file, "x")?;
        let result = registry.add_target("t", &file, &fx.dst());
        assert!(matches!(result, Err(BackupError::NotADirectory(_))));
        assert!(!registry.contains("t"));
        assert_eq!(fs::read_to_string(&fx.registry_path)?, before);
        Ok(())
    }

    #[test]
    fn test_add_dest_not_a_directory() -> Result<()> {
        let fx = Fixture::new()?;
        let mut registry = fx.load()?;
        let result = registry.add_target("t", &fx.src(), &fx.root.path().join("missing"));
        assert!(matches!(result, Err(BackupError::NotADirectory(_))));
        Ok(())
    }

    #[test]
    fn test_add_conflicting_destination() -> Result<()> {
        let fx = Fixture::new()?;
        let other = fx.root.path().join("elsewhere/photos");
        fs::create_dir_all(&other)?;
        let mut registry = fx.load()?;
        registry.add_target("photos", &fx.src(), &fx.dst())?;

        let result = registry.add_target("photos2", &other, &fx.dst());
        match result {
            Err(BackupError::ConflictingDestination(name)) => assert_eq!(name, "photos"),
            other => panic!("expected conflict, got {:?}", other.map(|t| t.name.clone())),
        }
        Ok(())
    }

    #[test]
    fn test_add_reuses_existing_token() -> Result<()> {
        let fx = Fixture::new()?;
        let docs = fx.root.path().join("src/docs");
        fs::create_dir_all(&docs)?;
        let mut registry = fx.load()?;
        let first = registry.add_target("photos", &fx.src(), &fx.dst())?.identity_token.clone();
        let second = registry.add_target("docs", &docs, &fx.dst())?.identity_token.clone();

        assert_eq!(first, second);
        assert!(fx.dst().join(CONTROL).join("docs.ver").is_file());
        Ok(())
    }

    #[test]
    fn test_add_corrupt_destination() -> Result<()> {
        let fx = Fixture::new()?;
        fs::create_dir_all(fx.dst().join(CONTROL))?;
        let mut registry = fx.load()?;

        let result = registry.add_target("photos", &fx.src(), &fx.dst());
        assert!(matches!(result, Err(BackupError::DestinationCorrupt(_))));
        assert!(!registry.contains("photos"));
        Ok(())
    }

    #[test]
    fn test_remove_target() -> Result<()> {
        let fx = Fixture::new()?;
        let mut registry = fx.load()?;
        registry.add_target("photos", &fx.src(), &fx.dst())?;

        registry.remove_target("photos")?;
        assert!(matches!(
            registry.remove_target("photos"),
            Err(BackupError::UnknownTarget(_))
        ));
        assert!(fx.load()?.get("photos").is_none());
        assert!(fx.dst().join(CONTROL).join("photos.ver").is_file());
        Ok(())
    }

    #[test]
    fn test_bad_entry_is_skipped_and_preserved() -> Result<()> {
        let fx = Fixture::new()?;
        let good = serde_json::json!({
            "source_path": fx.src(),
            "dest_path": fx.dst(),
            "identity_token": "abc",
        });
        let data = serde_json::json!({
            "targets": {
                "good": good,
                "no_token": {"source_path": fx.src(), "dest_path": fx.dst()},
                "gone": {"source_path": "/definitely/not/here", "dest_path": "/x", "identity_token": "t"},
                "scalar": 3,
            }
        });
        fs::write(&fx.registry_path, serde_json::to_string(&data)?)?;

        let registry = fx.load()?;
        assert!(registry.get("good").is_some());
        let skipped: Vec<_> = registry.skipped().collect();
        assert_eq!(skipped, vec!["gone", "no_token", "scalar"]);
        assert!(!registry.get("good").map(Target::is_connected).unwrap_or(true));

        registry.save()?;
        let saved: Value = serde_json::from_str(&fs::read_to_string(&fx.registry_path)?)?;
        assert_eq!(saved["targets"]["scalar"], 3);
        assert_eq!(saved["targets"]["gone"]["identity_token"], "t");
        Ok(())
    }
}
