//! Verdict manifest: the per-target trust record.
//!
//! Maps a destination-relative path to the checksum the file had when it was
//! written by the mirror tool, or to the hard-link marker. Serialized as one
//! `<checksum> <path>` line per entry, in insertion order.

pub mod checksum;

use crate::{BackupError, Result};
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Reserved value for paths that are hard links to another manifest entry.
pub const HARD_LINK_MARKER: &str = "HL";

/// Entries removed since the last compaction before the backing vector is rebuilt.
const COMPACT_THRESHOLD: usize = 1024;

/// Value stored per manifest path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Digest(String),
    HardLink,
}

impl Checksum {
    pub fn parse(value: &str) -> Self {
        if value == HARD_LINK_MARKER {
            Checksum::HardLink
        } else {
            Checksum::Digest(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Checksum::Digest(d) => d,
            Checksum::HardLink => HARD_LINK_MARKER,
        }
    }

    pub fn is_hard_link(&self) -> bool {
        matches!(self, Checksum::HardLink)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insertion-ordered path -> checksum map.
///
/// Updating an existing path keeps its position; removal leaves a hole that
/// is compacted away lazily.
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    entries: Vec<Option<(String, Checksum)>>,
    index: HashMap<String, usize>,
    holes: usize,
}

impl Verdict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Checksum> {
        self.index
            .get(path)
            .and_then(|&i| self.entries[i].as_ref())
            .map(|(_, c)| c)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Insert or update an entry, returning the previous value.
    pub fn insert(&mut self, path: impl Into<String>, checksum: Checksum) -> Option<Checksum> {
        let path = path.into();
        if let Some(&i) = self.index.get(&path) {
            let slot = self.entries[i].as_mut().map(|(_, c)| c);
            return slot.map(|c| std::mem::replace(c, checksum));
        }
        self.index.insert(path.clone(), self.entries.len());
        self.entries.push(Some((path, checksum)));
        None
    }

    pub fn remove(&mut self, path: &str) -> Option<Checksum> {
        let i = self.index.remove(path)?;
        let removed = self.entries[i].take().map(|(_, c)| c);
        self.holes += 1;
        if self.holes >= COMPACT_THRESHOLD && self.holes > self.index.len() {
            self.compact();
        }
        removed
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Checksum)> {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref().map(|(p, c)| (p.as_str(), c)))
    }

    fn compact(&mut self) {
        self.entries.retain(Option::is_some);
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some((path, _)) = entry {
                self.index.insert(path.clone(), i);
            }
        }
        self.holes = 0;
    }

    /// Parse manifest lines. `source` only labels parse errors.
    ///
    /// Each line is split on its first space; blank lines are skipped and a
    /// non-blank line without a space (or with an empty checksum) is an error.
    pub fn parse<R: BufRead>(reader: R, source: &Path) -> Result<Self> {
        let mut verdict = Verdict::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ') {
                Some((checksum, path)) if !checksum.is_empty() && !path.is_empty() => {
                    verdict.insert(path, Checksum::parse(checksum));
                }
                _ => {
                    return Err(BackupError::ManifestParseError {
                        path: source.to_path_buf(),
                        line: n + 1,
                        content: line.to_string(),
                    })
                }
            }
        }
        Ok(verdict)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::parse(BufReader::new(file), path)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        for (path, checksum) in self.iter() {
            writeln!(writer, "{} {}", checksum, path)?;
        }
        writer.flush()
    }

    /// Overwrite `path` with this manifest via a temp file in the same directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        self.write_to(std::io::BufWriter::new(temp_file.as_file_mut()))?;
        temp_file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
