//! The map file: the line-oriented configuration source.
//!
//! One entry per line, `domain,target`, surrounding whitespace trimmed,
//! blank lines ignored. The registry is authoritative for what is routable;
//! the map file is just input to reconciliation.

use anyhow::Context;
use std::fmt;
use std::path::{Path, PathBuf};

/// Well-known map file name under the operator's home directory.
pub const MAP_FILE_NAME: &str = ".hostgate";

/// A single `domain,target` declaration.
///
/// `target` identifies how to run the backend (an executable path or a
/// script file). No existence check is made on it here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub domain: String,
    pub target: String,
}

impl fmt::Display for MapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.domain, self.target)
    }
}

/// Parse map file text into entries, preserving file order.
///
/// Duplicate domains are kept; reconciliation applies them in order so a
/// later line for the same domain wins.
pub fn parse_entries(text: &str) -> Vec<MapEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(',') {
            Some((domain, target)) => entries.push(MapEntry {
                domain: domain.trim().to_string(),
                target: target.trim().to_string(),
            }),
            None => {
                tracing::warn!(line, "Skipping map file line without a comma");
            }
        }
    }
    entries
}

/// The on-disk map file and its parsed entries.
#[derive(Debug, Clone)]
pub struct MapFile {
    path: PathBuf,
    entries: Vec<MapEntry>,
}

impl MapFile {
    /// Path of the well-known map file: `~/.hostgate`.
    pub fn default_path() -> PathBuf {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(MAP_FILE_NAME)
    }

    /// Load the map file at `path`, creating an empty one if absent.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            std::fs::write(&path, "")
                .with_context(|| format!("failed to create map file {}", path.display()))?;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read map file {}", path.display()))?;
        Ok(Self {
            path,
            entries: parse_entries(&text),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn get(&self, domain: &str) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.domain == domain)
    }

    /// Set the target for a domain, overwriting an existing entry or
    /// appending a new one. Uniqueness is by domain.
    pub fn set(&mut self, domain: &str, target: &str) {
        for entry in &mut self.entries {
            if entry.domain == domain {
                entry.target = target.to_string();
                return;
            }
        }
        self.entries.push(MapEntry {
            domain: domain.to_string(),
            target: target.to_string(),
        });
    }

    /// Remove a domain's entry. Returns whether anything was removed.
    pub fn remove(&mut self, domain: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.domain != domain);
        self.entries.len() != before
    }

    /// Write the entries back to disk, one per line.
    pub fn save(&self) -> anyhow::Result<()> {
        let mut text = self
            .entries
            .iter()
            .map(MapEntry::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write map file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entries_trims_and_skips_blanks() {
        let text = "\n  a.com,/srv/a/app.js  \n\nb.com,/srv/b/run\n   \n";
        let entries = parse_entries(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].domain, "a.com");
        assert_eq!(entries[0].target, "/srv/a/app.js");
        assert_eq!(entries[1].domain, "b.com");
        assert_eq!(entries[1].target, "/srv/b/run");
    }

    #[test]
    fn test_parse_entries_keeps_duplicates_in_order() {
        let entries = parse_entries("a.com,/x/app.js\na.com,/y/app.js\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].target, "/x/app.js");
        assert_eq!(entries[1].target, "/y/app.js");
    }

    #[test]
    fn test_parse_entries_ignores_lines_without_comma() {
        let entries = parse_entries("not-an-entry\na.com,/srv/a\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].domain, "a.com");
    }

    #[test]
    fn test_parse_entries_splits_on_first_comma_only() {
        let entries = parse_entries("a.com,/srv/dir,with,commas\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, "/srv/dir,with,commas");
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".hostgate");
        let map = MapFile::load(&path).unwrap();
        assert!(path.exists());
        assert!(map.entries().is_empty());
    }

    #[test]
    fn test_set_overwrites_existing_domain() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = MapFile::load(dir.path().join(".hostgate")).unwrap();
        map.set("a.com", "/srv/a/app.js");
        map.set("b.com", "/srv/b/app.js");
        map.set("a.com", "/srv/a2/app.js");
        assert_eq!(map.entries().len(), 2);
        assert_eq!(map.get("a.com").unwrap().target, "/srv/a2/app.js");
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = MapFile::load(dir.path().join(".hostgate")).unwrap();
        map.set("a.com", "/srv/a");
        assert!(map.remove("a.com"));
        assert!(!map.remove("a.com"));
        assert!(map.entries().is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".hostgate");
        let mut map = MapFile::load(&path).unwrap();
        map.set("a.com", "/srv/a/app.js");
        map.set("b.com", "/srv/b/run");
        map.save().unwrap();

        let reloaded = MapFile::load(&path).unwrap();
        assert_eq!(reloaded.entries(), map.entries());
    }
}
