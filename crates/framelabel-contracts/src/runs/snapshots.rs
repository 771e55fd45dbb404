use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::labels::LabelSet;

pub const SNAPSHOT_PREFIX: &str = "labels_";
const SNAPSHOT_EXTENSION: &str = "json";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Union of ids recorded across all readable snapshots.
#[derive(Debug, Clone, Default)]
pub struct SnapshotIndex {
    /// id → whether any snapshot holds a parsed (non-null) label for it.
    pub labeled: BTreeMap<String, bool>,
    pub loaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

impl SnapshotIndex {
    /// Ids that must not be scheduled again. With `include_malformed` false,
    /// ids only ever recorded with a null marker are left out.
    pub fn done_ids(&self, include_malformed: bool) -> Vec<String> {
        self.labeled
            .iter()
            .filter(|(_, parsed)| include_malformed || **parsed)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Append-only directory of `labels_<timestamp>.json` files.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `labels` as a new snapshot named after `at`. Existing
    /// snapshots are never replaced; a numeric suffix resolves name clashes.
    pub fn write(&self, labels: &LabelSet, at: DateTime<Utc>) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed creating {}", self.dir.display()))?;
        let stamp = snapshot_stamp(at);
        let body = serde_json::to_string_pretty(&labels.to_json())?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{SNAPSHOT_PREFIX}{stamp}.{SNAPSHOT_EXTENSION}")
            } else {
                format!("{SNAPSHOT_PREFIX}{stamp}_{attempt}.{SNAPSHOT_EXTENSION}")
            };
            let path = self.dir.join(name);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed creating {}", path.display()))
                }
            };
            file.write_all(body.as_bytes())
                .and_then(|_| file.sync_all())
                .with_context(|| format!("failed writing {}", path.display()))?;
            return Ok(path);
        }
        anyhow::bail!(
            "no free snapshot name for {stamp} in {}",
            self.dir.display()
        )
    }

    /// Snapshot paths in name order. A missing directory has none.
    pub fn list(&self) -> anyhow::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed listing {}", self.dir.display()))
            }
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let is_snapshot = path
                .file_name()
                .and_then(|value| value.to_str())
                .map(|name| {
                    name.starts_with(SNAPSHOT_PREFIX)
                        && name.ends_with(&format!(".{SNAPSHOT_EXTENSION}"))
                })
                .unwrap_or(false);
            if is_snapshot {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Loads every snapshot. Unreadable ones are logged and skipped; their
    /// ids simply stay eligible for labeling.
    pub fn index(&self) -> anyhow::Result<SnapshotIndex> {
        let mut index = SnapshotIndex::default();
        for path in self.list()? {
            match LabelSet::load(&path) {
                Ok(set) => {
                    for (id, result) in set.iter() {
                        let parsed = index.labeled.entry(id.to_string()).or_insert(false);
                        *parsed |= result.is_some();
                    }
                    index.loaded.push(path);
                }
                Err(err) => {
                    tracing::warn!(
                        snapshot = %path.display(),
                        error = %format!("{err:#}"),
                        "skipping unreadable snapshot"
                    );
                    index.skipped.push(path);
                }
            }
        }
        Ok(index)
    }
}

/// RFC 3339 UTC timestamp with `:` swapped for `-` so it is a valid file
/// name everywhere.
pub fn snapshot_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
        .replace(':', "-")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map, Value};

    use super::{snapshot_stamp, SnapshotStore};
    use crate::labels::LabelSet;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn stamp_has_no_colons() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap();
        let stamp = snapshot_stamp(at);
        assert_eq!(stamp, "2026-10-19T08-30-05.000000Z");
    }

    #[test]
    fn same_instant_never_overwrites() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SnapshotStore::new(temp.path().join("snapshots"));
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap();

        let mut first = LabelSet::new();
        first.insert("f0", Some(obj(json!({"a": 1}))));
        let mut second = LabelSet::new();
        second.insert("f1", None);

        let first_path = store.write(&first, at)?;
        let second_path = store.write(&second, at)?;
        assert_ne!(first_path, second_path);
        assert_eq!(store.list()?, vec![first_path.clone(), second_path]);
        assert_eq!(LabelSet::load(&first_path)?, first);
        Ok(())
    }

    #[test]
    fn index_unions_ids_and_skips_corrupt_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SnapshotStore::new(temp.path());

        let mut older = LabelSet::new();
        older.insert("f0", Some(obj(json!({"a": 1}))));
        older.insert("f1", None);
        store.write(&older, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())?;

        let mut newer = LabelSet::new();
        newer.insert("f2", None);
        store.write(&newer, Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap())?;

        let corrupt = temp.path().join("labels_2026-01-03T00-00-00.000000Z.json");
        std::fs::write(&corrupt, b"{\"f3\": ")?;
        std::fs::write(temp.path().join("labels.json"), b"{\"f4\": null}")?;

        let index = store.index()?;
        assert_eq!(index.loaded.len(), 2);
        assert_eq!(index.skipped, vec![corrupt]);
        assert_eq!(index.done_ids(true), vec!["f0", "f1", "f2"]);
        assert_eq!(index.done_ids(false), vec!["f0"]);
        Ok(())
    }

    #[test]
    fn later_parsed_label_clears_malformed_marker() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SnapshotStore::new(temp.path());

        let mut malformed = LabelSet::new();
        malformed.insert("f1", None);
        store.write(&malformed, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())?;
        let mut relabeled = LabelSet::new();
        relabeled.insert("f1", Some(obj(json!({"ok": true}))));
        store.write(&relabeled, Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap())?;

        assert_eq!(store.index()?.done_ids(false), vec!["f1"]);
        Ok(())
    }

    #[test]
    fn missing_directory_lists_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SnapshotStore::new(temp.path().join("absent"));
        assert!(store.list()?.is_empty());
        assert!(store.index()?.labeled.is_empty());
        Ok(())
    }
}
