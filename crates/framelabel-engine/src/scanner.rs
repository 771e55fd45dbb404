use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use framelabel_contracts::labels::WorkItem;
use framelabel_contracts::runs::cache::CacheDir;
use framelabel_contracts::runs::snapshots::SnapshotStore;

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub candidates: Vec<WorkItem>,
    pub done: BTreeSet<String>,
    pub cached: BTreeSet<String>,
    pub pending: Vec<WorkItem>,
    pub skipped_snapshots: Vec<PathBuf>,
    /// Cache entries that cannot be loaded; their ids are scheduled again.
    pub unreadable_cached: Vec<String>,
}

impl ScanReport {
    pub fn has_new_work(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_ids(&self) -> Vec<&str> {
        self.pending.iter().map(|item| item.id.as_str()).collect()
    }
}

/// Computes which inputs still need a label: every candidate minus ids
/// recorded in snapshots and ids whose cache entry loads cleanly.
#[derive(Debug, Clone)]
pub struct JobScanner {
    extension: String,
    snapshots: SnapshotStore,
    cache: CacheDir,
    retry_malformed: bool,
}

impl JobScanner {
    pub fn new(extension: impl Into<String>, snapshots: SnapshotStore, cache: CacheDir) -> Self {
        Self {
            extension: extension.into(),
            snapshots,
            cache,
            retry_malformed: false,
        }
    }

    /// When set, ids whose snapshots only hold the malformed marker are
    /// scheduled again.
    pub fn retry_malformed(mut self, retry: bool) -> Self {
        self.retry_malformed = retry;
        self
    }

    pub fn scan(&self, input_dir: &Path) -> Result<ScanReport> {
        let candidates = list_candidates(input_dir, &self.extension)?;
        let index = self.snapshots.index()?;
        let done = index
            .done_ids(!self.retry_malformed)
            .into_iter()
            .collect::<BTreeSet<String>>();
        let mut cached = BTreeSet::new();
        let mut unreadable_cached = Vec::new();
        let cache_ids = self
            .cache
            .ids()
            .with_context(|| format!("failed listing {}", self.cache.path().display()))?;
        for id in cache_ids {
            match self.cache.read(&id) {
                Ok(_) => {
                    cached.insert(id);
                }
                Err(err) if err.is_unreadable_entry() => {
                    tracing::warn!(
                        item_id = %id,
                        error = %err,
                        "unreadable cache entry; relabeling"
                    );
                    unreadable_cached.push(id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let pending = candidates
            .iter()
            .filter(|item| !done.contains(&item.id) && !cached.contains(&item.id))
            .cloned()
            .collect::<Vec<WorkItem>>();

        tracing::info!(
            candidates = candidates.len(),
            done = done.len(),
            cached = cached.len(),
            pending = pending.len(),
            "scan complete"
        );

        Ok(ScanReport {
            candidates,
            done,
            cached,
            pending,
            skipped_snapshots: index.skipped,
            unreadable_cached,
        })
    }
}

/// Files in `input_dir` with the given extension (case-insensitive), as
/// work items sorted by id. Hidden files (such as `._frame.jpg` resource
/// forks) are skipped. When two files share a stem the first path in name
/// order wins.
pub fn list_candidates(input_dir: &Path, extension: &str) -> Result<Vec<WorkItem>> {
    let wanted = extension.trim_start_matches('.').to_ascii_lowercase();
    let entries = fs::read_dir(input_dir)
        .with_context(|| format!("failed reading input directory {}", input_dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed reading input directory {}", input_dir.display()))?
            .path();
        if !path.is_file() {
            continue;
        }
        let hidden = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(|name| name.starts_with('.'))
            .unwrap_or(false);
        let matches = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.eq_ignore_ascii_case(&wanted))
            .unwrap_or(false);
        if matches && hidden {
            tracing::warn!(path = %path.display(), "skipping hidden input file");
        } else if matches {
            paths.push(path);
        }
    }
    paths.sort();

    let mut by_id: BTreeMap<String, WorkItem> = BTreeMap::new();
    for path in paths {
        let Some(item) = WorkItem::from_path(&path) else {
            continue;
        };
        if let Some(existing) = by_id.get(&item.id) {
            tracing::warn!(
                item_id = %item.id,
                kept = %existing.source.display(),
                ignored = %path.display(),
                "duplicate item id"
            );
            continue;
        }
        by_id.insert(item.id.clone(), item);
    }
    Ok(by_id.into_values().collect())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::{TimeZone, Utc};
    use framelabel_contracts::labels::LabelSet;
    use framelabel_contracts::runs::cache::CacheDir;
    use framelabel_contracts::runs::snapshots::SnapshotStore;
    use serde_json::{json, Map, Value};

    use super::{list_candidates, JobScanner};

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn touch(dir: &Path, names: &[&str]) -> anyhow::Result<()> {
        for name in names {
            std::fs::write(dir.join(name), b"img")?;
        }
        Ok(())
    }

    fn scanner(root: &Path) -> JobScanner {
        JobScanner::new(
            "jpg",
            SnapshotStore::new(root.join("snapshots")),
            CacheDir::new(root.join(".label_cache")),
        )
    }

    #[test]
    fn candidates_filter_extension_and_sort() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        touch(
            temp.path(),
            &["frame_0002.jpg", "frame_0000.JPG", "frame_0001.jpg", "notes.txt", "frame_0003.png"],
        )?;
        std::fs::create_dir_all(temp.path().join("nested.jpg"))?;

        let items = list_candidates(temp.path(), "jpg")?;
        let ids = items.iter().map(|item| item.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["frame_0000", "frame_0001", "frame_0002"]);
        Ok(())
    }

    #[test]
    fn unreadable_input_dir_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert!(list_candidates(&temp.path().join("absent"), "jpg").is_err());
        Ok(())
    }

    #[test]
    fn pending_excludes_snapshot_and_cached_ids() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("frames");
        std::fs::create_dir_all(&input)?;
        touch(&input, &["f0.jpg", "f1.jpg", "f2.jpg", "f3.jpg"])?;

        let mut labeled = LabelSet::new();
        labeled.insert("f0", Some(obj(json!({"a": 1}))));
        SnapshotStore::new(temp.path().join("snapshots"))
            .write(&labeled, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())?;
        CacheDir::new(temp.path().join(".label_cache")).write("f2", &None)?;

        let report = scanner(temp.path()).scan(&input)?;
        assert_eq!(report.candidates.len(), 4);
        assert_eq!(report.pending_ids(), vec!["f1", "f3"]);
        assert!(report.done.contains("f0"));
        assert!(report.cached.contains("f2"));
        Ok(())
    }

    #[test]
    fn corrupt_snapshot_is_skipped_not_fatal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("frames");
        std::fs::create_dir_all(&input)?;
        touch(&input, &["f0.jpg"])?;
        let snapshots = temp.path().join("snapshots");
        std::fs::create_dir_all(&snapshots)?;
        std::fs::write(snapshots.join("labels_broken.json"), b"{\"f0\":")?;

        let report = scanner(temp.path()).scan(&input)?;
        assert_eq!(report.pending_ids(), vec!["f0"]);
        assert_eq!(report.skipped_snapshots.len(), 1);
        Ok(())
    }

    #[test]
    fn retry_malformed_reschedules_null_markers() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("frames");
        std::fs::create_dir_all(&input)?;
        touch(&input, &["f0.jpg", "f1.jpg"])?;

        let mut labeled = LabelSet::new();
        labeled.insert("f0", Some(obj(json!({"a": 1}))));
        labeled.insert("f1", None);
        SnapshotStore::new(temp.path().join("snapshots"))
            .write(&labeled, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())?;

        let default_scan = scanner(temp.path()).scan(&input)?;
        assert!(!default_scan.has_new_work());

        let retry_scan = scanner(temp.path()).retry_malformed(true).scan(&input)?;
        assert_eq!(retry_scan.pending_ids(), vec!["f1"]);
        Ok(())
    }

    #[test]
    fn hidden_files_are_not_candidates() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        touch(temp.path(), &["f0.jpg", "._f0.jpg", ".thumb.jpg"])?;

        let items = list_candidates(temp.path(), "jpg")?;
        let ids = items.iter().map(|item| item.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["f0"]);
        Ok(())
    }

    #[test]
    fn unreadable_cache_entry_stays_pending() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("frames");
        std::fs::create_dir_all(&input)?;
        touch(&input, &["f0.jpg", "f1.jpg"])?;
        let cache = CacheDir::new(temp.path().join(".label_cache"));
        cache.write("f0", &None)?;
        std::fs::write(cache.entry_path("f1"), b"{trunc")?;

        let report = scanner(temp.path()).scan(&input)?;
        assert_eq!(report.pending_ids(), vec!["f1"]);
        assert_eq!(report.unreadable_cached, vec!["f1".to_string()]);
        assert!(report.cached.contains("f0"));
        Ok(())
    }
}
