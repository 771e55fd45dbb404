use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use framelabel_contracts::labels::LabelSet;
use framelabel_contracts::runs::cache::{CacheDir, CacheError};

use crate::config::OutputLayout;

/// Drains the per-item cache directory into a label set.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    cache: CacheDir,
    reject_dir: Option<PathBuf>,
}

/// Entries loaded from the cache but not yet deleted. Dropping it without
/// `commit` leaves every file in place for the next aggregation.
#[derive(Debug)]
pub struct CacheDrain {
    cache: CacheDir,
    reject_dir: Option<PathBuf>,
    entries: LabelSet,
    unreadable: Vec<String>,
}

impl ResultAggregator {
    pub fn new(cache: CacheDir) -> Self {
        Self {
            cache,
            reject_dir: None,
        }
    }

    /// On commit, move unreadable entries into `dir` instead of leaving
    /// them in the cache. Their ids become pending again.
    pub fn reject_unreadable_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reject_dir = Some(dir.into());
        self
    }

    /// Loads every entry in id order. Entries whose content cannot be
    /// parsed are logged and left on disk; I/O failures abort.
    pub fn collect(&self) -> Result<CacheDrain, CacheError> {
        let mut entries = LabelSet::new();
        let mut unreadable = Vec::new();
        for id in self.cache.ids()? {
            match self.cache.read(&id) {
                Ok(result) => {
                    entries.insert(id, result);
                }
                Err(err) if err.is_unreadable_entry() => {
                    tracing::warn!(item_id = %id, error = %err, "leaving unreadable cache entry");
                    unreadable.push(id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(CacheDrain {
            cache: self.cache.clone(),
            reject_dir: self.reject_dir.clone(),
            entries,
            unreadable,
        })
    }

    /// Collect and commit in one step.
    pub fn gather(&self) -> Result<LabelSet, CacheError> {
        self.collect()?.commit()
    }
}

impl CacheDrain {
    pub fn entries(&self) -> &LabelSet {
        &self.entries
    }

    pub fn unreadable(&self) -> &[String] {
        &self.unreadable
    }

    /// Deletes each consumed entry, moves unreadable ones aside when a
    /// reject directory is set, then removes the directory once nothing is
    /// left in it.
    pub fn commit(self) -> Result<LabelSet, CacheError> {
        for id in self.entries.ids() {
            self.cache.remove(id)?;
        }
        if let Some(dir) = self.reject_dir.as_deref() {
            reject_entries(&self.cache, &self.unreadable, dir)?;
        }
        let stale = self.cache.remove_stale_temp_files()?;
        if stale > 0 {
            tracing::debug!(count = stale, "removed stale cache temp files");
        }
        if !self.cache.remove_if_empty()? {
            tracing::warn!(
                cache_dir = %self.cache.path().display(),
                unreadable = self.unreadable.len(),
                "cache directory kept; it still holds entries"
            );
        }
        Ok(self.entries)
    }
}

fn reject_entries(cache: &CacheDir, ids: &[String], dir: &Path) -> Result<(), CacheError> {
    for id in ids {
        let moved = cache.quarantine(id, dir)?;
        tracing::warn!(
            item_id = %id,
            moved_to = %moved.display(),
            "rejected unreadable cache entry"
        );
    }
    Ok(())
}

/// Union of this run's in-memory results and the drained cache. Cache
/// entries win on conflict; the result is sorted by id.
pub fn merge_results(fresh: LabelSet, drained: LabelSet) -> LabelSet {
    let mut merged = fresh;
    merged.merge_preferring(drained);
    merged.sort_by_id();
    merged
}

#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub labels: LabelSet,
    pub drained: usize,
    /// Ids whose cache entries could not be loaded and were moved to the
    /// reject directory.
    pub rejected: Vec<String>,
    pub snapshot_path: PathBuf,
}

/// Merges `fresh` with the cache under `layout`, writes the snapshot and
/// the current label file, and only then deletes the consumed cache files.
/// A crash before the deletes leaves the cache to be aggregated again.
/// Unreadable entries go to the layout's reject directory.
pub fn aggregate_cache(layout: &OutputLayout, fresh: LabelSet) -> Result<AggregationOutcome> {
    let drain = ResultAggregator::new(layout.cache())
        .reject_unreadable_to(layout.rejected_dir())
        .collect()
        .context("failed reading label cache")?;
    let drained = drain.entries().len();
    let labels = merge_results(fresh, drain.entries().clone());

    let snapshot_path = layout.snapshots().write(&labels, Utc::now())?;
    labels.write(&layout.current_labels())?;
    let rejected = drain.unreadable().to_vec();
    drain.commit().context("failed clearing label cache")?;

    tracing::info!(
        drained,
        rejected = rejected.len(),
        labels = labels.len(),
        snapshot = %snapshot_path.display(),
        "aggregation complete"
    );
    Ok(AggregationOutcome {
        labels,
        drained,
        rejected,
        snapshot_path,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use framelabel_contracts::labels::LabelSet;
    use framelabel_contracts::runs::cache::CacheDir;

    use super::{aggregate_cache, merge_results, ResultAggregator};
    use crate::config::OutputLayout;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn gather_consumes_every_entry_and_removes_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = CacheDir::new(temp.path().join("cache"));
        cache.write("f2", &Some(obj(json!({"n": 2}))))?;
        cache.write("f0", &Some(obj(json!({"n": 0}))))?;
        cache.write("f1", &None)?;

        let labels = ResultAggregator::new(cache.clone()).gather()?;
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.ids().collect::<Vec<_>>(), vec!["f0", "f1", "f2"]);
        assert!(!cache.exists());
        Ok(())
    }

    #[test]
    fn gather_on_missing_directory_is_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let labels = ResultAggregator::new(CacheDir::new(temp.path().join("none"))).gather()?;
        assert!(labels.is_empty());
        Ok(())
    }

    #[test]
    fn uncommitted_drain_leaves_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = CacheDir::new(temp.path().join("cache"));
        cache.write("f0", &None)?;

        let drain = ResultAggregator::new(cache.clone()).collect()?;
        assert_eq!(drain.entries().len(), 1);
        drop(drain);
        assert_eq!(cache.ids()?, vec!["f0"]);
        Ok(())
    }

    #[test]
    fn unreadable_entry_keeps_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = CacheDir::new(temp.path().join("cache"));
        cache.write("f0", &Some(obj(json!({"ok": true}))))?;
        std::fs::write(cache.entry_path("f1"), b"{truncated")?;

        let drain = ResultAggregator::new(cache.clone()).collect()?;
        assert_eq!(drain.unreadable(), ["f1".to_string()]);
        let labels = drain.commit()?;
        assert_eq!(labels.len(), 1);
        assert!(cache.exists());
        assert_eq!(cache.ids()?, vec!["f1"]);
        Ok(())
    }

    #[test]
    fn rejected_entry_is_moved_and_directory_removed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = CacheDir::new(temp.path().join("cache"));
        let rejects = temp.path().join("rejected");
        cache.write("f0", &None)?;
        std::fs::write(cache.entry_path("f1"), b"{trunc")?;

        let labels = ResultAggregator::new(cache.clone())
            .reject_unreadable_to(&rejects)
            .gather()?;
        assert_eq!(labels.ids().collect::<Vec<_>>(), vec!["f0"]);
        assert!(!cache.exists());
        assert!(rejects.join("f1.json").is_file());
        Ok(())
    }

    #[test]
    fn merge_prefers_cache_and_sorts() {
        let mut fresh = LabelSet::new();
        fresh.insert("f3", Some(obj(json!({"src": "memory"}))));
        fresh.insert("f1", Some(obj(json!({"src": "memory"}))));
        let mut drained = LabelSet::new();
        drained.insert("f1", Some(obj(json!({"src": "cache"}))));
        drained.insert("f0", None);

        let merged = merge_results(fresh, drained);
        assert_eq!(merged.ids().collect::<Vec<_>>(), vec!["f0", "f1", "f3"]);
        assert_eq!(merged.get("f1"), Some(&Some(obj(json!({"src": "cache"})))));
    }

    #[test]
    fn aggregate_writes_snapshot_and_current_before_clearing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = OutputLayout::new(temp.path());
        let cache = layout.cache();
        cache.write("f0", &Some(obj(json!({"n": 0}))))?;
        cache.write("f1", &Some(obj(json!({"n": 1}))))?;

        std::fs::write(cache.entry_path("f2"), b"[]")?;

        let outcome = aggregate_cache(&layout, LabelSet::new())?;
        assert_eq!(outcome.drained, 2);
        assert_eq!(outcome.rejected, vec!["f2".to_string()]);
        assert!(outcome.snapshot_path.starts_with(layout.snapshots_dir()));
        assert_eq!(LabelSet::load(&outcome.snapshot_path)?, outcome.labels);
        assert_eq!(LabelSet::load(&layout.current_labels())?, outcome.labels);
        assert!(!cache.exists());
        Ok(())
    }

    #[test]
    fn aggregate_with_empty_cache_still_snapshots() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let layout = OutputLayout::new(temp.path());

        let outcome = aggregate_cache(&layout, LabelSet::new())?;
        assert!(outcome.labels.is_empty());
        assert_eq!(layout.snapshots().list()?.len(), 1);
        Ok(())
    }
}
