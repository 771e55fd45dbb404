use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;

use crate::labels::LabelResult;

const ENTRY_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache entry {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache entry {path} must hold an object or null")]
    InvalidEntry { path: PathBuf },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the entry exists but its content can never be loaded.
    pub fn is_unreadable_entry(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::InvalidEntry { .. })
    }
}

/// Directory of per-item spill files, `<dir>/<item id>.json`.
///
/// Each entry is written once through a temp file and a rename, so a reader
/// never observes a half-written entry. Writing the same id twice replaces
/// the earlier entry.
#[derive(Debug, Clone)]
pub struct CacheDir {
    path: PathBuf,
}

impl CacheDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn entry_path(&self, id: &str) -> PathBuf {
        self.path.join(format!("{id}.{ENTRY_EXTENSION}"))
    }

    pub fn write(&self, id: &str, result: &LabelResult) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&self.path).map_err(|err| CacheError::io(&self.path, err))?;
        let value = result.clone().map(Value::Object).unwrap_or(Value::Null);
        let encoded = serde_json::to_vec_pretty(&value).map_err(|err| CacheError::Corrupt {
            path: self.entry_path(id),
            source: err,
        })?;

        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp_path = self.path.join(format!(
            ".{id}.{}-{seq}{TEMP_SUFFIX}",
            std::process::id()
        ));
        fs::write(&temp_path, encoded).map_err(|err| CacheError::io(&temp_path, err))?;
        let final_path = self.entry_path(id);
        if let Err(err) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(CacheError::io(&final_path, err));
        }
        Ok(final_path)
    }

    pub fn read(&self, id: &str) -> Result<LabelResult, CacheError> {
        let path = self.entry_path(id);
        let raw = fs::read(&path).map_err(|err| CacheError::io(&path, err))?;
        let parsed: Value = serde_json::from_slice(&raw).map_err(|err| CacheError::Corrupt {
            path: path.clone(),
            source: err,
        })?;
        match parsed {
            Value::Null => Ok(None),
            Value::Object(object) => Ok(Some(object)),
            _ => Err(CacheError::InvalidEntry { path }),
        }
    }

    pub fn remove(&self, id: &str) -> Result<(), CacheError> {
        let path = self.entry_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::io(&path, err)),
        }
    }

    /// Ids of committed entries, ascending. A missing directory has none.
    pub fn ids(&self) -> Result<Vec<String>, CacheError> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::io(&self.path, err)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(&self.path, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
                continue;
            };
            if is_temp_name(name) {
                continue;
            }
            let Some(id) = name.strip_suffix(&format!(".{ENTRY_EXTENSION}")) else {
                continue;
            };
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Deletes temp files left behind by writers that died mid-write.
    pub fn remove_stale_temp_files(&self) -> Result<usize, CacheError> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(CacheError::io(&self.path, err)),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(&self.path, err))?;
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|value| value.to_str())
                .map(is_temp_name)
                .unwrap_or(false);
            if is_temp && path.is_file() {
                fs::remove_file(&path).map_err(|err| CacheError::io(&path, err))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Moves the entry for `id` into `dest_dir`, taking it out of the id
    /// namespace. An entry already quarantined under the same id is replaced.
    pub fn quarantine(&self, id: &str, dest_dir: &Path) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(dest_dir).map_err(|err| CacheError::io(dest_dir, err))?;
        let source = self.entry_path(id);
        let dest = dest_dir.join(format!("{id}.{ENTRY_EXTENSION}"));
        fs::rename(&source, &dest).map_err(|err| CacheError::io(&source, err))?;
        Ok(dest)
    }

    /// Removes the directory if nothing is left in it. Returns whether the
    /// directory is gone afterwards.
    pub fn remove_if_empty(&self) -> Result<bool, CacheError> {
        let mut entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(CacheError::io(&self.path, err)),
        };
        if entries.next().is_some() {
            return Ok(false);
        }
        fs::remove_dir(&self.path).map_err(|err| CacheError::io(&self.path, err))?;
        Ok(true)
    }
}

/// Temp files end in `.tmp` and never in `.json`, so they cannot be taken
/// for an entry whatever the item id looks like.
fn is_temp_name(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}
