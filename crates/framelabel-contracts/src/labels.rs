use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Parsed model output for one item. `None` is the marker for a response
/// that could not be parsed.
pub type LabelResult = Option<Map<String, Value>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub source: PathBuf,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
        }
    }

    /// Builds an item whose id is the file stem of `source`.
    pub fn from_path(source: &Path) -> Option<Self> {
        let id = source
            .file_stem()
            .and_then(|value| value.to_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        Some(Self::new(id, source))
    }
}

/// Ordered id → result mapping. Insertion order is kept in memory; every
/// persisted form is sorted ascending by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSet {
    entries: IndexMap<String, LabelResult>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces the result for `id`, returning the previous one.
    pub fn insert(&mut self, id: impl Into<String>, result: LabelResult) -> Option<LabelResult> {
        self.entries.insert(id.into(), result)
    }

    pub fn get(&self, id: &str) -> Option<&LabelResult> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LabelResult)> {
        self.entries.iter().map(|(id, result)| (id.as_str(), result))
    }

    /// Ids whose result is the malformed-response marker.
    pub fn malformed_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, result)| result.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Folds `other` into `self`; entries from `other` win on conflict.
    pub fn merge_preferring(&mut self, other: LabelSet) {
        for (id, result) in other.entries {
            self.entries.insert(id, result);
        }
    }

    pub fn sort_by_id(&mut self) {
        self.entries.sort_keys();
    }

    pub fn to_json(&self) -> Value {
        let mut sorted = self.entries.iter().collect::<Vec<_>>();
        sorted.sort_by(|(left, _), (right, _)| left.cmp(right));
        let mut out = Map::new();
        for (id, result) in sorted {
            let value = result.clone().map(Value::Object).unwrap_or(Value::Null);
            out.insert(id.clone(), value);
        }
        Value::Object(out)
    }

    pub fn from_json(value: Value) -> anyhow::Result<Self> {
        let Value::Object(rows) = value else {
            bail!("label set must be a JSON object");
        };
        let mut set = Self::new();
        for (id, row) in rows {
            match row {
                Value::Null => {
                    set.insert(id, None);
                }
                Value::Object(result) => {
                    set.insert(id, Some(result));
                }
                other => bail!(
                    "label for '{id}' must be an object or null, got {}",
                    json_kind(&other)
                ),
            }
        }
        set.sort_by_id();
        Ok(set)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        Self::from_json(parsed).with_context(|| format!("invalid label set {}", path.display()))
    }

    /// Writes the set as a pretty JSON object with ascending keys,
    /// replacing whatever is at `path`.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.to_json())?)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }
}

impl FromIterator<(String, LabelResult)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (String, LabelResult)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (id, result) in iter {
            set.insert(id, result);
        }
        set
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
