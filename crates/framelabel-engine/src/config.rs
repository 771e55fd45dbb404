use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use framelabel_contracts::runs::cache::CacheDir;
use framelabel_contracts::runs::snapshots::SnapshotStore;

use crate::error::ConfigError;
use crate::scanner::JobScanner;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_IMAGE_EXTENSION: &str = "jpg";

/// Fixed file names under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(".label_cache")
    }

    /// Cache entries that could not be loaded are moved here.
    pub fn rejected_dir(&self) -> PathBuf {
        self.root.join("rejected_cache")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn current_labels(&self) -> PathBuf {
        self.root.join("labels.json")
    }

    pub fn events(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join("summary.json")
    }

    pub fn cache(&self) -> CacheDir {
        CacheDir::new(self.cache_dir())
    }

    pub fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(self.snapshots_dir())
    }
}

/// Everything one labeling run needs, validated once at construction.
#[derive(Debug, Clone)]
pub struct LabelJobConfig {
    pub input_dir: PathBuf,
    pub layout: OutputLayout,
    pub prompt_path: PathBuf,
    pub prompt: String,
    pub concurrency: usize,
    pub image_extension: String,
    pub max_image_dim: Option<u32>,
    pub deadline: Option<Duration>,
    pub retry_malformed: bool,
}

impl LabelJobConfig {
    pub fn builder(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        prompt_path: impl Into<PathBuf>,
    ) -> LabelJobConfigBuilder {
        LabelJobConfigBuilder {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            prompt_path: prompt_path.into(),
            concurrency: DEFAULT_CONCURRENCY,
            image_extension: DEFAULT_IMAGE_EXTENSION.to_string(),
            max_image_dim: None,
            deadline: None,
            retry_malformed: false,
        }
    }

    pub fn scanner(&self) -> JobScanner {
        JobScanner::new(
            self.image_extension.clone(),
            self.layout.snapshots(),
            self.layout.cache(),
        )
        .retry_malformed(self.retry_malformed)
    }
}

#[derive(Debug, Clone)]
pub struct LabelJobConfigBuilder {
    input_dir: PathBuf,
    output_dir: PathBuf,
    prompt_path: PathBuf,
    concurrency: usize,
    image_extension: String,
    max_image_dim: Option<u32>,
    deadline: Option<Duration>,
    retry_malformed: bool,
}

impl LabelJobConfigBuilder {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn image_extension(mut self, extension: impl Into<String>) -> Self {
        self.image_extension = extension.into();
        self
    }

    pub fn max_image_dim(mut self, max_dim: Option<u32>) -> Self {
        self.max_image_dim = max_dim;
        self
    }

    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn retry_malformed(mut self, retry: bool) -> Self {
        self.retry_malformed = retry;
        self
    }

    pub fn build(self) -> Result<LabelJobConfig, ConfigError> {
        require_dir("input directory", &self.input_dir)?;
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        let image_extension = normalize_extension(&self.image_extension)?;

        let prompt = fs::read_to_string(&self.prompt_path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::MissingPath {
                    field: "prompt file",
                    path: self.prompt_path.clone(),
                }
            } else {
                ConfigError::Prompt {
                    path: self.prompt_path.clone(),
                    source,
                }
            }
        })?;
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(ConfigError::EmptyPrompt(self.prompt_path));
        }

        if self.output_dir.exists() && !self.output_dir.is_dir() {
            return Err(ConfigError::NotADirectory {
                field: "output directory",
                path: self.output_dir,
            });
        }
        fs::create_dir_all(&self.output_dir).map_err(|source| ConfigError::OutputDir {
            path: self.output_dir.clone(),
            source,
        })?;

        Ok(LabelJobConfig {
            input_dir: self.input_dir,
            layout: OutputLayout::new(self.output_dir),
            prompt_path: self.prompt_path,
            prompt,
            concurrency: self.concurrency,
            image_extension,
            max_image_dim: self.max_image_dim,
            deadline: self.deadline,
            retry_malformed: self.retry_malformed,
        })
    }
}

pub(crate) fn require_dir(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingPath {
            field,
            path: path.to_path_buf(),
        });
    }
    if !path.is_dir() {
        return Err(ConfigError::NotADirectory {
            field,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Lowercased extension without a leading dot; empty is an error.
pub fn normalize_extension(raw: &str) -> Result<String, ConfigError> {
    let ext = raw.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() {
        return Err(ConfigError::EmptyExtension);
    }
    Ok(ext)
}
