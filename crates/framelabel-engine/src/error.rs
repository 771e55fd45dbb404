use std::path::PathBuf;

use framelabel_contracts::runs::cache::CacheError;
use thiserror::Error;

/// Problems found while assembling a job, before anything is dispatched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} does not exist: {path}")]
    MissingPath { field: &'static str, path: PathBuf },
    #[error("{field} must be a directory: {path}")]
    NotADirectory { field: &'static str, path: PathBuf },
    #[error("failed reading prompt {path}: {source}")]
    Prompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt file is empty: {0}")]
    EmptyPrompt(PathBuf),
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("image extension must not be empty")]
    EmptyExtension,
    #[error("failed preparing output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("label client '{client}' needs {missing}")]
    MissingCredential { client: String, missing: String },
    #[error("unknown label client '{0}' (available: {1})")]
    UnknownClient(String, String),
    #[error("failed building HTTP client: {0}")]
    HttpClient(String),
}

/// Failure of one work item. Only `CacheIo` stops the run; the others
/// drop the item so the next run picks it up again.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("encoding {id} failed: {message}")]
    Encoding { id: String, message: String },
    #[error("label call for {id} failed: {message}")]
    RemoteCall { id: String, message: String },
    #[error("processing {id} panicked: {message}")]
    Panicked { id: String, message: String },
    #[error("writing cache entry for {id} failed: {source}")]
    CacheIo {
        id: String,
        #[source]
        source: CacheError,
    },
}

impl ItemError {
    pub fn item_id(&self) -> &str {
        match self {
            Self::Encoding { id, .. }
            | Self::RemoteCall { id, .. }
            | Self::Panicked { id, .. }
            | Self::CacheIo { id, .. } => id,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CacheIo { .. })
    }
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
