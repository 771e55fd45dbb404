use std::sync::Arc;

use framelabel_contracts::labels::{LabelResult, WorkItem};
use framelabel_contracts::parse::parse_label_response;
use framelabel_contracts::runs::cache::CacheDir;

use crate::client::LabelClient;
use crate::encode::encode_image;
use crate::error::{error_chain_text, ItemError};

const ERROR_TEXT_MAX_CHARS: usize = 600;

/// Labels one work item end to end and spills the result to the cache.
///
/// Holds only read-only state so one instance can be shared by every
/// worker thread.
pub struct ItemProcessor {
    client: Arc<dyn LabelClient>,
    prompt: String,
    cache: CacheDir,
    max_image_dim: Option<u32>,
}

impl ItemProcessor {
    pub fn new(client: Arc<dyn LabelClient>, prompt: impl Into<String>, cache: CacheDir) -> Self {
        Self {
            client,
            prompt: prompt.into(),
            cache,
            max_image_dim: None,
        }
    }

    pub fn with_max_image_dim(mut self, max_dim: Option<u32>) -> Self {
        self.max_image_dim = max_dim;
        self
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Encode, call, parse, write through. A malformed response is cached
    /// as the null marker; encode and call failures leave no cache entry.
    pub fn process(&self, item: &WorkItem) -> Result<LabelResult, ItemError> {
        let image =
            encode_image(&item.source, self.max_image_dim).map_err(|err| ItemError::Encoding {
                id: item.id.clone(),
                message: error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
            })?;

        let text = self
            .client
            .label(&image, &self.prompt)
            .map_err(|err| ItemError::RemoteCall {
                id: item.id.clone(),
                message: error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
            })?;

        let result = match parse_label_response(&text) {
            Ok(object) => Some(object),
            Err(err) => {
                tracing::warn!(item_id = %item.id, error = %err, "caching null label");
                None
            }
        };

        self.cache
            .write(&item.id, &result)
            .map_err(|source| ItemError::CacheIo {
                id: item.id.clone(),
                source,
            })?;
        tracing::debug!(item_id = %item.id, "label cached");
        Ok(result)
    }
}
