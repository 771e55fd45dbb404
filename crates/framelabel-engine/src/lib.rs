mod aggregator;
mod client;
mod config;
mod encode;
mod error;
mod job;
mod pool;
mod processor;
mod scanner;

pub use aggregator::{
    aggregate_cache, merge_results, AggregationOutcome, CacheDrain, ResultAggregator,
};
pub use client::{
    AzureOpenAiClient, ClientSettings, DryrunClient, LabelClient, LabelClientRegistry,
    OpenAiClient,
};
pub use config::{
    normalize_extension, LabelJobConfig, LabelJobConfigBuilder, OutputLayout, DEFAULT_CONCURRENCY,
};
pub use encode::{encode_image, EncodedImage};
pub use error::{ConfigError, ItemError};
pub use job::{LabelJob, RunOutcome};
pub use pool::{PoolReport, ShutdownHandle, WorkerPool};
pub use processor::ItemProcessor;
pub use scanner::{list_candidates, JobScanner, ScanReport};
