//! Fetch layer: one [`Fetcher`] per source kind, wrapped by the
//! [`RetryExecutor`] for backoff, timeouts, and operation logging.

mod error;
pub mod feed;
pub mod generic;
pub mod html;
pub mod http;
pub mod retry;
pub mod robots;
pub mod structured;

pub use error::FetchError;
pub use feed::{FeedCursor, FeedFetcher};
pub use generic::GenericFetcher;
pub use http::HttpClient;
pub use retry::{AttemptRecord, RetryExecutor, RetryPolicy, RetryReport, Retryable};
pub use structured::StructuredFetcher;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lexwatch_core::{MonitorConfig, RawSnapshot, Source, SourceKind};

/// Retrieves the current document(s) behind a source.
///
/// Structured and generic fetchers return exactly one snapshot; a feed
/// returns one per unseen entry, possibly none.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, source: &Source) -> Result<Vec<RawSnapshot>, FetchError>;

    /// Acknowledge that the snapshots from the last `fetch` of `source` were
    /// all reconciled. Fetchers that track progress advance it here; until
    /// then the same snapshots are returned again.
    fn commit(&self, _source: &Source) {}
}

/// Fetchers by source kind.
#[derive(Clone, Default)]
pub struct FetcherSet {
    fetchers: HashMap<SourceKind, Arc<dyn Fetcher>>,
}

impl FetcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three standard fetchers sharing one HTTP client.
    pub fn standard(config: &MonitorConfig) -> Result<Self, FetchError> {
        let http = HttpClient::new(&config.user_agent)?;
        Ok(Self::new()
            .with(Arc::new(StructuredFetcher::new(http.clone())))
            .with(Arc::new(FeedFetcher::new(http.clone())))
            .with(Arc::new(GenericFetcher::new(http, config.respect_robots))))
    }

    /// Register `fetcher` for its kind, replacing any previous one.
    pub fn with(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.insert(fetcher);
        self
    }

    pub fn insert(&mut self, fetcher: Arc<dyn Fetcher>) {
        self.fetchers.insert(fetcher.kind(), fetcher);
    }

    pub fn get(&self, kind: SourceKind) -> Result<Arc<dyn Fetcher>, FetchError> {
        self.fetchers
            .get(&kind)
            .cloned()
            .ok_or(FetchError::Unsupported(kind))
    }
}
