//! Plain web pages.

use async_trait::async_trait;
use chrono::Utc;
use lexwatch_core::{RawSnapshot, Source, SourceKind};
use tracing::info;
use url::Url;

use crate::html::{extract_text, extract_title};
use crate::http::HttpClient;
use crate::{FetchError, Fetcher, robots};

/// Fetches a page and keeps its main body text. The source id doubles as
/// the document key, so one page maps to one regulation.
pub struct GenericFetcher {
    http: HttpClient,
    respect_robots: bool,
}

impl GenericFetcher {
    pub fn new(http: HttpClient, respect_robots: bool) -> Self {
        Self {
            http,
            respect_robots,
        }
    }
}

#[async_trait]
impl Fetcher for GenericFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Generic
    }

    async fn fetch(&self, source: &Source) -> Result<Vec<RawSnapshot>, FetchError> {
        let url = Url::parse(source.url())
            .map_err(|e| FetchError::Malformed(format!("invalid url {}: {e}", source.url())))?;

        if self.respect_robots && !robots::is_allowed(&self.http, &url).await {
            return Err(FetchError::RobotsDisallowed(url.to_string()));
        }

        let html = self.http.get_text(url.as_str()).await?;
        let text = extract_text(&html);
        if text.is_empty() {
            return Err(FetchError::Malformed("page has no body text".into()));
        }
        let title = extract_title(&html).unwrap_or_else(|| source.id().to_string());
        let fetched_at = Utc::now();

        info!(source_id = source.id(), chars = text.len(), "fetched page");
        Ok(vec![RawSnapshot::new(
            source.id(),
            source.id(),
            source.url(),
            title,
            fetched_at.format("%Y-%m-%d").to_string(),
            text,
            fetched_at,
        )])
    }
}
