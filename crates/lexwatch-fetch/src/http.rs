//! Shared HTTP client for all fetchers.

use std::time::Duration;

use tracing::debug;

use crate::FetchError;

/// Longest response body kept in a [`FetchError::Server`].
const ERROR_BODY_LIMIT: usize = 512;

/// Thin wrapper over `reqwest::Client` that sends our user agent and maps
/// non-success statuses to [`FetchError::Server`].
///
/// Per-attempt timeouts are applied by the retry executor, not here.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET `url` and return the body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        debug!(url = %url, "GET");
        let resp = self.client.get(url).send().await?;
        read_body(resp).await
    }

    /// GET `url` with query parameters and return the body as text.
    pub async fn get_with_query(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        debug!(url = %url, "GET with query");
        let resp = self.client.get(url).query(query).send().await?;
        read_body(resp).await
    }
}

async fn read_body(resp: reqwest::Response) -> Result<String, FetchError> {
    let status = resp.status();
    if !status.is_success() {
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(FetchError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.text().await?)
}
