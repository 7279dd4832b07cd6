//! Structured metadata endpoint (SPARQL over the official journal's
//! legislation identifiers).

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use lexwatch_core::{RawSnapshot, Source, SourceKind};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::html::{extract_text, looks_like_html};
use crate::http::HttpClient;
use crate::{FetchError, Fetcher};

/// Public SPARQL endpoint used when a source only carries a document URL.
pub const DEFAULT_SPARQL_ENDPOINT: &str = "https://publications.europa.eu/webapi/rdf/sparql";

const RESULTS_FORMAT: &str = "application/sparql-results+json";

static CELEX_IN_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)CELEX(?::|%3A)([0-9A-Z]+)").unwrap());

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Za-z()._-]+$").unwrap());

/// Latest English expression of the work with the given local identifier.
fn latest_version_query(external_id: &str) -> String {
    format!(
        r#"PREFIX eli: <http://data.europa.eu/eli/ontology#>
PREFIX dcterms: <http://purl.org/dc/terms/>
SELECT ?date ?version ?text ?title WHERE {{
  ?work eli:is_realised_by/eli:date_publication ?date ;
        eli:is_member_of/eli:id_local ?celex_id .
  ?expr eli:is_embodiment_of ?work ;
        eli:language <http://publications.europa.eu/resource/authority/language/ENG> ;
        eli:version ?version ;
        eli:content ?text .
  OPTIONAL {{ ?work dcterms:title ?title }}
  FILTER(?celex_id = "{external_id}")
}}
ORDER BY DESC(?date) LIMIT 1"#
    )
}

#[derive(Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<HashMap<String, SparqlValue>>,
}

#[derive(Deserialize)]
struct SparqlValue {
    value: String,
}

/// Fields of the first result binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredDocument {
    pub title: Option<String>,
    pub version: Option<String>,
    pub date: Option<String>,
    pub text: String,
}

/// Parse a `sparql-results+json` payload.
pub fn parse_results(body: &str) -> Result<StructuredDocument, FetchError> {
    let resp: SparqlResponse = serde_json::from_str(body)?;
    let mut binding = resp
        .results
        .bindings
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::Malformed("query returned no bindings".into()))?;
    let mut take = |name: &str| {
        binding
            .remove(name)
            .map(|v| v.value.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let text = take("text").ok_or_else(|| FetchError::Malformed("binding has no text".into()))?;
    Ok(StructuredDocument {
        title: take("title"),
        version: take("version"),
        date: take("date"),
        text,
    })
}

/// Pull `CELEX:32024R1689` (or its URL-encoded form) out of a document URL.
pub fn external_id_from_url(url: &str) -> Option<String> {
    CELEX_IN_URL_RE
        .captures(url)
        .map(|c| c[1].to_ascii_uppercase())
}

/// Queries a SPARQL endpoint by the source's external identifier.
///
/// A source with an explicit `external_id` names the endpoint in its URL.
/// Otherwise the identifier is taken from the URL and the query goes to
/// the configured endpoint.
pub struct StructuredFetcher {
    http: HttpClient,
    endpoint: String,
}

impl StructuredFetcher {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            endpoint: DEFAULT_SPARQL_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn resolve<'a>(&'a self, source: &'a Source) -> Result<(String, &'a str), FetchError> {
        let (external_id, endpoint) = match source.external_id() {
            Some(id) => (id.trim().to_string(), source.url()),
            None => {
                let id = external_id_from_url(source.url())
                    .ok_or_else(|| FetchError::MissingExternalId(source.id().to_string()))?;
                (id, self.endpoint.as_str())
            }
        };
        if !IDENTIFIER_RE.is_match(&external_id) {
            return Err(FetchError::Malformed(format!(
                "invalid external identifier {external_id:?}"
            )));
        }
        Ok((external_id, endpoint))
    }
}

#[async_trait]
impl Fetcher for StructuredFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Structured
    }

    async fn fetch(&self, source: &Source) -> Result<Vec<RawSnapshot>, FetchError> {
        let (external_id, endpoint) = self.resolve(source)?;
        let query = latest_version_query(&external_id);

        info!(source_id = source.id(), external_id = %external_id, "querying structured endpoint");
        let body = self
            .http
            .get_with_query(endpoint, &[("query", query.as_str()), ("format", RESULTS_FORMAT)])
            .await?;
        let doc = parse_results(&body)?;

        let text = if looks_like_html(&doc.text) {
            extract_text(&doc.text)
        } else {
            doc.text
        };
        if text.trim().is_empty() {
            return Err(FetchError::Malformed("document text is empty".into()));
        }

        let version = doc.version.or(doc.date).unwrap_or_default();
        let title = doc.title.unwrap_or_else(|| external_id.clone());
        Ok(vec![RawSnapshot::new(
            source.id(),
            external_id,
            source.url(),
            title,
            version,
            text,
            Utc::now(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexwatch_core::PollFrequency;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bindings(text: &str) -> serde_json::Value {
        json!({
            "head": { "vars": ["date", "version", "text", "title"] },
            "results": { "bindings": [{
                "date": { "type": "literal", "value": "2024-07-12" },
                "version": { "type": "literal", "value": "OJ L 2024/1689" },
                "text": { "type": "literal", "value": text },
                "title": { "type": "literal", "value": "Artificial Intelligence Act" }
            }]}
        })
    }

    fn source(url: String) -> Source {
        Source::new("eurlex_ai_act", url, SourceKind::Structured, "6h".parse().unwrap())
            .with_external_id("32024R1689")
    }

    #[test]
    fn extracts_celex_from_url() {
        assert_eq!(
            external_id_from_url("https://eur-lex.europa.eu/legal-content/EN/TXT/?uri=CELEX:32024R1689").as_deref(),
            Some("32024R1689")
        );
        assert_eq!(
            external_id_from_url("https://eur-lex.europa.eu/legal-content/EN/TXT/?uri=celex%3a32016r0679").as_deref(),
            Some("32016R0679")
        );
        assert_eq!(external_id_from_url("https://example.org/act"), None);
    }

    #[test]
    fn parse_rejects_empty_bindings() {
        let body = json!({ "results": { "bindings": [] } }).to_string();
        assert!(matches!(parse_results(&body), Err(FetchError::Malformed(_))));
    }

    #[test]
    fn parse_rejects_missing_text() {
        let body = json!({ "results": { "bindings": [{ "title": { "value": "x" } }] } }).to_string();
        assert!(matches!(parse_results(&body), Err(FetchError::Malformed(_))));
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(matches!(parse_results("<html>"), Err(FetchError::Malformed(_))));
    }

    #[tokio::test]
    async fn fetches_latest_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("format", RESULTS_FORMAT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(bindings("Article 9\nRisk management system\n1. Text.")),
            )
            .mount(&server)
            .await;

        let fetcher = StructuredFetcher::new(HttpClient::new("lexwatch-test").unwrap());
        let snaps = fetcher.fetch(&source(server.uri())).await.unwrap();
        assert_eq!(snaps.len(), 1);
        let snap = &snaps[0];
        assert_eq!(snap.document_key, "32024R1689");
        assert_eq!(snap.title, "Artificial Intelligence Act");
        assert_eq!(snap.version_label, "OJ L 2024/1689");
        assert!(snap.full_text.starts_with("Article 9"));
        assert_eq!(snap.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn html_content_is_flattened() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(bindings("<div><p>Article 1</p><p>Subject matter</p></div>")),
            )
            .mount(&server)
            .await;

        let fetcher = StructuredFetcher::new(HttpClient::new("lexwatch-test").unwrap());
        let snaps = fetcher.fetch(&source(server.uri())).await.unwrap();
        assert_eq!(snaps[0].full_text, "Article 1\n\nSubject matter");
    }

    #[tokio::test]
    async fn missing_identifier_is_terminal() {
        let fetcher = StructuredFetcher::new(HttpClient::new("lexwatch-test").unwrap());
        let source = Source::new(
            "nameless",
            "https://example.org/act",
            SourceKind::Structured,
            PollFrequency::OnTrigger,
        );
        let err = fetcher.fetch(&source).await.unwrap_err();
        assert!(matches!(err, FetchError::MissingExternalId(ref id) if id == "nameless"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn identifier_from_url_uses_configured_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(bindings("Article 1")))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = StructuredFetcher::new(HttpClient::new("lexwatch-test").unwrap())
            .with_endpoint(server.uri());
        let source = Source::new(
            "gdpr",
            "https://eur-lex.europa.eu/legal-content/EN/TXT/?uri=CELEX:32016R0679",
            SourceKind::Structured,
            PollFrequency::OnTrigger,
        );
        let snaps = fetcher.fetch(&source).await.unwrap();
        assert_eq!(snaps[0].document_key, "32016R0679");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let fetcher = StructuredFetcher::new(HttpClient::new("lexwatch-test").unwrap());
        let err = fetcher.fetch(&source(server.uri())).await.unwrap_err();
        assert!(err.is_transient());
    }
}
