//! Confluence retriever: CQL full-text search over the REST API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, RetrievalError};
use crate::retrieval::{ContextRetriever, SearchHit};

/// Confluence connection settings.
#[derive(Debug, Clone)]
pub struct ConfluenceConfig {
    /// Base URL including the context path, e.g. `https://acme.atlassian.net/wiki`.
    pub base_url: String,
    pub username: String,
    pub api_token: SecretString,
    pub request_timeout: Duration,
}

impl ConfluenceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("CONFLUENCE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CONFLUENCE_URL".into()))?;
        let username = std::env::var("CONFLUENCE_USERNAME")
            .map_err(|_| ConfigError::MissingEnvVar("CONFLUENCE_USERNAME".into()))?;
        let api_token = std::env::var("CONFLUENCE_API_TOKEN")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingEnvVar("CONFLUENCE_API_TOKEN".into()))?;
        let request_timeout = std::env::var("CONFLUENCE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(20));

        Ok(Self {
            base_url,
            username,
            api_token,
            request_timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ContentResult>,
}

#[derive(Debug, Deserialize)]
struct ContentResult {
    title: Option<String>,
    body: Option<ContentBody>,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    storage: Option<StorageValue>,
}

#[derive(Debug, Deserialize)]
struct StorageValue {
    value: String,
}

/// [`ContextRetriever`] backed by Confluence content search.
pub struct ConfluenceRetriever {
    http: reqwest::Client,
    config: ConfluenceConfig,
}

impl ConfluenceRetriever {
    pub fn new(config: ConfluenceConfig) -> Result<Self, RetrievalError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RetrievalError::RequestFailed {
                reason: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    fn search_url(&self) -> String {
        format!(
            "{}/rest/api/content/search",
            self.config.base_url.trim().trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ContextRetriever for ConfluenceRetriever {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, RetrievalError> {
        if query.trim().is_empty() || limit == 0 {
            debug!("Empty query, skipping Confluence search");
            return Ok(Vec::new());
        }

        let cql = build_cql(query);
        let limit = limit.to_string();
        let response = self
            .http
            .get(self.search_url())
            .query(&[
                ("cql", cql.as_str()),
                ("limit", limit.as_str()),
                ("expand", "body.storage"),
            ])
            .basic_auth(
                &self.config.username,
                Some(self.config.api_token.expose_secret()),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| RetrievalError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SearchResponse =
            response
                .json()
                .await
                .map_err(|e| RetrievalError::InvalidResponse {
                    reason: e.to_string(),
                })?;

        let hits: Vec<SearchHit> = parsed
            .results
            .into_iter()
            .map(|result| SearchHit {
                title: result.title,
                body: result
                    .body
                    .and_then(|b| b.storage)
                    .map(|s| strip_html(&s.value)),
            })
            .collect();
        debug!(hits = hits.len(), "Confluence search complete");
        Ok(hits)
    }
}

/// Full-text CQL query for free text. Quotes and backslashes are escaped.
pub fn build_cql(query: &str) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    let escaped = collapsed.replace('\\', "\\\\").replace('"', "\\\"");
    format!("text ~ \"{escaped}\"")
}

/// Strip storage-format markup down to its text. Character references
/// (`&amp;`, `&nbsp;`, `&#39;`) are decoded after the tags are gone.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                result.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    html_escape::decode_html_entities(&result)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn retriever_for(server: &MockServer) -> ConfluenceRetriever {
        ConfluenceRetriever::new(ConfluenceConfig {
            base_url: format!("{}/wiki/", server.uri()),
            username: "bot@example.com".into(),
            api_token: SecretString::from("token"),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    // ── Helpers ─────────────────────────────────────────────────────

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn strip_html_keeps_words_apart_across_blocks() {
        assert_eq!(
            strip_html("<p>Reset via</p><p>settings page.</p>"),
            "Reset via settings page."
        );
    }

    #[test]
    fn strip_html_nested_tags() {
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn strip_html_decodes_named_entities() {
        assert_eq!(
            strip_html("<p>Settings &gt; Security &amp; Privacy&nbsp;page</p>"),
            "Settings > Security & Privacy page"
        );
    }

    #[test]
    fn strip_html_decodes_numeric_references() {
        assert_eq!(strip_html("<p>It&#39;s under &#x41;dmin</p>"), "It's under Admin");
    }

    #[test]
    fn strip_html_keeps_escaped_angle_brackets_as_text() {
        assert_eq!(strip_html("<code>&lt;div&gt;</code>"), "<div>");
    }

    #[test]
    fn strip_html_plain_text_passthrough() {
        assert_eq!(strip_html("No markup here"), "No markup here");
    }

    #[test]
    fn cql_escapes_quotes() {
        assert_eq!(
            build_cql("reset \"admin\"\n password"),
            r#"text ~ "reset \"admin\" password""#
        );
    }

    // ── HTTP ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn search_maps_results_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/wiki/rest/api/content/search"))
            .and(query_param("limit", "5"))
            .and(query_param("expand", "body.storage"))
            .and(query_param("cql", "text ~ \"reset password\""))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"results": [
                    {"title": "Reset", "body": {"storage": {"value": "<p>Reset via settings page.</p>"}}},
                    {"title": "Attachment"},
                    {"title": "SSO", "body": {"storage": {"value": "SSO users reset in the IdP."}}}
                ]}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let hits = retriever_for(&server)
            .search("reset password", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].body.as_deref(), Some("Reset via settings page."));
        assert_eq!(hits[1].body, None);
        assert_eq!(hits[2].title.as_deref(), Some("SSO"));
        assert_eq!(
            crate::retrieval::build_context(&hits),
            "Reset via settings page.\n\nSSO users reset in the IdP.\n\n"
        );
    }

    #[tokio::test]
    async fn empty_query_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let hits = retriever_for(&server).search("   ", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = retriever_for(&server).search("x", 5).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("not json", "application/json"))
            .mount(&server)
            .await;

        let err = retriever_for(&server).search("x", 5).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidResponse { .. }));
    }
}
