//! Web search seam, the Tavily client, and source formatting for note taking.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::SearchConfig;
use crate::security::sanitize_error_body;
use crate::{SecretValue, StackResearchError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchResult>,
}

/// Parameters of one search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: u8,
    pub include_raw_content: bool,
    pub topic: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: SearchRequest) -> Result<SearchResponse, StackResearchError>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: u8,
    include_raw_content: bool,
    topic: &'a str,
}

impl<'a> From<&'a SearchRequest> for TavilyRequest<'a> {
    fn from(request: &'a SearchRequest) -> Self {
        Self {
            query: &request.query,
            max_results: request.max_results,
            include_raw_content: request.include_raw_content,
            topic: &request.topic,
        }
    }
}

/// Tavily Search API client.
pub struct TavilyClient {
    client: reqwest::Client,
    base_url: String,
}

impl TavilyClient {
    pub fn new(config: &SearchConfig, api_key: SecretValue) -> Result<Self, StackResearchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key.expose())).map_err(
            |_| {
                StackResearchError::InvalidConfiguration(format!(
                    "{} contains characters not allowed in a header",
                    config.api_key_env
                ))
            },
        )?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    #[instrument(name = "search.tavily", skip(self, request), fields(query = %request.query))]
    async fn search(&self, request: SearchRequest) -> Result<SearchResponse, StackResearchError> {
        let body = TavilyRequest::from(&request);
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StackResearchError::Api {
                service: "tavily",
                status: status.as_u16(),
                body: sanitize_error_body(&text),
            });
        }

        let mut parsed: SearchResponse = response.json().await?;
        if parsed.query.is_empty() {
            parsed.query = request.query;
        }
        debug!(results = parsed.results.len(), "tavily search completed");
        Ok(parsed)
    }
}

/// Notes source used when live search is unavailable.
pub fn fallback_sources(error: &str) -> String {
    format!(
        "Unable to perform live research due to an error: {error}\n\n\
         Proceeding with general best practices and common technology patterns for the given requirements.\n\
         Note: These recommendations will be based on general knowledge rather than current research.\n\n\
         Consider visiting the following resources manually:\n\
         - GitHub trending repositories\n\
         - Technology comparison sites\n\
         - Stack Overflow insights\n\
         - Tech blogs and case studies"
    )
}

/// Results across all responses with duplicate URLs removed; the first occurrence wins.
pub fn unique_results(responses: &[SearchResponse]) -> Vec<&SearchResult> {
    let mut seen = HashSet::new();
    responses
        .iter()
        .flat_map(|response| response.results.iter())
        .filter(|result| seen.insert(result.url.as_str()))
        .collect()
}

/// Render deduplicated sources as the `Sources:` block handed to the note taker.
///
/// Raw page content is cut to `max_tokens_per_source * 4` characters.
pub fn format_sources(
    responses: &[SearchResponse],
    max_tokens_per_source: usize,
    include_raw_content: bool,
) -> String {
    let char_limit = max_tokens_per_source.saturating_mul(4);
    let mut output = String::from("Sources:\n\n");

    for source in unique_results(responses) {
        let _ = writeln!(output, "Source {}:\n===", source.title);
        let _ = writeln!(output, "URL: {}\n===", source.url);
        let _ = writeln!(
            output,
            "Most relevant content from source: {}\n===",
            source.content
        );
        if include_raw_content {
            let raw = source.raw_content.as_deref().unwrap_or_default();
            let raw = if raw.chars().count() > char_limit {
                let cut: String = raw.chars().take(char_limit).collect();
                format!("{cut}... [truncated]")
            } else {
                raw.to_string()
            };
            let _ = writeln!(
                output,
                "Full source content limited to {max_tokens_per_source} tokens: {raw}\n"
            );
        }
    }

    output.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(title: &str, url: &str, raw: Option<&str>) -> SearchResult {
        SearchResult {
            title: title.to_string(),
            url: url.to_string(),
            content: format!("{title} summary"),
            raw_content: raw.map(str::to_string),
            score: Some(0.9),
        }
    }

    #[test]
    fn tavily_body_carries_search_parameters() {
        let request = SearchRequest {
            query: "rust web frameworks".into(),
            max_results: 3,
            include_raw_content: true,
            topic: "general".into(),
        };
        let value = serde_json::to_value(TavilyRequest::from(&request)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "query": "rust web frameworks",
                "max_results": 3,
                "include_raw_content": true,
                "topic": "general"
            })
        );
    }

    #[test]
    fn duplicate_urls_are_listed_once() {
        let responses = vec![
            SearchResponse {
                query: "a".into(),
                results: vec![
                    result("Axum guide", "https://a.dev", None),
                    result("Postgres tips", "https://b.dev", None),
                ],
            },
            SearchResponse {
                query: "b".into(),
                results: vec![result("Axum again", "https://a.dev", None)],
            },
        ];

        let formatted = format_sources(&responses, 10, false);
        assert_eq!(formatted.matches("URL: https://a.dev").count(), 1);
        assert!(formatted.contains("Source Axum guide:"));
        assert!(!formatted.contains("Axum again"));
        assert!(formatted.starts_with("Sources:"));
        assert!(!formatted.contains("Full source content"));
    }

    #[test]
    fn raw_content_is_truncated_by_token_budget() {
        let long = "é".repeat(50);
        let responses = vec![SearchResponse {
            query: "q".into(),
            results: vec![
                result("Long", "https://long.dev", Some(&long)),
                result("Missing", "https://none.dev", None),
            ],
        }];

        let formatted = format_sources(&responses, 5, true);
        let expected = format!(
            "Full source content limited to 5 tokens: {}... [truncated]",
            "é".repeat(20)
        );
        assert!(formatted.contains(&expected), "{formatted}");
        assert!(formatted.ends_with("Full source content limited to 5 tokens:"));
    }

    #[test]
    fn tavily_payload_shape() {
        let raw = serde_json::json!({
            "query": "rust web frameworks",
            "response_time": 1.2,
            "results": [
                {"title": "Axum", "url": "https://axum.rs", "content": "fast", "score": 0.8, "raw_content": null}
            ]
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!(parsed.results[0].raw_content.is_none());
    }

    #[test]
    fn fallback_mentions_error() {
        let text = fallback_sources("timeout");
        assert!(text.starts_with("Unable to perform live research due to an error: timeout"));
    }
}
