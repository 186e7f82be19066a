//! Exa-compatible web search client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::truncate::truncate_chars;
use crate::io::sandbox::ToolError;

const MAX_SNIPPET_CHARS: usize = 500;

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl WebResult {
    pub fn render(&self) -> String {
        if self.snippet.is_empty() {
            format!("{}\n  {}", self.title, self.url)
        } else {
            format!("{}\n  {}\n  {}", self.title, self.url, self.snippet)
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    text: Option<String>,
}

/// Blocking client for `POST {base_url}/search`.
#[derive(Debug, Clone)]
pub struct WebSearchClient {
    http: reqwest::blocking::Client,
    api_key: String,
    base_url: String,
}

impl WebSearchClient {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[instrument(skip_all, fields(num_results))]
    pub fn search(&self, query: &str, num_results: usize) -> Result<Vec<WebResult>, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: "web_search".to_string(),
                reason: "query must not be empty".to_string(),
            });
        }
        let url = format!("{}/search", self.base_url);
        debug!(url = %url, "sending web search");
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&json!({
                "query": query,
                "numResults": num_results.clamp(1, 100),
                "contents": {"text": {"maxCharacters": MAX_SNIPPET_CHARS}},
            }))
            .send()
            .map_err(|err| ToolError::Failed(format!("web search request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let (body, _) = truncate_chars(&body, 300);
            warn!(status = status.as_u16(), "web search returned error status");
            return Err(ToolError::Failed(format!(
                "web search returned HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .map_err(|err| ToolError::Failed(format!("parse web search response: {err}")))?;
        Ok(parsed
            .results
            .into_iter()
            .map(|raw| {
                let snippet = raw.text.unwrap_or_default();
                let (snippet, _) = truncate_chars(snippet.trim(), MAX_SNIPPET_CHARS);
                WebResult {
                    title: raw.title.unwrap_or_else(|| raw.url.clone()),
                    url: raw.url,
                    snippet,
                }
            })
            .collect())
    }
}
