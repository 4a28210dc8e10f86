//! Web search through the Tavily API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sleuth_research::{ResearchTool, ToolExecutionError};
use tokio_util::sync::CancellationToken;

const TAVILY_URL: &str = "https://api.tavily.com/search";

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'static str,
    max_results: u32,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    published_date: Option<String>,
}

/// `web_search` tool backed by Tavily
pub struct WebSearchTool {
    api_key: String,
    client: Client,
    max_results: u32,
}

impl WebSearchTool {
    pub fn new(api_key: String, max_results: u32) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("sleuth/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            api_key,
            client,
            max_results,
        })
    }

    async fn search(&self, query: &str, max_results: u32) -> Result<SearchResponse, ToolExecutionError> {
        let request = SearchRequest {
            api_key: &self.api_key,
            query,
            search_depth: "basic",
            max_results,
            include_answer: true,
        };

        let response = self
            .client
            .post(TAVILY_URL)
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("search request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolExecutionError::Failed(match status {
                StatusCode::TOO_MANY_REQUESTS => "search rate limit exceeded".to_string(),
                StatusCode::UNAUTHORIZED => "invalid Tavily API key".to_string(),
                _ => format!("Tavily API error {}: {}", status, body),
            }));
        }

        response
            .json()
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("failed to parse search response: {}", e)))
    }
}

#[async_trait]
impl ResearchTool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs and snippets for the top results. \
         Cite sources by their URL."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The search query"
                },
                "max_results": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 20,
                    "description": "Number of results to return"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let query = arguments["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolExecutionError::InvalidArguments("query is required".into()))?;
        let max_results = arguments["max_results"]
            .as_u64()
            .map(|n| n as u32)
            .unwrap_or(self.max_results);

        tracing::debug!(query, max_results, "web search");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolExecutionError::Cancelled),
            response = self.search(query, max_results) => response?,
        };

        Ok(format_results(query, &response))
    }
}

fn format_results(query: &str, response: &SearchResponse) -> String {
    if response.results.is_empty() {
        return format!("No results found for '{}'.", query);
    }

    let mut out = format!("Search results for '{}':\n", query);
    if let Some(answer) = response.answer.as_deref().filter(|a| !a.is_empty()) {
        out.push_str(&format!("\nSummary: {}\n", answer));
    }
    for (i, hit) in response.results.iter().enumerate() {
        out.push_str(&format!("\n--- SOURCE {}: {} ---\nURL: {}\n", i + 1, hit.title, hit.url));
        if let Some(date) = &hit.published_date {
            out.push_str(&format!("Published: {}\n", date));
        }
        out.push_str(&hit.content);
        out.push('\n');
    }
    out
}
