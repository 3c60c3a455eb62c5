//! Web search tool backed by a Tavily-compatible search API.
//!
//! Used by the research executor to ground each plan step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use threadloom_core::error::ToolError;
use threadloom_core::tool::{Tool, ToolOutput};
use tracing::debug;

pub struct WebSearchTool {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, max_results: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_results: max_results.max(1),
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchHit {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

/// Numbered plain-text listing the oracle reads back.
fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results found.".into();
    }
    hits.iter()
        .enumerate()
        .map(|(i, h)| format!("{}. {}\n   {}\n   {}", i + 1, h.title, h.url, h.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns titles, URLs and content snippets."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let query = arguments["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;

        debug!(query, "Running web search");
        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "web_search".into(),
            reason,
        };

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&SearchRequest {
                api_key: &self.api_key,
                query,
                max_results: self.max_results,
            })
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("search API returned {}", response.status())));
        }

        let body: SearchResponse = response.json().await.map_err(|e| failed(e.to_string()))?;
        let hits: Vec<SearchHit> = body.results.into_iter().take(self.max_results).collect();

        Ok(ToolOutput::text(format_hits(&hits)))
    }
}
