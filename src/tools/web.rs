//! Web search tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ensure_object, required_str, Tool, ToolError, ToolKind};
use crate::settings::SharedSettingsStore;

const DEFAULT_NUM_RESULTS: u64 = 5;
const MAX_NUM_RESULTS: u64 = 10;

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

/// Where search results come from.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, num_results: u64) -> Result<Vec<SearchHit>, ToolError>;
}

/// Search the web for a query.
pub struct WebSearch {
    backend: Box<dyn SearchBackend>,
}

impl WebSearch {
    pub fn new(backend: impl SearchBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    fn parse_args(args: &Value) -> Result<(String, u64), ToolError> {
        ensure_object(args)?;
        let query = required_str(args, "query")?;
        let num_results = match args.get("num_results") {
            None | Some(Value::Null) => DEFAULT_NUM_RESULTS,
            Some(v) => v
                .as_u64()
                .filter(|n| (1..=MAX_NUM_RESULTS).contains(n))
                .ok_or_else(|| {
                    ToolError::Validation(format!(
                        "'num_results' must be an integer between 1 and {}",
                        MAX_NUM_RESULTS
                    ))
                })?,
        };
        Ok((query.trim().to_string(), num_results))
    }
}

#[async_trait]
impl Tool for WebSearch {
    fn kind(&self) -> ToolKind {
        ToolKind::GoogleSearch
    }

    fn display_name(&self) -> &str {
        "Google Search"
    }

    fn description(&self) -> &str {
        "Search the web using Google Custom Search API"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query to execute"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Number of results to return (1-10)",
                    "minimum": 1,
                    "maximum": MAX_NUM_RESULTS,
                    "default": DEFAULT_NUM_RESULTS
                }
            },
            "required": ["query"]
        })
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse_args(args).map(|_| ())
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let (query, num_results) = Self::parse_args(&args)?;
        tracing::info!(query = %query, num_results, "Running web search");

        let mut results = self.backend.search(&query, num_results).await?;
        results.truncate(num_results as usize);

        Ok(json!({
            "query": query,
            "total_results": results.len(),
            "results": results,
        }))
    }
}

/// Google Custom Search JSON API.
///
/// Needs the `api_key` and `search_engine_id` credentials of the
/// `google_search` tool in the settings store.
pub struct GoogleSearchBackend {
    client: reqwest::Client,
    settings: SharedSettingsStore,
}

impl GoogleSearchBackend {
    const ENDPOINT: &'static str = "https://www.googleapis.com/customsearch/v1";

    pub fn new(client: reqwest::Client, settings: SharedSettingsStore) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl SearchBackend for GoogleSearchBackend {
    async fn search(&self, query: &str, num_results: u64) -> Result<Vec<SearchHit>, ToolError> {
        let config = self.settings.tool_config().await;
        let api_key = config
            .credential(ToolKind::GoogleSearch, "api_key")
            .ok_or_else(|| ToolError::Execution("Google Search is not configured: missing api_key".to_string()))?;
        let engine_id = config
            .credential(ToolKind::GoogleSearch, "search_engine_id")
            .ok_or_else(|| {
                ToolError::Execution("Google Search is not configured: missing search_engine_id".to_string())
            })?;

        let url = format!(
            "{}?key={}&cx={}&q={}&num={}",
            Self::ENDPOINT,
            urlencoding::encode(api_key),
            urlencoding::encode(engine_id),
            urlencoding::encode(query),
            num_results
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ToolError::Execution(format!("Search authentication failed: {}", status)));
        }
        if !status.is_success() {
            return Err(ToolError::Execution(format!("Search HTTP error: {}", status)));
        }

        let body: Value = response.json().await?;
        Ok(extract_google_results(&body))
    }
}

/// Pull `{title, snippet, link}` out of a Custom Search response.
fn extract_google_results(body: &Value) -> Vec<SearchHit> {
    body["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let title = item["title"].as_str()?;
                    Some(SearchHit {
                        title: title.to_string(),
                        snippet: item["snippet"].as_str().unwrap_or_default().trim().to_string(),
                        url: item["link"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Canned results for offline use and tests.
pub struct StubSearchBackend;

#[async_trait]
impl SearchBackend for StubSearchBackend {
    async fn search(&self, _query: &str, _num_results: u64) -> Result<Vec<SearchHit>, ToolError> {
        Ok(vec![
            SearchHit {
                title: "AI Breakthrough in 2025".to_string(),
                snippet: "Recent developments in AI technology show significant progress in reasoning capabilities and multi-modal understanding...".to_string(),
                url: "https://example.com/ai-news-1".to_string(),
            },
            SearchHit {
                title: "New AI Research Findings".to_string(),
                snippet: "Scientists have discovered new methods for improving AI performance and efficiency in language processing tasks...".to_string(),
                url: "https://example.com/ai-research".to_string(),
            },
            SearchHit {
                title: "AI Industry Updates".to_string(),
                snippet: "The latest trends and developments in the AI industry for 2025 including new LLM architectures and applications...".to_string(),
                url: "https://example.com/ai-industry".to_string(),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_arguments() {
        let tool = WebSearch::new(StubSearchBackend);
        assert!(tool.validate(&json!({ "query": "rust" })).is_ok());
        assert!(tool.validate(&json!({ "query": "   " })).is_err());
        assert!(tool.validate(&json!({ "query": 42 })).is_err());
        assert!(tool.validate(&json!({ "query": "rust", "num_results": 0 })).is_err());
        assert!(tool.validate(&json!({ "query": "rust", "num_results": 11 })).is_err());
        assert!(tool.validate(&json!({ "query": "rust", "num_results": "3" })).is_err());
        assert!(tool.validate(&json!(["rust"])).is_err());
    }

    #[tokio::test]
    async fn stub_search_returns_three_results() {
        let tool = WebSearch::new(StubSearchBackend);
        let payload = tool.execute(json!({ "query": "AI news" })).await.unwrap();
        assert_eq!(payload["query"], "AI news");
        assert_eq!(payload["total_results"], 3);
        assert_eq!(payload["results"].as_array().unwrap().len(), 3);
        assert_eq!(payload["results"][0]["url"], "https://example.com/ai-news-1");
    }

    #[tokio::test]
    async fn results_are_truncated_to_num_results() {
        let tool = WebSearch::new(StubSearchBackend);
        let payload = tool
            .execute(json!({ "query": "AI news", "num_results": 2 }))
            .await
            .unwrap();
        assert_eq!(payload["total_results"], 2);
    }

    #[test]
    fn extracts_google_items() {
        let body = json!({
            "items": [
                { "title": "Rust", "snippet": " A language ", "link": "https://rust-lang.org" },
                { "snippet": "no title, skipped" }
            ]
        });
        let hits = extract_google_results(&body);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].snippet, "A language");
        assert!(extract_google_results(&json!({})).is_empty());
    }
}
