//! Deterministic model clients for offline use and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{ConversationEntry, LlmError, ModelClient, ModelResponse, Role, ToolCallRequest};
use crate::tools::{ToolKind, ToolSchema};

/// Replays a fixed script of responses, one per inference call.
///
/// Records the tool names offered on every call so tests can check what
/// the model was allowed to see.
pub struct ScriptedModelClient {
    responses: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModelClient {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<ModelResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(results.into()),
            offered: Mutex::new(Vec::new()),
        }
    }

    /// Tool names offered on each call so far, in call order.
    pub fn offered_tools(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.offered.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn infer(
        &self,
        _conversation: &[ConversationEntry],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, LlmError> {
        self.offered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tools.iter().map(|t| t.name.clone()).collect());

        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(ModelResponse::text("No more scripted responses.")))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

const FACTORIAL_CODE: &str = "function factorial(n) { return n <= 1 ? 1 : n * factorial(n-1); } const result = factorial(10); console.log(`Factorial of 10: ${result}`); result;";
const HELLO_CODE: &str = "console.log(\"Hello from JavaScript execution!\"); const result = 6 * 7; console.log(`The answer is ${result}`); result;";
const FALLBACK_QUERY: &str = "AI developments 2025";

const CANNED_REPLIES: [&str; 4] = [
    "I understand you're asking about this topic. Let me help you with that.",
    "That's an interesting question. Here's what I can tell you...",
    "I'd be happy to help you with that. Based on your question...",
    "Let me provide you with some information about this.",
];

/// Offline stand-in for a real model.
///
/// Routes the latest user message by keyword to one tool, then answers
/// with a summary once that tool's result is in, so every turn ends.
#[derive(Default)]
pub struct HeuristicModelClient {
    next_id: AtomicUsize,
}

impl HeuristicModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_call_id(&self) -> String {
        format!("call_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn route(&self, message: &str, tools: &[ToolSchema]) -> ModelResponse {
        let lower = message.to_lowercase();
        let wants = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        let (kind, preface, arguments) = if wants(&["search", "find", "look up", "news"]) {
            (
                ToolKind::GoogleSearch,
                "I'll search for that information for you.",
                json!({ "query": extract_search_query(message), "num_results": 5 }),
            )
        } else if wants(&["calculate", "code", "javascript", "factorial"]) {
            let code = if lower.contains("factorial") {
                FACTORIAL_CODE
            } else {
                HELLO_CODE
            };
            (
                ToolKind::ExecuteJavascript,
                "I'll execute some JavaScript code for you.",
                json!({ "code": code }),
            )
        } else if wants(&["api", "request", "fetch"]) {
            (
                ToolKind::AiPipeRequest,
                "I'll make an API request for you.",
                json!({ "endpoint": "https://api.example.com/data", "method": "GET" }),
            )
        } else {
            let reply = CANNED_REPLIES[message.chars().count() % CANNED_REPLIES.len()];
            return ModelResponse::text(reply);
        };

        match tools.iter().find(|t| t.name == kind.name()) {
            Some(_) => ModelResponse::tool_calls(
                Some(preface),
                vec![ToolCallRequest::new(self.next_call_id(), kind.name(), arguments)],
            ),
            None => ModelResponse::text(format!(
                "I would use the {} tool for this, but it is currently disabled.",
                kind.name()
            )),
        }
    }
}

#[async_trait]
impl ModelClient for HeuristicModelClient {
    async fn infer(
        &self,
        conversation: &[ConversationEntry],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, LlmError> {
        let Some(last) = conversation.last() else {
            return Err(LlmError::InvalidResponse("conversation is empty".to_string()));
        };

        if last.role == Role::Tool {
            let results: Vec<&ConversationEntry> = conversation
                .iter()
                .rev()
                .take_while(|e| e.role == Role::Tool)
                .collect();
            let summary = results
                .iter()
                .rev()
                .map(|entry| summarize_tool_entry(entry))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(ModelResponse::text(summary));
        }

        let message = conversation
            .iter()
            .rev()
            .find(|e| e.role == Role::User)
            .map(|e| e.content.as_str())
            .unwrap_or_default();

        Ok(self.route(message, tools))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

fn trigger_words() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\b(search|find|look up|for)\b").expect("trigger pattern is valid"))
}

/// Strip the routing words from a message, leaving the query.
pub fn extract_search_query(message: &str) -> String {
    let stripped = trigger_words().replace_all(message, " ");
    let query = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if query.is_empty() {
        FALLBACK_QUERY.to_string()
    } else {
        query
    }
}

fn summarize_tool_entry(entry: &ConversationEntry) -> String {
    let name = entry.name.as_deref().unwrap_or("tool");
    let payload: Value = serde_json::from_str(&entry.content).unwrap_or(Value::Null);

    if payload["success"] == json!(false) {
        let error = payload["error"].as_str().unwrap_or("unknown error");
        return format!("The {} tool failed: {}", name, error);
    }

    match ToolKind::from_name(name) {
        Some(ToolKind::GoogleSearch) => {
            let titles: Vec<&str> = payload["results"]
                .as_array()
                .map(|hits| hits.iter().filter_map(|h| h["title"].as_str()).collect())
                .unwrap_or_default();
            format!(
                "I found {} results for \"{}\": {}",
                titles.len(),
                payload["query"].as_str().unwrap_or_default(),
                titles.join("; ")
            )
        }
        Some(ToolKind::ExecuteJavascript) => {
            let output: Vec<&str> = payload["output"]
                .as_array()
                .map(|lines| lines.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let mut text = format!("The code ran successfully and returned {}.", payload["result"]);
            if !output.is_empty() {
                text.push_str(&format!(" Output: {}", output.join(" | ")));
            }
            text
        }
        Some(ToolKind::AiPipeRequest) => format!(
            "The {} request to {} returned status {}.",
            payload["method"].as_str().unwrap_or("GET"),
            payload["endpoint"].as_str().unwrap_or_default(),
            payload["status"]
        ),
        None => format!("The {} tool returned: {}", name, entry.content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ToolConfig;
    use crate::tools::ToolRegistry;

    fn all_tools() -> Vec<ToolSchema> {
        ToolRegistry::offline().available_tools(&ToolConfig::default())
    }

    #[test]
    fn extracts_query_from_message() {
        assert_eq!(extract_search_query("search for AI news"), "AI news");
        assert_eq!(extract_search_query("Look up the information"), "the information");
        assert_eq!(extract_search_query("search"), FALLBACK_QUERY);
    }

    #[tokio::test]
    async fn routes_search_requests() {
        let client = HeuristicModelClient::new();
        let response = client
            .infer(&[ConversationEntry::user("search for AI news")], &all_tools())
            .await
            .unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        let call = &response.tool_calls[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "google_search");
        assert_eq!(call.arguments, json!({ "query": "AI news", "num_results": 5 }));
    }

    #[tokio::test]
    async fn does_not_request_tools_that_are_not_offered() {
        let client = HeuristicModelClient::new();
        let response = client
            .infer(&[ConversationEntry::user("calculate a factorial")], &[])
            .await
            .unwrap();
        assert!(!response.has_tool_calls());
        assert!(response.visible_text().unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn summarizes_after_tool_results() {
        let client = HeuristicModelClient::new();
        let conversation = vec![
            ConversationEntry::user("calculate something"),
            ConversationEntry::assistant(
                "I'll execute some JavaScript code for you.",
                vec![ToolCallRequest::new("call_1", "execute_javascript", json!({ "code": "2" }))],
            ),
            ConversationEntry::tool(
                "call_1",
                "execute_javascript",
                json!({ "code": "2", "output": ["hi"], "result": 2, "success": true }).to_string(),
            ),
        ];
        let response = client.infer(&conversation, &all_tools()).await.unwrap();
        assert!(!response.has_tool_calls());
        assert_eq!(
            response.visible_text(),
            Some("The code ran successfully and returned 2. Output: hi")
        );
    }

    #[tokio::test]
    async fn plain_chat_gets_canned_reply() {
        let client = HeuristicModelClient::new();
        let response = client
            .infer(&[ConversationEntry::user("hello there")], &all_tools())
            .await
            .unwrap();
        assert!(CANNED_REPLIES.contains(&response.visible_text().unwrap()));
    }

    #[tokio::test]
    async fn scripted_client_replays_in_order() {
        let client = ScriptedModelClient::new(vec![ModelResponse::text("one"), ModelResponse::text("two")]);
        let tools = all_tools();
        let first = client.infer(&[], &tools).await.unwrap();
        let second = client.infer(&[], &tools[..1]).await.unwrap();
        assert_eq!(first.visible_text(), Some("one"));
        assert_eq!(second.visible_text(), Some("two"));
        assert_eq!(client.offered_tools()[1], vec!["google_search".to_string()]);
        assert_eq!(client.calls(), 2);
    }
}
