//! Conversation data model and the model client abstraction.
//!
//! The agent loop only talks to [`ModelClient`]; concrete backends are the
//! OpenAI-compatible HTTP client in [`openai`] and the deterministic
//! doubles in [`mock`].

pub mod mock;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::ToolSchema;

pub use mock::{HeuristicModelClient, ScriptedModelClient};
pub use openai::OpenAiCompatibleClient;

/// Author of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A model's request to run one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
        }
    }

    /// Tool calls carried by an assistant entry.
    pub fn calls(&self) -> &[ToolCallRequest] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

/// Result of one inference call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(text: Option<&str>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: text.map(str::to_string),
            tool_calls,
        }
    }

    /// Text with surrounding whitespace removed, if any is left.
    pub fn visible_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Neither text nor tool calls: the client broke its contract.
    pub fn is_empty(&self) -> bool {
        self.visible_text().is_none() && self.tool_calls.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Model returned neither text nor tool calls")]
    EmptyResponse,
    #[error("No LLM provider is configured")]
    NotConfigured,
    #[error("Provider '{0}' does not support the chat completions API")]
    UnsupportedProvider(String),
}

/// A single inference call over the conversation so far.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Ask the model for its next step.
    ///
    /// `tools` is exactly the set of schemas the model may call this turn.
    async fn infer(
        &self,
        conversation: &[ConversationEntry],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, LlmError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

/// Check that a model backend answers, using one tool-less call.
///
/// Surfaces the backend's own error (auth, API status, network) so the
/// user can fix credentials before chatting.
pub async fn test_connection(model: &dyn ModelClient) -> Result<(), LlmError> {
    let ping = [ConversationEntry::user("Reply with the single word: OK")];
    let response = model.infer(&ping, &[]).await?;
    if response.is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    tracing::info!(model = model.name(), "Connection test succeeded");
    Ok(())
}
