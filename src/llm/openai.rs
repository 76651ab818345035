//! Client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Provider, model, key and base URL are read from the settings store on
//! every call, so saving a new provider takes effect on the next inference.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ConversationEntry, LlmError, ModelClient, ModelResponse, Role, ToolCallRequest};
use crate::agent::build_system_prompt;
use crate::settings::{LlmConfig, SharedSettingsStore};
use crate::tools::ToolSchema;

pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    settings: SharedSettingsStore,
}

impl OpenAiCompatibleClient {
    pub fn new(client: reqwest::Client, settings: SharedSettingsStore) -> Self {
        Self { client, settings }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Get the chat completions URL for a base URL.
fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

/// Convert history entries into chat messages.
fn to_wire_messages(system_prompt: &str, conversation: &[ConversationEntry]) -> Vec<Value> {
    let mut messages = vec![json!({ "role": "system", "content": system_prompt })];

    for entry in conversation {
        let message = match entry.role {
            Role::User => json!({ "role": "user", "content": entry.content }),
            Role::Assistant => {
                let content = if entry.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(entry.content.clone())
                };
                let mut message = json!({ "role": "assistant", "content": content });
                if let Some(calls) = &entry.tool_calls {
                    message["tool_calls"] = calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                }
                message
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": entry.tool_call_id,
                "name": entry.name,
                "content": entry.content,
            }),
        };
        messages.push(message);
    }

    messages
}

/// Tool schemas in function-calling format.
fn to_wire_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

fn from_wire_response(response: CompletionResponse) -> Result<ModelResponse, LlmError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let arguments = serde_json::from_str::<Value>(&call.function.arguments)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({}));
            ToolCallRequest::new(call.id, call.function.name, arguments)
        })
        .collect();

    Ok(ModelResponse {
        text: choice.message.content,
        tool_calls,
    })
}

fn model_for(config: &LlmConfig) -> Result<(&str, &str), LlmError> {
    if !config.is_connected() {
        return Err(LlmError::NotConfigured);
    }
    let provider = config.provider_id.as_deref().unwrap_or_default();
    if config.provider().is_some_and(|p| !p.openai_compatible) {
        return Err(LlmError::UnsupportedProvider(provider.to_string()));
    }
    let model = config.model_id.as_deref().ok_or(LlmError::NotConfigured)?;
    if config.base_url.trim().is_empty() {
        return Err(LlmError::NotConfigured);
    }
    Ok((provider, model))
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    async fn infer(
        &self,
        conversation: &[ConversationEntry],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, LlmError> {
        let config = self.settings.llm_config().await;
        let (provider, model) = model_for(&config)?;

        let mut body = json!({
            "model": model,
            "messages": to_wire_messages(&build_system_prompt(tools), conversation),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(to_wire_tools(tools));
        }

        let url = completions_url(&config.base_url);
        tracing::debug!(provider = %provider, model = %model, url = %url, "Calling chat completions");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::Auth(format!("{} rejected the API key ({})", provider, status)));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        from_wire_response(parsed)
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}
