//! Tool registry and the executors the model can invoke.
//!
//! The set of tools is closed: [`ToolKind`] enumerates every tool and the
//! registry maps each variant to its executor with an exhaustive `match`,
//! so adding a tool is a compile error until it is wired everywhere.
//!
//! Enablement (from [`ToolConfig`]) only filters which schemas are offered
//! to the model. [`ToolRegistry::dispatch`] runs any registered tool; the
//! agent loop applies the disabled-tool policy before calling it.

pub mod javascript;
pub mod request;
pub mod web;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::settings::{SharedSettingsStore, ToolConfig};

pub use javascript::JavascriptSandbox;
pub use request::{ApiRequest, HttpBackend, HttpMethod, ReqwestHttpBackend, StubHttpBackend};
pub use web::{GoogleSearchBackend, SearchBackend, SearchHit, StubSearchBackend, WebSearch};

/// Every tool known to the registry, in the order schemas are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    GoogleSearch,
    AiPipeRequest,
    ExecuteJavascript,
}

impl ToolKind {
    /// Declared order: search, generic request, code execution.
    pub const ALL: [ToolKind; 3] = [
        ToolKind::GoogleSearch,
        ToolKind::AiPipeRequest,
        ToolKind::ExecuteJavascript,
    ];

    /// Wire name used in schemas and tool calls.
    pub fn name(self) -> &'static str {
        match self {
            Self::GoogleSearch => "google_search",
            Self::AiPipeRequest => "ai_pipe_request",
            Self::ExecuteJavascript => "execute_javascript",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared shape of a tool, as offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub display_name: String,
    pub description: String,
    /// JSON Schema object describing the arguments
    pub parameters: Value,
}

impl ToolSchema {
    /// Names listed under `parameters.required`.
    pub fn required(&self) -> Vec<&str> {
        self.parameters["required"]
            .as_array()
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Outcome of a tool call, folded into the conversation as a `tool` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub payload: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            is_error: false,
        }
    }

    /// Failed result with the canonical `{success: false, error}` payload.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            payload: json!({ "success": false, "error": message.into() }),
            is_error: true,
        }
    }

    /// Result whose error flag follows the payload's `success` field.
    pub fn from_payload(payload: Value) -> Self {
        let is_error = payload.get("success") == Some(&Value::Bool(false));
        Self { payload, is_error }
    }

    /// Serialized form stored in the conversation.
    pub fn to_content(&self) -> String {
        self.payload.to_string()
    }
}

impl From<ToolError> for ToolResult {
    fn from(error: ToolError) -> Self {
        ToolResult::failure(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    /// Arguments do not match the tool's schema
    #[error("Invalid arguments: {0}")]
    Validation(String),
    /// The tool ran and failed (network, auth, runtime fault)
    #[error("{0}")]
    Execution(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Tool '{0}' is disabled")]
    Disabled(String),
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        ToolError::Execution(format!("Request failed: {}", e))
    }
}

/// Capability set shared by all executors.
#[async_trait]
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    fn display_name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value;

    /// Check arguments against the schema without side effects.
    fn validate(&self, args: &Value) -> Result<(), ToolError>;

    /// Run the tool. Called only after `validate` succeeded.
    async fn execute(&self, args: Value) -> Result<Value, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.kind().name().to_string(),
            display_name: self.display_name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Registry of the three executors.
pub struct ToolRegistry {
    search: WebSearch,
    request: ApiRequest,
    javascript: JavascriptSandbox,
}

impl ToolRegistry {
    pub fn new(search: WebSearch, request: ApiRequest, javascript: JavascriptSandbox) -> Self {
        Self {
            search,
            request,
            javascript,
        }
    }

    /// Registry with deterministic canned backends and no network access.
    pub fn offline() -> Self {
        Self::new(
            WebSearch::new(StubSearchBackend),
            ApiRequest::new(StubHttpBackend),
            JavascriptSandbox::default(),
        )
    }

    /// Registry backed by real HTTP calls; credentials are read from the
    /// settings store at call time.
    pub fn online(client: reqwest::Client, settings: SharedSettingsStore) -> Self {
        Self::new(
            WebSearch::new(GoogleSearchBackend::new(client.clone(), settings.clone())),
            ApiRequest::new(ReqwestHttpBackend::new(client, settings)),
            JavascriptSandbox::default(),
        )
    }

    fn tool(&self, kind: ToolKind) -> &dyn Tool {
        match kind {
            ToolKind::GoogleSearch => &self.search,
            ToolKind::AiPipeRequest => &self.request,
            ToolKind::ExecuteJavascript => &self.javascript,
        }
    }

    /// Schemas of the enabled tools, always in declared order.
    pub fn available_tools(&self, config: &ToolConfig) -> Vec<ToolSchema> {
        ToolKind::ALL
            .into_iter()
            .filter(|kind| config.is_enabled(*kind))
            .map(|kind| self.tool(kind).schema())
            .collect()
    }

    /// Schemas of every registered tool.
    pub fn all_tools(&self) -> Vec<ToolSchema> {
        ToolKind::ALL
            .into_iter()
            .map(|kind| self.tool(kind).schema())
            .collect()
    }

    /// Validate and run a tool by name.
    ///
    /// Only an unknown name is an `Err`; validation and execution failures
    /// come back as failed [`ToolResult`]s so the model can react to them.
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<ToolResult, ToolError> {
        let kind =
            ToolKind::from_name(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let tool = self.tool(kind);

        if let Err(e) = tool.validate(&args) {
            tracing::debug!(tool = %kind, error = %e, "Rejected tool arguments");
            return Ok(e.into());
        }

        match tool.execute(args).await {
            Ok(payload) => Ok(ToolResult::from_payload(payload)),
            Err(e) => {
                tracing::warn!(tool = %kind, error = %e, "Tool execution failed");
                Ok(e.into())
            }
        }
    }
}

/// Fetch a required, non-empty string argument.
pub(crate) fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    match args.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(ToolError::Validation(format!("'{}' must not be empty", field))),
        Some(_) => Err(ToolError::Validation(format!("'{}' must be a string", field))),
        None => Err(ToolError::Validation(format!("Missing '{}' argument", field))),
    }
}

pub(crate) fn ensure_object(args: &Value) -> Result<(), ToolError> {
    if args.is_object() {
        Ok(())
    } else {
        Err(ToolError::Validation("arguments must be a JSON object".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_enabled() -> ToolConfig {
        ToolConfig::default()
    }

    #[test]
    fn tool_kind_names_round_trip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("rm_rf"), None);
    }

    #[test]
    fn available_tools_follow_declared_order() {
        let registry = ToolRegistry::offline();
        let names: Vec<_> = registry
            .available_tools(&all_enabled())
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["google_search", "ai_pipe_request", "execute_javascript"]);
    }

    #[test]
    fn available_tools_filters_disabled() {
        let registry = ToolRegistry::offline();
        let mut config = all_enabled();
        config.set_enabled(ToolKind::GoogleSearch, false);
        let names: Vec<_> = registry
            .available_tools(&config)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["ai_pipe_request", "execute_javascript"]);
    }

    #[test]
    fn available_tools_is_idempotent() {
        let registry = ToolRegistry::offline();
        let mut config = all_enabled();
        config.set_enabled(ToolKind::AiPipeRequest, false);
        assert_eq!(registry.available_tools(&config), registry.available_tools(&config));
    }

    #[test]
    fn schemas_declare_required_fields() {
        let registry = ToolRegistry::offline();
        let schemas = registry.all_tools();
        assert_eq!(schemas[0].required(), vec!["query"]);
        assert_eq!(schemas[1].required(), vec!["endpoint"]);
        assert_eq!(schemas[2].required(), vec!["code"]);
        assert_eq!(schemas[2].display_name, "JavaScript Execution");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_errors() {
        let registry = ToolRegistry::offline();
        let err = registry.dispatch("format_disk", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "format_disk"));
    }

    #[tokio::test]
    async fn dispatch_folds_validation_errors_into_result() {
        let registry = ToolRegistry::offline();
        let result = registry
            .dispatch("google_search", json!({ "num_results": 3 }))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.payload["success"], json!(false));
        assert!(result.payload["error"].as_str().unwrap().contains("query"));
    }

    #[tokio::test]
    async fn dispatch_ignores_enablement() {
        let registry = ToolRegistry::offline();
        let result = registry
            .dispatch("execute_javascript", json!({ "code": "1 + 1" }))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.payload["result"], json!(2));
    }

    #[test]
    fn failure_payload_shape() {
        let result = ToolResult::failure("boom");
        assert_eq!(result.to_content(), r#"{"success":false,"error":"boom"}"#);
    }

    #[tokio::test]
    async fn failed_script_is_a_failed_result() {
        let registry = ToolRegistry::offline();
        let result = registry
            .dispatch("execute_javascript", json!({ "code": "fetch('https://example.com')" }))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.payload["error"], json!("ReferenceError: fetch is not defined"));
    }
}
