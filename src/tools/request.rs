//! Generic HTTP request tool (the AI Pipe proxy call).

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use super::{ensure_object, required_str, Tool, ToolError, ToolKind};
use crate::settings::SharedSettingsStore;

/// Maximum response body kept in the tool result.
const MAX_BODY_CHARS: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(ToolError::Validation(format!(
                "'method' must be one of GET, POST, PUT, DELETE (got {})",
                other
            ))),
        }
    }
}

/// Validated arguments of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestArgs {
    pub endpoint: Url,
    pub method: HttpMethod,
    pub data: Option<Value>,
}

/// Status code and decoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

/// Transport for the request tool.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: &RequestArgs) -> Result<HttpResponse, ToolError>;
}

/// Make an HTTP call to an arbitrary endpoint.
pub struct ApiRequest {
    backend: Box<dyn HttpBackend>,
}

impl ApiRequest {
    pub fn new(backend: impl HttpBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    fn parse_args(args: &Value) -> Result<RequestArgs, ToolError> {
        ensure_object(args)?;
        let raw = required_str(args, "endpoint")?;
        let endpoint = Url::parse(raw.trim())
            .map_err(|e| ToolError::Validation(format!("'endpoint' is not a valid URL: {}", e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ToolError::Validation(format!(
                "'endpoint' must use http or https (got {})",
                endpoint.scheme()
            )));
        }

        let method = match args.get("method") {
            None | Some(Value::Null) => HttpMethod::default(),
            Some(Value::String(m)) => m.parse()?,
            Some(_) => return Err(ToolError::Validation("'method' must be a string".to_string())),
        };

        let data = match args.get("data") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        };

        Ok(RequestArgs {
            endpoint,
            method,
            data,
        })
    }
}

#[async_trait]
impl Tool for ApiRequest {
    fn kind(&self) -> ToolKind {
        ToolKind::AiPipeRequest
    }

    fn display_name(&self) -> &str {
        "AI Pipe Request"
    }

    fn description(&self) -> &str {
        "Make flexible API calls through AI Pipe proxy"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "endpoint": {
                    "type": "string",
                    "description": "API endpoint to call"
                },
                "method": {
                    "type": "string",
                    "description": "HTTP method",
                    "enum": ["GET", "POST", "PUT", "DELETE"],
                    "default": "GET"
                },
                "data": {
                    "type": "object",
                    "description": "Request data/payload"
                }
            },
            "required": ["endpoint"]
        })
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse_args(args).map(|_| ())
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let request = Self::parse_args(&args)?;
        tracing::info!(method = %request.method, endpoint = %request.endpoint, "Sending API request");

        let response = self.backend.send(&request).await?;

        Ok(json!({
            "endpoint": request.endpoint.as_str(),
            "method": request.method.as_str(),
            "status": response.status,
            "data": response.body,
        }))
    }
}

/// Real transport. Sends the `token` credential of `ai_pipe_request`
/// as a bearer token when present.
pub struct ReqwestHttpBackend {
    client: reqwest::Client,
    settings: SharedSettingsStore,
}

impl ReqwestHttpBackend {
    pub fn new(client: reqwest::Client, settings: SharedSettingsStore) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl HttpBackend for ReqwestHttpBackend {
    async fn send(&self, request: &RequestArgs) -> Result<HttpResponse, ToolError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, request.endpoint.clone());
        if let Some(data) = &request.data {
            builder = builder.json(data);
        }
        let token = self
            .settings
            .tool_config()
            .await
            .credential(ToolKind::AiPipeRequest, "token")
            .map(str::to_string);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        Ok(HttpResponse {
            status,
            body: decode_body(text),
        })
    }
}

/// JSON when it parses, otherwise the (truncated) text.
fn decode_body(text: String) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return value;
    }
    if text.chars().count() > MAX_BODY_CHARS {
        let truncated: String = text.chars().take(MAX_BODY_CHARS).collect();
        Value::String(format!("{}... [content truncated]", truncated))
    } else {
        Value::String(text)
    }
}

/// Fixed response for offline use and tests.
pub struct StubHttpBackend;

#[async_trait]
impl HttpBackend for StubHttpBackend {
    async fn send(&self, _request: &RequestArgs) -> Result<HttpResponse, ToolError> {
        Ok(HttpResponse {
            status: 200,
            body: json!({
                "message": "Mock API response data",
                "data": {
                    "status": "success",
                    "items": ["item1", "item2", "item3"]
                }
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_and_methods() {
        let args = ApiRequest::parse_args(&json!({ "endpoint": "https://api.example.com/data" })).unwrap();
        assert_eq!(args.method, HttpMethod::Get);
        assert!(args.data.is_none());

        let args = ApiRequest::parse_args(&json!({
            "endpoint": "https://api.example.com/data",
            "method": "post",
            "data": { "a": 1 }
        }))
        .unwrap();
        assert_eq!(args.method, HttpMethod::Post);
        assert_eq!(args.data, Some(json!({ "a": 1 })));
    }

    #[test]
    fn rejects_bad_endpoints_and_methods() {
        assert!(ApiRequest::parse_args(&json!({ "endpoint": "not a url" })).is_err());
        assert!(ApiRequest::parse_args(&json!({ "endpoint": "file:///etc/passwd" })).is_err());
        assert!(ApiRequest::parse_args(&json!({ "endpoint": "https://x.test", "method": "PATCH" })).is_err());
        assert!(ApiRequest::parse_args(&json!({ "method": "GET" })).is_err());
    }

    #[tokio::test]
    async fn stub_backend_reports_status_and_body() {
        let tool = ApiRequest::new(StubHttpBackend);
        let payload = tool
            .execute(json!({ "endpoint": "https://api.example.com/data" }))
            .await
            .unwrap();
        assert_eq!(payload["status"], 200);
        assert_eq!(payload["method"], "GET");
        assert_eq!(payload["endpoint"], "https://api.example.com/data");
        assert_eq!(payload["data"]["data"]["status"], "success");
    }

    #[test]
    fn decode_body_prefers_json() {
        assert_eq!(decode_body(r#"{"ok":true}"#.to_string()), json!({ "ok": true }));
        assert_eq!(decode_body("plain".to_string()), json!("plain"));
        let long = "x".repeat(MAX_BODY_CHARS + 10);
        assert!(decode_body(long).as_str().unwrap().ends_with("[content truncated]"));
    }
}
