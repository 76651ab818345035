//! Configuration management for toolloop.
//!
//! Configuration can be set via environment variables:
//! - `TOOLLOOP_DATA_DIR` - Optional. Directory holding the persisted LLM and tool settings. Defaults to `./.toolloop`.
//! - `MAX_ITERATIONS` - Optional. Maximum model calls per user message. Defaults to `50`.
//! - `DISABLED_TOOL_POLICY` - Optional. `reject` or `execute`. Defaults to `reject`.
//! - `TOOLLOOP_OFFLINE` - Optional. Use the deterministic offline model and stub tool backends. Defaults to `false`.
//! - `HTTP_TIMEOUT_SECS` - Optional. Timeout for outbound HTTP calls. Defaults to `30`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// What the agent loop does when the model requests a tool that is
/// registered but disabled in the tool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisabledToolPolicy {
    /// Answer with a failed tool result without running the tool.
    #[default]
    Reject,
    /// Run the tool anyway; enablement only filters what the model is offered.
    Execute,
}

impl FromStr for DisabledToolPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "reject" | "deny" => Ok(Self::Reject),
            "execute" | "allow" => Ok(Self::Execute),
            other => Err(format!("expected 'reject' or 'execute', got: {}", other)),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for `llm_config.json` and `tool_config.json`
    pub data_dir: PathBuf,

    /// Maximum model calls for a single user message
    pub max_iterations: usize,

    /// Handling of requests for disabled tools
    pub disabled_tool_policy: DisabledToolPolicy,

    /// Offline mode: deterministic model and canned tool backends
    pub offline: bool,

    /// Timeout applied to model and tool HTTP requests
    pub http_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("TOOLLOOP_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".toolloop"));

        let max_iterations = std::env::var("MAX_ITERATIONS")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("MAX_ITERATIONS".to_string(), format!("{}", e)))?;
        if max_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_ITERATIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let disabled_tool_policy = std::env::var("DISABLED_TOOL_POLICY")
            .ok()
            .map(|v| {
                v.parse::<DisabledToolPolicy>()
                    .map_err(|e| ConfigError::InvalidValue("DISABLED_TOOL_POLICY".to_string(), e))
            })
            .transpose()?
            .unwrap_or_default();

        let offline = std::env::var("TOOLLOOP_OFFLINE")
            .ok()
            .map(|v| parse_bool(&v).map_err(|e| ConfigError::InvalidValue("TOOLLOOP_OFFLINE".to_string(), e)))
            .transpose()?
            .unwrap_or(false);

        let http_timeout = std::env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| ConfigError::InvalidValue("HTTP_TIMEOUT_SECS".to_string(), format!("{}", e)))
            })
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            data_dir,
            max_iterations,
            disabled_tool_policy,
            offline,
            http_timeout,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            max_iterations: 50,
            disabled_tool_policy: DisabledToolPolicy::Reject,
            offline: true,
            http_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(format!("expected boolean-like value, got: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("YES"), Ok(true));
        assert_eq!(parse_bool(" on "), Ok(true));
        assert_eq!(parse_bool("0"), Ok(false));
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn disabled_tool_policy_parses() {
        assert_eq!("reject".parse::<DisabledToolPolicy>(), Ok(DisabledToolPolicy::Reject));
        assert_eq!("Execute".parse::<DisabledToolPolicy>(), Ok(DisabledToolPolicy::Execute));
        assert!("sometimes".parse::<DisabledToolPolicy>().is_err());
    }

    #[test]
    fn new_config_has_safe_defaults() {
        let config = Config::new(PathBuf::from("/tmp/toolloop"));
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.disabled_tool_policy, DisabledToolPolicy::Reject);
        assert!(config.offline);
    }
}
