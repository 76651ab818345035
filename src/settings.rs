//! Persisted user settings.
//!
//! Two independent JSON records live in the data directory:
//! `llm_config.json` (provider selection) and `tool_config.json` (tool
//! enablement and credentials). A missing or unreadable record falls back
//! to defaults so a corrupt file never prevents startup.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::providers::{find_provider, ProviderInfo};
use crate::tools::ToolKind;

pub const LLM_CONFIG_FILE: &str = "llm_config.json";
pub const TOOL_CONFIG_FILE: &str = "tool_config.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider '{provider}' has no model '{model}'")]
    UnknownModel { provider: String, model: String },

    #[error("An API key is required for {0}")]
    MissingApiKey(String),
}

/// Selected LLM provider and credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
}

impl LlmConfig {
    /// Build a config for a catalog provider, taking its base URL.
    pub fn for_provider(provider_id: &str, model_id: &str, api_key: &str) -> Result<Self, SettingsError> {
        let provider = find_provider(provider_id)
            .ok_or_else(|| SettingsError::UnknownProvider(provider_id.to_string()))?;
        if !provider.has_model(model_id) {
            return Err(SettingsError::UnknownModel {
                provider: provider_id.to_string(),
                model: model_id.to_string(),
            });
        }
        let api_key = api_key.trim();
        if provider.requires_key && api_key.is_empty() {
            return Err(SettingsError::MissingApiKey(provider.name.to_string()));
        }

        Ok(Self {
            provider_id: Some(provider.id.to_string()),
            model_id: Some(model_id.to_string()),
            api_key: api_key.to_string(),
            base_url: provider.base_url.to_string(),
        })
    }

    /// A provider is selected and a key is present.
    pub fn is_connected(&self) -> bool {
        self.provider_id.is_some() && !self.api_key.trim().is_empty()
    }

    pub fn provider(&self) -> Option<&'static ProviderInfo> {
        self.provider_id.as_deref().and_then(find_provider)
    }
}

/// Enablement and credentials of one tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, String>,
}

impl ToolSettings {
    fn enabled() -> Self {
        Self {
            enabled: true,
            credentials: BTreeMap::new(),
        }
    }
}

/// Tool name → settings. Tools without an entry are disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolConfig {
    tools: BTreeMap<String, ToolSettings>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            tools: ToolKind::ALL
                .into_iter()
                .map(|kind| (kind.name().to_string(), ToolSettings::enabled()))
                .collect(),
        }
    }
}

impl ToolConfig {
    pub fn is_enabled(&self, kind: ToolKind) -> bool {
        self.tools.get(kind.name()).is_some_and(|t| t.enabled)
    }

    pub fn get(&self, kind: ToolKind) -> Option<&ToolSettings> {
        self.tools.get(kind.name())
    }

    /// Non-empty credential value.
    pub fn credential(&self, kind: ToolKind, key: &str) -> Option<&str> {
        self.get(kind)
            .and_then(|t| t.credentials.get(key))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn set_enabled(&mut self, kind: ToolKind, enabled: bool) {
        self.tools.entry(kind.name().to_string()).or_default().enabled = enabled;
    }

    pub fn set_credential(&mut self, kind: ToolKind, key: &str, value: &str) {
        self.tools
            .entry(kind.name().to_string())
            .or_default()
            .credentials
            .insert(key.to_string(), value.trim().to_string());
    }
}

/// In-memory copy of both records with disk persistence.
#[derive(Debug)]
pub struct SettingsStore {
    llm: RwLock<LlmConfig>,
    tools: RwLock<ToolConfig>,
    data_dir: PathBuf,
}

impl SettingsStore {
    /// Create a settings store, loading both records from `data_dir` if present.
    pub async fn new(data_dir: &Path) -> Self {
        let llm = load_record(&data_dir.join(LLM_CONFIG_FILE));
        let tools = load_record(&data_dir.join(TOOL_CONFIG_FILE));

        Self {
            llm: RwLock::new(llm),
            tools: RwLock::new(tools),
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn llm_config(&self) -> LlmConfig {
        self.llm.read().await.clone()
    }

    pub async fn tool_config(&self) -> ToolConfig {
        self.tools.read().await.clone()
    }

    /// Replace the LLM config and persist it.
    pub async fn set_llm_config(&self, config: LlmConfig) -> Result<(), std::io::Error> {
        let mut llm = self.llm.write().await;
        *llm = config;
        let snapshot = llm.clone();
        drop(llm); // Release lock before saving
        self.save_record(LLM_CONFIG_FILE, &snapshot)
    }

    /// Replace the tool config and persist it.
    pub async fn set_tool_config(&self, config: ToolConfig) -> Result<(), std::io::Error> {
        let mut tools = self.tools.write().await;
        *tools = config;
        let snapshot = tools.clone();
        drop(tools);
        self.save_record(TOOL_CONFIG_FILE, &snapshot)
    }

    /// Toggle one tool.
    ///
    /// Returns `(changed, previous_value)`.
    pub async fn set_tool_enabled(
        &self,
        kind: ToolKind,
        enabled: bool,
    ) -> Result<(bool, bool), std::io::Error> {
        let mut tools = self.tools.write().await;
        let previous = tools.is_enabled(kind);

        if previous != enabled {
            tools.set_enabled(kind, enabled);
            let snapshot = tools.clone();
            drop(tools); // Release lock before saving
            self.save_record(TOOL_CONFIG_FILE, &snapshot)?;
            Ok((true, previous))
        } else {
            Ok((false, previous))
        }
    }

    /// Store a credential for one tool.
    pub async fn set_tool_credential(
        &self,
        kind: ToolKind,
        key: &str,
        value: &str,
    ) -> Result<(), std::io::Error> {
        let mut tools = self.tools.write().await;
        tools.set_credential(kind, key, value);
        let snapshot = tools.clone();
        drop(tools);
        self.save_record(TOOL_CONFIG_FILE, &snapshot)
    }

    /// Reload both records from disk, falling back to defaults.
    pub async fn reload(&self) {
        let llm = load_record(&self.data_dir.join(LLM_CONFIG_FILE));
        let tools = load_record(&self.data_dir.join(TOOL_CONFIG_FILE));
        *self.llm.write().await = llm;
        *self.tools.write().await = tools;
    }

    fn save_record<T: Serialize>(&self, file: &str, value: &T) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.data_dir)?;

        let path = self.data_dir.join(file);
        let contents = serde_json::to_string_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&path, contents)?;
        tracing::debug!("Saved settings to {}", path.display());
        Ok(())
    }
}

/// Shared settings store wrapped in Arc for concurrent access.
pub type SharedSettingsStore = Arc<SettingsStore>;

fn load_record<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        tracing::info!("No settings file found at {}, using defaults", path.display());
        return T::default();
    }

    match read_record(path) {
        Ok(value) => {
            tracing::info!("Loaded settings from {}", path.display());
            value
        }
        Err(e) => {
            tracing::warn!(
                "Failed to load settings from {}: {}, using defaults",
                path.display(),
                e
            );
            T::default()
        }
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, std::io::Error> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_run_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path()).await;

        assert_eq!(store.llm_config().await, LlmConfig::default());
        let tools = store.tool_config().await;
        for kind in ToolKind::ALL {
            assert!(tools.is_enabled(kind));
        }
    }

    #[tokio::test]
    async fn malformed_records_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LLM_CONFIG_FILE), "{not json").unwrap();
        std::fs::write(dir.path().join(TOOL_CONFIG_FILE), r#"{"google_search": 7}"#).unwrap();

        let store = SettingsStore::new(dir.path()).await;
        assert_eq!(store.llm_config().await, LlmConfig::default());
        assert_eq!(store.tool_config().await, ToolConfig::default());
    }

    #[tokio::test]
    async fn tool_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path()).await;

        let mut config = ToolConfig::default();
        config.set_enabled(ToolKind::ExecuteJavascript, false);
        config.set_credential(ToolKind::GoogleSearch, "api_key", " key-123 ");
        config.set_credential(ToolKind::GoogleSearch, "search_engine_id", "cx-9");
        store.set_tool_config(config.clone()).await.unwrap();

        let reloaded = SettingsStore::new(dir.path()).await;
        assert_eq!(reloaded.tool_config().await, config);
        assert_eq!(
            reloaded.tool_config().await.credential(ToolKind::GoogleSearch, "api_key"),
            Some("key-123")
        );
    }

    #[tokio::test]
    async fn llm_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path()).await;

        let config = LlmConfig::for_provider("openai", "gpt-4", "sk-test").unwrap();
        store.set_llm_config(config.clone()).await.unwrap();

        let reloaded = SettingsStore::new(dir.path()).await;
        let loaded = reloaded.llm_config().await;
        assert_eq!(loaded, config);
        assert!(loaded.is_connected());
        assert_eq!(loaded.base_url, "https://api.openai.com/v1");
    }

    #[tokio::test]
    async fn set_tool_enabled_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path()).await;

        let (changed, previous) = store.set_tool_enabled(ToolKind::AiPipeRequest, false).await.unwrap();
        assert!(changed);
        assert!(previous);
        let (changed, _) = store.set_tool_enabled(ToolKind::AiPipeRequest, false).await.unwrap();
        assert!(!changed);

        std::fs::write(dir.path().join(TOOL_CONFIG_FILE), "garbage").unwrap();
        store.reload().await;
        assert!(store.tool_config().await.is_enabled(ToolKind::AiPipeRequest));
    }

    #[test]
    fn for_provider_validates_catalog() {
        assert!(matches!(
            LlmConfig::for_provider("acme", "m", "k"),
            Err(SettingsError::UnknownProvider(_))
        ));
        assert!(matches!(
            LlmConfig::for_provider("openai", "claude-3-haiku", "k"),
            Err(SettingsError::UnknownModel { .. })
        ));
        assert!(matches!(
            LlmConfig::for_provider("openai", "gpt-4", "  "),
            Err(SettingsError::MissingApiKey(_))
        ));
    }

    #[test]
    fn missing_tool_entry_is_disabled() {
        let config: ToolConfig = serde_json::from_str(r#"{"google_search": {"enabled": true}}"#).unwrap();
        assert!(config.is_enabled(ToolKind::GoogleSearch));
        assert!(!config.is_enabled(ToolKind::ExecuteJavascript));
        assert_eq!(config.credential(ToolKind::GoogleSearch, "api_key"), None);
    }
}
