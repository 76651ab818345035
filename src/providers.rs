//! Catalog of supported LLM providers.
//!
//! Each entry carries the default base URL and the models offered in the
//! provider picker. Only OpenAI-compatible providers can be driven by
//! [`crate::llm::openai::OpenAiCompatibleClient`].

use serde::Serialize;

/// A selectable LLM provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    pub models: &'static [&'static str],
    pub requires_key: bool,
    /// Speaks the `/chat/completions` wire format
    pub openai_compatible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'static str>,
}

impl ProviderInfo {
    pub fn has_model(&self, model: &str) -> bool {
        self.models.contains(&model)
    }
}

pub const PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        id: "openai",
        name: "OpenAI GPT",
        base_url: "https://api.openai.com/v1",
        models: &["gpt-4", "gpt-4-turbo", "gpt-3.5-turbo"],
        requires_key: true,
        openai_compatible: true,
        description: None,
    },
    ProviderInfo {
        id: "anthropic",
        name: "Anthropic Claude",
        base_url: "https://api.anthropic.com/v1",
        models: &["claude-3-sonnet", "claude-3-haiku"],
        requires_key: true,
        openai_compatible: false,
        description: None,
    },
    ProviderInfo {
        id: "gemini",
        name: "Google Gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        models: &["gemini-pro", "gemini-pro-vision"],
        requires_key: true,
        openai_compatible: false,
        description: None,
    },
    ProviderInfo {
        id: "aipipe",
        name: "AI Pipe",
        base_url: "https://aipipe.org/openrouter/v1",
        models: &["openai/gpt-4", "anthropic/claude-3-sonnet"],
        requires_key: true,
        openai_compatible: true,
        description: Some("Access LLMs without backend via AI Pipe proxy"),
    },
];

/// Look up a provider by id.
pub fn find_provider(id: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|p| p.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_known_providers() {
        let aipipe = find_provider("aipipe").unwrap();
        assert_eq!(aipipe.base_url, "https://aipipe.org/openrouter/v1");
        assert!(aipipe.has_model("openai/gpt-4"));
        assert!(!aipipe.has_model("gpt-4"));
        assert!(find_provider("nope").is_none());
    }

    #[test]
    fn provider_ids_are_unique() {
        let mut ids: Vec<_> = PROVIDERS.iter().map(|p| p.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), PROVIDERS.len());
    }
}
