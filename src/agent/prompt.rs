//! System prompt for the chat agent.

use crate::tools::ToolSchema;

/// Build the system prompt for the tools offered this turn.
pub fn build_system_prompt(tools: &[ToolSchema]) -> String {
    let tool_descriptions = if tools.is_empty() {
        "No tools are currently enabled. Answer from your own knowledge.".to_string()
    } else {
        tools
            .iter()
            .map(|t| format!("- **{}** ({}): {}", t.name, t.display_name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are a helpful assistant that can call tools to answer the user.

## Your Capabilities

{tool_descriptions}

## Rules and Guidelines

1. **Use tools when they help** - Search for current information, call APIs for live data, and run JavaScript for calculations instead of guessing.

2. **Only call listed tools** - Tools not listed above are unavailable this turn.

3. **Read tool results carefully** - A result with `"success": false` means the call failed. Explain the failure or try a different approach.

4. **Be concise** - When you have what you need, answer the user directly and summarize what the tools returned."#,
        tool_descriptions = tool_descriptions
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ToolConfig;
    use crate::tools::ToolRegistry;

    #[test]
    fn lists_offered_tools_only() {
        let mut tools = ToolRegistry::offline().available_tools(&ToolConfig::default());
        tools.retain(|t| t.name != "google_search");
        let prompt = build_system_prompt(&tools);
        assert!(prompt.contains("execute_javascript"));
        assert!(prompt.contains("ai_pipe_request"));
        assert!(!prompt.contains("google_search"));
    }

    #[test]
    fn mentions_when_nothing_is_enabled() {
        assert!(build_system_prompt(&[]).contains("No tools are currently enabled"));
    }
}
