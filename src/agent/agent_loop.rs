//! Core agent loop implementation.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, DisabledToolPolicy};
use crate::events::{AgentObserver, NoopObserver};
use crate::llm::{ConversationEntry, LlmError, ModelClient, ToolCallRequest};
use crate::settings::{SharedSettingsStore, ToolConfig};
use crate::tools::{ToolError, ToolKind, ToolRegistry, ToolResult};

use super::session::{ActiveTurn, AgentSession, AgentStatus};

const ABORTED: &str = "aborted";

/// Reasons a message is not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent is busy with another message")]
    Busy,
    #[error("Message is empty")]
    EmptyMessage,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model answered without requesting more tools.
    Completed {
        final_text: Option<String>,
        iterations: usize,
        tool_calls: usize,
    },
    /// The turn hit an error and was closed with an apology message.
    Failed { error: String },
    /// Cancelled via [`Agent::abort`].
    Aborted,
}

#[derive(Debug, Error)]
enum TurnFault {
    #[error(transparent)]
    Inference(#[from] LlmError),
    #[error("Maximum iterations ({0}) reached")]
    MaxIterations(usize),
}

/// The chat agent: one session, one model, one tool registry.
pub struct Agent {
    config: Config,
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    settings: SharedSettingsStore,
    observer: Arc<dyn AgentObserver>,
    session: AgentSession,
}

impl Agent {
    /// Create a new agent with the given configuration.
    pub fn new(
        config: Config,
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        settings: SharedSettingsStore,
    ) -> Self {
        Self {
            config,
            model,
            tools,
            settings,
            observer: Arc::new(NoopObserver),
            session: AgentSession::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    pub async fn conversation(&self) -> Vec<ConversationEntry> {
        self.session.conversation().await
    }

    pub async fn status(&self) -> AgentStatus {
        self.session.status().await
    }

    /// True while a message is being processed.
    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Request cancellation of the running turn. No-op when idle.
    pub fn abort(&self) -> bool {
        let aborted = self.session.abort();
        if aborted {
            tracing::info!("Abort requested");
        }
        aborted
    }

    /// Drop the whole history. Refused while a turn is running.
    pub async fn clear_conversation(&self) -> Result<(), AgentError> {
        let turn = self.session.try_begin().ok_or(AgentError::Busy)?;
        turn.clear().await;
        tracing::info!("Conversation cleared");
        Ok(())
    }

    /// Process one user message through the tool loop.
    ///
    /// Returns `Err` only when the message is not accepted; everything that
    /// goes wrong afterwards is reported through the [`TurnOutcome`] and the
    /// conversation itself.
    pub async fn send_message(&self, text: &str) -> Result<TurnOutcome, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::EmptyMessage);
        }
        let Some(turn) = self.session.try_begin() else {
            tracing::debug!("Ignoring message while the agent loop is active");
            return Err(AgentError::Busy);
        };

        turn.push(ConversationEntry::user(text)).await;
        self.observer.on_user_message(text);

        let outcome = match self.run_turn(&turn).await {
            Ok(outcome) => outcome,
            Err(fault) => self.fail(&turn, fault).await,
        };

        if matches!(outcome, TurnOutcome::Aborted) {
            self.observer.on_error("Agent run aborted");
        }
        self.set_status(&turn, AgentStatus::Ready).await;
        Ok(outcome)
    }

    async fn run_turn(&self, turn: &ActiveTurn<'_>) -> Result<TurnOutcome, TurnFault> {
        let cancel = turn.token();
        let mut iterations = 0;
        let mut tool_calls_made = 0;
        let mut last_text = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Aborted);
            }
            if iterations >= self.config.max_iterations {
                return Err(TurnFault::MaxIterations(self.config.max_iterations));
            }
            iterations += 1;
            tracing::debug!("Agent iteration {}", iterations);

            self.set_status(turn, AgentStatus::Thinking).await;

            // Enablement may change between cycles.
            let tool_config = self.settings.tool_config().await;
            let offered = self.tools.available_tools(&tool_config);
            let conversation = turn.snapshot().await;

            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(TurnOutcome::Aborted),
                response = self.model.infer(&conversation, &offered) => response?,
            };
            if response.is_empty() {
                return Err(LlmError::EmptyResponse.into());
            }

            let text = response.visible_text().map(str::to_string);
            let calls: Vec<ToolCallRequest> = response
                .tool_calls
                .into_iter()
                .map(with_call_id)
                .collect();

            turn.push(ConversationEntry::assistant(
                text.clone().unwrap_or_default(),
                calls.clone(),
            ))
            .await;
            if let Some(text) = &text {
                self.observer.on_assistant_message(text);
                last_text = Some(text.clone());
            }

            if calls.is_empty() {
                tracing::info!(iterations, tool_calls = tool_calls_made, "Turn completed");
                return Ok(TurnOutcome::Completed {
                    final_text: last_text,
                    iterations,
                    tool_calls: tool_calls_made,
                });
            }

            self.set_status(turn, AgentStatus::Executing).await;
            tracing::debug!(count = calls.len(), model = self.model.name(), "Executing tool calls");

            for (index, call) in calls.iter().enumerate() {
                self.observer.on_tool_call_started(call);
                let result = self.execute_tool_call(call, &tool_config, cancel).await;
                self.record_result(turn, call, &result).await;
                tool_calls_made += 1;

                if cancel.is_cancelled() {
                    for skipped in &calls[index + 1..] {
                        self.record_result(turn, skipped, &ToolResult::failure(ABORTED))
                            .await;
                    }
                    return Ok(TurnOutcome::Aborted);
                }
            }
        }
    }

    /// Execute a single tool call.
    async fn execute_tool_call(
        &self,
        call: &ToolCallRequest,
        tool_config: &ToolConfig,
        cancel: &CancellationToken,
    ) -> ToolResult {
        if let Some(kind) = ToolKind::from_name(&call.name) {
            if !tool_config.is_enabled(kind)
                && self.config.disabled_tool_policy == DisabledToolPolicy::Reject
            {
                tracing::warn!(tool = %kind, "Model requested a disabled tool");
                return ToolError::Disabled(call.name.clone()).into();
            }
        }

        tracing::info!(tool = %call.name, id = %call.id, "Calling tool");
        let dispatched = tokio::select! {
            _ = cancel.cancelled() => return ToolResult::failure(ABORTED),
            dispatched = self.tools.dispatch(&call.name, call.arguments.clone()) => dispatched,
        };
        match dispatched {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool dispatch failed");
                e.into()
            }
        }
    }

    async fn record_result(&self, turn: &ActiveTurn<'_>, call: &ToolCallRequest, result: &ToolResult) {
        turn.push(ConversationEntry::tool(
            call.id.clone(),
            call.name.clone(),
            result.to_content(),
        ))
        .await;
        self.observer.on_tool_call_finished(&call.name, result);
    }

    /// Close a failed turn with exactly one apology message.
    async fn fail(&self, turn: &ActiveTurn<'_>, fault: TurnFault) -> TurnOutcome {
        let error = fault.to_string();
        tracing::error!(error = %error, "Agent execution failed");

        self.set_status(turn, AgentStatus::Error).await;
        let message = format!("Sorry, I encountered an error: {}", error);
        turn.push(ConversationEntry::assistant(message.clone(), Vec::new()))
            .await;
        self.observer.on_assistant_message(&message);
        self.observer.on_error(&error);

        TurnOutcome::Failed { error }
    }

    async fn set_status(&self, turn: &ActiveTurn<'_>, status: AgentStatus) {
        if turn.set_status(status).await {
            self.observer.on_status_changed(status);
        }
    }
}

/// Give calls without an id a generated one so results can link back.
fn with_call_id(mut call: ToolCallRequest) -> ToolCallRequest {
    if call.id.trim().is_empty() {
        call.id = format!("call_{}", Uuid::new_v4().simple());
    }
    call
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelResponse, Role, ScriptedModelClient};
    use crate::settings::SettingsStore;
    use serde_json::json;
    use tempfile::TempDir;

    async fn agent_with(responses: Vec<Result<ModelResponse, LlmError>>) -> (Agent, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(dir.path()).await);
        let agent = Agent::new(
            Config::new(dir.path().to_path_buf()),
            Arc::new(ScriptedModelClient::with_results(responses)),
            Arc::new(ToolRegistry::offline()),
            settings,
        );
        (agent, dir)
    }

    #[test]
    fn missing_call_ids_are_generated() {
        let call = with_call_id(ToolCallRequest::new("", "google_search", json!({})));
        assert!(call.id.starts_with("call_"));
        let call = with_call_id(ToolCallRequest::new("keep", "google_search", json!({})));
        assert_eq!(call.id, "keep");
    }

    #[tokio::test]
    async fn rejects_blank_messages() {
        let (agent, _dir) = agent_with(vec![]).await;
        assert_eq!(agent.send_message("   ").await, Err(AgentError::EmptyMessage));
        assert!(agent.conversation().await.is_empty());
    }

    #[tokio::test]
    async fn empty_model_response_fails_the_turn() {
        let (agent, _dir) = agent_with(vec![Ok(ModelResponse::default())]).await;
        let outcome = agent.send_message("hi").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));

        let conversation = agent.conversation().await;
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation[1].role, Role::Assistant);
        assert!(conversation[1].content.starts_with("Sorry, I encountered an error:"));
        assert_eq!(agent.status().await, AgentStatus::Ready);
        assert!(!agent.is_active());
    }

    #[tokio::test]
    async fn iteration_cap_stops_runaway_turns() {
        let call = || {
            Ok(ModelResponse::tool_calls(
                None,
                vec![ToolCallRequest::new("c", "execute_javascript", json!({ "code": "1" }))],
            ))
        };
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(dir.path()).await);
        let mut config = Config::new(dir.path().to_path_buf());
        config.max_iterations = 2;
        let agent = Agent::new(
            config,
            Arc::new(ScriptedModelClient::with_results(vec![call(), call(), call()])),
            Arc::new(ToolRegistry::offline()),
            settings,
        );

        let outcome = agent.send_message("loop").await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                error: "Maximum iterations (2) reached".to_string()
            }
        );
    }

    #[tokio::test]
    async fn clear_conversation_when_idle() {
        let (agent, _dir) = agent_with(vec![Ok(ModelResponse::text("hello"))]).await;
        agent.send_message("hi").await.unwrap();
        assert_eq!(agent.conversation().await.len(), 2);
        agent.clear_conversation().await.unwrap();
        assert!(agent.conversation().await.is_empty());
    }
}
