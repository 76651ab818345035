//! End-to-end behaviour of the agent loop over the offline tool backends.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};
use toolloop::agent::{Agent, AgentError, AgentStatus, TurnOutcome};
use toolloop::config::{Config, DisabledToolPolicy};
use toolloop::events::{AgentEvent, AgentObserver, ChannelObserver};
use toolloop::llm::{
    ConversationEntry, HeuristicModelClient, LlmError, ModelClient, ModelResponse, Role,
    ScriptedModelClient, ToolCallRequest,
};
use toolloop::settings::{SettingsStore, SharedSettingsStore, ToolConfig};
use toolloop::tools::javascript::CountingAllocator;
use toolloop::tools::{ToolKind, ToolRegistry, ToolResult, ToolSchema};

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

const ALL_TOOLS: [&str; 3] = ["google_search", "ai_pipe_request", "execute_javascript"];

struct Harness {
    agent: Arc<Agent>,
    settings: SharedSettingsStore,
    _dir: TempDir,
}

async fn harness_with(
    model: Arc<dyn ModelClient>,
    policy: DisabledToolPolicy,
    observer: Option<Arc<dyn AgentObserver>>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(SettingsStore::new(dir.path()).await);
    let mut config = Config::new(dir.path().to_path_buf());
    config.disabled_tool_policy = policy;

    let mut agent = Agent::new(
        config,
        model,
        Arc::new(ToolRegistry::offline()),
        settings.clone(),
    );
    if let Some(observer) = observer {
        agent = agent.with_observer(observer);
    }
    Harness {
        agent: Arc::new(agent),
        settings,
        _dir: dir,
    }
}

async fn harness(model: Arc<dyn ModelClient>) -> Harness {
    harness_with(model, DisabledToolPolicy::Reject, None).await
}

fn call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest::new(id, name, arguments)
}

fn tool_entries(conversation: &[ConversationEntry]) -> Vec<&ConversationEntry> {
    conversation.iter().filter(|e| e.role == Role::Tool).collect()
}

fn payload(entry: &ConversationEntry) -> Value {
    serde_json::from_str(&entry.content).unwrap()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Blocks inference until released, signalling when it is entered.
struct GatedModelClient {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ModelClient for GatedModelClient {
    async fn infer(
        &self,
        _conversation: &[ConversationEntry],
        _tools: &[ToolSchema],
    ) -> Result<ModelResponse, LlmError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(ModelResponse::text("released"))
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Aborts the agent as soon as the first tool result is recorded.
#[derive(Default)]
struct AbortAfterFirstResult {
    agent: OnceLock<Weak<Agent>>,
}

impl AgentObserver for AbortAfterFirstResult {
    fn on_tool_call_finished(&self, _name: &str, _result: &ToolResult) {
        if let Some(agent) = self.agent.get().and_then(Weak::upgrade) {
            agent.abort();
        }
    }
}

/// Disables a tool as soon as the first tool result is recorded.
struct DisableAfterFirstResult {
    settings: SharedSettingsStore,
    kind: ToolKind,
}

impl AgentObserver for DisableAfterFirstResult {
    fn on_tool_call_finished(&self, _name: &str, _result: &ToolResult) {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(self.settings.set_tool_enabled(self.kind, false))
                .unwrap();
        });
    }
}

#[tokio::test]
async fn search_request_ends_with_three_results() {
    let (observer, mut events) = ChannelObserver::new();
    let h = harness_with(
        Arc::new(HeuristicModelClient::new()),
        DisabledToolPolicy::Reject,
        Some(Arc::new(observer)),
    )
    .await;

    let outcome = h.agent.send_message("search for AI news").await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Completed {
            iterations: 2,
            tool_calls: 1,
            ..
        }
    ));

    let conversation = h.agent.conversation().await;
    let roles: Vec<Role> = conversation.iter().map(|e| e.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);

    let requested = conversation[1].calls();
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].name, "google_search");
    assert_eq!(requested[0].arguments, json!({ "query": "AI news", "num_results": 5 }));

    let result = payload(&conversation[2]);
    assert_eq!(conversation[2].tool_call_id.as_deref(), Some(requested[0].id.as_str()));
    assert_eq!(conversation[2].name.as_deref(), Some("google_search"));
    assert_eq!(result["results"].as_array().unwrap().len(), 3);
    assert_eq!(result["total_results"], 3);
    assert!(conversation[3].content.starts_with("I found 3 results for \"AI news\""));

    assert_eq!(h.agent.status().await, AgentStatus::Ready);
    assert!(!h.agent.is_active());

    let kinds: Vec<&str> = drain(&mut events)
        .iter()
        .map(|event| match event {
            AgentEvent::UserMessage { .. } => "user",
            AgentEvent::AssistantMessage { .. } => "assistant",
            AgentEvent::ToolCallStarted { .. } => "started",
            AgentEvent::ToolCallFinished { .. } => "finished",
            AgentEvent::StatusChanged { status } => match status {
                AgentStatus::Ready => "ready",
                AgentStatus::Thinking => "thinking",
                AgentStatus::Executing => "executing",
                AgentStatus::Error => "error",
            },
            AgentEvent::Error { .. } => "error_notice",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "user",
            "thinking",
            "assistant",
            "executing",
            "started",
            "finished",
            "thinking",
            "assistant",
            "ready"
        ]
    );
}

#[tokio::test]
async fn disabled_tool_is_rejected_without_running() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            None,
            vec![call("js", "execute_javascript", json!({ "code": "6 * 7" }))],
        ),
        ModelResponse::text("The tool is disabled."),
    ]));
    let h = harness(model.clone()).await;
    h.settings
        .set_tool_enabled(ToolKind::ExecuteJavascript, false)
        .await
        .unwrap();

    let outcome = h.agent.send_message("run some code").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));

    assert_eq!(model.offered_tools()[0], vec!["google_search", "ai_pipe_request"]);

    let conversation = h.agent.conversation().await;
    let tools = tool_entries(&conversation);
    assert_eq!(tools.len(), 1);
    assert_eq!(
        payload(tools[0]),
        json!({ "success": false, "error": "Tool 'execute_javascript' is disabled" })
    );
    assert_eq!(conversation.last().unwrap().content, "The tool is disabled.");
}

#[tokio::test]
async fn disabled_tool_runs_under_execute_policy() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            None,
            vec![call("js", "execute_javascript", json!({ "code": "6 * 7" }))],
        ),
        ModelResponse::text("42"),
    ]));
    let h = harness_with(model.clone(), DisabledToolPolicy::Execute, None).await;
    h.settings
        .set_tool_enabled(ToolKind::ExecuteJavascript, false)
        .await
        .unwrap();

    h.agent.send_message("run some code").await.unwrap();

    // Still hidden from the model, but dispatched when asked for.
    assert!(!model.offered_tools()[0].contains(&"execute_javascript".to_string()));
    let conversation = h.agent.conversation().await;
    let result = payload(tool_entries(&conversation)[0]);
    assert_eq!(result["success"], true);
    assert_eq!(result["result"], 42);
}

#[tokio::test]
async fn script_faults_become_failed_results() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            Some("Running both."),
            vec![
                call("div", "execute_javascript", json!({ "code": "1/0" })),
                call("net", "execute_javascript", json!({ "code": "fetch('https://example.com')" })),
            ],
        ),
        ModelResponse::text("Done."),
    ]));
    let h = harness(model).await;

    let outcome = h.agent.send_message("try these").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { tool_calls: 2, .. }));

    let conversation = h.agent.conversation().await;
    let tools = tool_entries(&conversation);
    assert_eq!(tools.len(), 2);

    let division = payload(tools[0]);
    assert_eq!(division["success"], true);
    assert_eq!(division["result"], "Infinity");

    let network = payload(tools[1]);
    assert_eq!(network["success"], false);
    assert_eq!(network["error"], "ReferenceError: fetch is not defined");
    assert_eq!(conversation.last().unwrap().content, "Done.");
}

#[tokio::test]
async fn invalid_arguments_and_unknown_tools_do_not_stop_the_batch() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            None,
            vec![
                call("a", "google_search", json!({ "num_results": 3 })),
                call("b", "send_email", json!({})),
                call("c", "execute_javascript", json!({ "code": "'ok'" })),
            ],
        ),
        ModelResponse::text("Handled."),
    ]));
    let h = harness(model).await;

    h.agent.send_message("go").await.unwrap();

    let conversation = h.agent.conversation().await;
    let tools = tool_entries(&conversation);
    assert_eq!(tools.len(), 3);
    assert_eq!(payload(tools[0])["success"], false);
    assert!(payload(tools[0])["error"]
        .as_str()
        .unwrap()
        .starts_with("Invalid arguments"));
    assert_eq!(payload(tools[1])["error"], "Unknown tool: send_email");
    assert_eq!(payload(tools[2])["result"], "ok");
}

#[tokio::test]
async fn results_follow_request_order() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            None,
            vec![
                call("first", "execute_javascript", json!({ "code": "1" })),
                call("second", "google_search", json!({ "query": "rust" })),
                call("third", "ai_pipe_request", json!({ "endpoint": "https://api.example.com/data" })),
            ],
        ),
        ModelResponse::tool_calls(
            None,
            vec![call("fourth", "execute_javascript", json!({ "code": "2" }))],
        ),
        ModelResponse::text("All done."),
    ]));
    let h = harness(model.clone()).await;

    let outcome = h.agent.send_message("do everything").await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            final_text: Some("All done.".to_string()),
            iterations: 3,
            tool_calls: 4,
        }
    );
    assert_eq!(model.calls(), 3);

    let conversation = h.agent.conversation().await;
    let ids: Vec<&str> = tool_entries(&conversation)
        .iter()
        .filter_map(|e| e.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["first", "second", "third", "fourth"]);

    // Each batch of results directly follows the assistant entry that asked for it.
    let roles: Vec<Role> = conversation.iter().map(|e| e.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Tool,
            Role::Tool,
            Role::Assistant,
            Role::Tool,
            Role::Assistant
        ]
    );
}

#[tokio::test]
async fn message_is_rejected_while_a_turn_runs() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness(Arc::new(GatedModelClient {
        entered: entered.clone(),
        release: release.clone(),
    }))
    .await;

    let running = {
        let agent = h.agent.clone();
        tokio::spawn(async move { agent.send_message("first").await })
    };
    entered.notified().await;

    assert!(h.agent.is_active());
    let before = h.agent.conversation().await;
    assert_eq!(h.agent.send_message("second").await, Err(AgentError::Busy));
    assert_eq!(h.agent.clear_conversation().await, Err(AgentError::Busy));
    assert_eq!(h.agent.conversation().await, before);
    assert_eq!(h.agent.status().await, AgentStatus::Thinking);

    release.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert!(!h.agent.is_active());

    let conversation = h.agent.conversation().await;
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[0].content, "first");
}

#[tokio::test]
async fn abort_cancels_pending_inference() {
    let (observer, mut events) = ChannelObserver::new();
    let entered = Arc::new(Notify::new());
    let h = harness_with(
        Arc::new(GatedModelClient {
            entered: entered.clone(),
            release: Arc::new(Notify::new()),
        }),
        DisabledToolPolicy::Reject,
        Some(Arc::new(observer)),
    )
    .await;

    let running = {
        let agent = h.agent.clone();
        tokio::spawn(async move { agent.send_message("hang").await })
    };
    entered.notified().await;

    assert!(h.agent.abort());
    assert_eq!(running.await.unwrap().unwrap(), TurnOutcome::Aborted);
    assert!(!h.agent.abort());

    assert_eq!(h.agent.conversation().await.len(), 1);
    assert_eq!(h.agent.status().await, AgentStatus::Ready);
    assert!(drain(&mut events).contains(&AgentEvent::Error {
        message: "Agent run aborted".to_string()
    }));
}

#[tokio::test]
async fn abort_mid_batch_still_answers_every_call() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            None,
            vec![
                call("a", "execute_javascript", json!({ "code": "1" })),
                call("b", "execute_javascript", json!({ "code": "2" })),
                call("c", "execute_javascript", json!({ "code": "3" })),
            ],
        ),
        ModelResponse::text("never reached"),
    ]));
    let observer = Arc::new(AbortAfterFirstResult::default());
    let h = harness_with(model.clone(), DisabledToolPolicy::Reject, Some(observer.clone())).await;
    observer.agent.set(Arc::downgrade(&h.agent)).unwrap();

    let outcome = h.agent.send_message("count").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Aborted);
    assert_eq!(model.calls(), 1);

    let conversation = h.agent.conversation().await;
    let tools = tool_entries(&conversation);
    assert_eq!(tools.len(), 3);
    assert_eq!(payload(tools[0])["result"], 1);
    for skipped in &tools[1..] {
        assert_eq!(payload(skipped), json!({ "success": false, "error": "aborted" }));
    }
    assert_eq!(conversation.last().unwrap().role, Role::Tool);
}

#[tokio::test]
async fn inference_failure_adds_one_apology_and_keeps_history() {
    let model = Arc::new(ScriptedModelClient::with_results(vec![
        Ok(ModelResponse::text("Hello!")),
        Err(LlmError::Network("connection refused".to_string())),
        Ok(ModelResponse::text("Back again.")),
    ]));
    let (observer, mut events) = ChannelObserver::new();
    let h = harness_with(model, DisabledToolPolicy::Reject, Some(Arc::new(observer))).await;

    h.agent.send_message("hi").await.unwrap();
    let outcome = h.agent.send_message("and now?").await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            error: "Network error: connection refused".to_string()
        }
    );

    let conversation = h.agent.conversation().await;
    assert_eq!(conversation.len(), 4);
    assert_eq!(
        conversation[3].content,
        "Sorry, I encountered an error: Network error: connection refused"
    );
    assert_eq!(h.agent.status().await, AgentStatus::Ready);

    let errors = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, AgentEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);

    // The user can simply continue.
    h.agent.send_message("retry").await.unwrap();
    assert_eq!(h.agent.conversation().await.last().unwrap().content, "Back again.");
}

#[tokio::test]
async fn tool_offer_follows_settings_between_cycles() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::text("one"),
        ModelResponse::text("two"),
    ]));
    let h = harness(model.clone()).await;

    h.agent.send_message("first").await.unwrap();
    h.settings
        .set_tool_enabled(ToolKind::GoogleSearch, false)
        .await
        .unwrap();
    h.agent.send_message("second").await.unwrap();

    let offered = model.offered_tools();
    assert_eq!(offered[0], ALL_TOOLS);
    assert_eq!(offered[1], vec!["ai_pipe_request", "execute_javascript"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_offer_is_reread_within_a_turn() {
    let dir = tempfile::tempdir().unwrap();
    let settings: SharedSettingsStore = Arc::new(SettingsStore::new(dir.path()).await);
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            None,
            vec![call("js", "execute_javascript", json!({ "code": "1 + 1" }))],
        ),
        ModelResponse::text("two"),
    ]));
    let agent = Arc::new(
        Agent::new(
            Config::new(dir.path().to_path_buf()),
            model.clone(),
            Arc::new(ToolRegistry::offline()),
            settings.clone(),
        )
        .with_observer(Arc::new(DisableAfterFirstResult {
            settings: settings.clone(),
            kind: ToolKind::GoogleSearch,
        })),
    );

    // Run on a worker thread so the observer may block in place.
    let outcome = tokio::spawn(async move { agent.send_message("add").await })
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { iterations: 2, .. }));

    let offered = model.offered_tools();
    assert_eq!(offered.len(), 2);
    assert_eq!(offered[0], ALL_TOOLS);
    assert_eq!(offered[1], vec!["ai_pipe_request", "execute_javascript"]);
}

#[tokio::test]
async fn memory_hungry_script_is_a_failed_result() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        ModelResponse::tool_calls(
            None,
            vec![call(
                "big",
                "execute_javascript",
                json!({ "code": "const s = 'x'.repeat(8000000); const a = []; for (let i = 0; i < 1000; i++) a.push(s + i);" }),
            )],
        ),
        ModelResponse::text("That used too much memory."),
    ]));
    let h = harness(model).await;

    let outcome = h.agent.send_message("fill memory").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));

    let conversation = h.agent.conversation().await;
    let result = payload(tool_entries(&conversation)[0]);
    assert_eq!(result["success"], false);
    assert!(result["error"]
        .as_str()
        .unwrap()
        .contains("exceeded the memory limit"));
    assert_eq!(conversation.last().unwrap().content, "That used too much memory.");
}

#[tokio::test]
async fn available_tools_is_stable() {
    let registry = ToolRegistry::offline();
    let mut config = ToolConfig::default();
    config.set_enabled(ToolKind::AiPipeRequest, false);

    let first = registry.available_tools(&config);
    let second = registry.available_tools(&config);
    assert_eq!(first, second);
    let names: Vec<&str> = first.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["google_search", "execute_javascript"]);
}

#[tokio::test]
async fn tool_config_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = SettingsStore::new(dir.path()).await;
        store
            .set_tool_enabled(ToolKind::ExecuteJavascript, false)
            .await
            .unwrap();
        store
            .set_tool_credential(ToolKind::GoogleSearch, "api_key", "secret")
            .await
            .unwrap();
    }

    let reopened = SettingsStore::new(dir.path()).await;
    let config = reopened.tool_config().await;
    let mut expected = ToolConfig::default();
    expected.set_enabled(ToolKind::ExecuteJavascript, false);
    expected.set_credential(ToolKind::GoogleSearch, "api_key", "secret");
    assert_eq!(config, expected);
}

#[tokio::test]
async fn corrupt_settings_start_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("llm_config.json"), "{ not json").unwrap();
    std::fs::write(dir.path().join("tool_config.json"), "[1, 2").unwrap();

    let settings = Arc::new(SettingsStore::new(dir.path()).await);
    assert_eq!(settings.tool_config().await, ToolConfig::default());
    assert!(!settings.llm_config().await.is_connected());

    let model = Arc::new(ScriptedModelClient::new(vec![ModelResponse::text("fine")]));
    let agent = Agent::new(
        Config::new(dir.path().to_path_buf()),
        model.clone(),
        Arc::new(ToolRegistry::offline()),
        settings,
    );
    agent.send_message("hello").await.unwrap();
    assert_eq!(model.offered_tools()[0], ALL_TOOLS);
}
