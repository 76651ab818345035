//! toolloop - interactive entry point
//!
//! Reads messages from stdin, runs them through the agent loop and prints
//! what the agent does. Ctrl-C aborts the running turn, or exits at the
//! prompt.

use std::io::Write;
use std::sync::Arc;

use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use toolloop::agent::{Agent, AgentStatus, TurnOutcome};
use toolloop::config::Config;
use toolloop::events::AgentObserver;
use toolloop::llm::{
    self, HeuristicModelClient, ModelClient, OpenAiCompatibleClient, ToolCallRequest,
};
use toolloop::providers::PROVIDERS;
use toolloop::settings::{LlmConfig, SettingsStore, SharedSettingsStore};
use toolloop::tools::javascript::CountingAllocator;
use toolloop::tools::{ToolKind, ToolRegistry, ToolResult};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Lets the script sandbox bound the memory a script holds.
#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

/// Longest tool result echoed to the terminal.
const MAX_RESULT_PREVIEW: usize = 400;

const HELP: &str = "\
Commands:
  /providers                          list LLM providers and models
  /provider <id> <model> <api_key>    connect to a provider
  /test                               check the connected provider with one request
  /tools                              list tools and whether they are enabled
  /tool <name> on|off                 enable or disable a tool
  /credential <tool> <key> <value>    store a tool credential
  /clear                              start a new conversation
  /quit                               exit
Anything else is sent to the agent. Ctrl-C aborts a running turn, or
exits when pressed at the prompt.";

/// Prints loop events with a local timestamp.
struct ConsolePrinter;

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn preview(text: &str) -> String {
    if text.chars().count() <= MAX_RESULT_PREVIEW {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_RESULT_PREVIEW).collect();
    format!("{}...", cut)
}

impl AgentObserver for ConsolePrinter {
    fn on_assistant_message(&self, text: &str) {
        println!("[{}] Agent: {}", timestamp(), text);
    }

    fn on_tool_call_started(&self, call: &ToolCallRequest) {
        println!("[{}] -> {} {}", timestamp(), call.name, call.arguments);
    }

    fn on_tool_call_finished(&self, name: &str, result: &ToolResult) {
        let verdict = if result.is_error { "failed" } else { "ok" };
        println!(
            "[{}] <- {} {}: {}",
            timestamp(),
            name,
            verdict,
            preview(&result.to_content())
        );
    }

    fn on_status_changed(&self, status: AgentStatus) {
        if status != AgentStatus::Ready {
            println!("[{}] ({})", timestamp(), status);
        }
    }

    fn on_error(&self, message: &str) {
        eprintln!("[{}] {}", timestamp(), message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they do not interleave with the conversation.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "toolloop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        offline = config.offline,
        max_iterations = config.max_iterations,
        "Loaded configuration"
    );

    let settings: SharedSettingsStore = Arc::new(SettingsStore::new(&config.data_dir).await);
    let offline = config.offline;

    let (model, registry): (Arc<dyn ModelClient>, ToolRegistry) = if offline {
        (Arc::new(HeuristicModelClient::new()), ToolRegistry::offline())
    } else {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        (
            Arc::new(OpenAiCompatibleClient::new(client.clone(), settings.clone())),
            ToolRegistry::online(client, settings.clone()),
        )
    };
    let registry = Arc::new(registry);
    let agent = Arc::new(
        Agent::new(config, model.clone(), registry.clone(), settings.clone())
            .with_observer(Arc::new(ConsolePrinter)),
    );

    println!("toolloop ({} mode). Type /help for commands.", if offline { "offline" } else { "online" });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            if !run_command(command, &agent, model.as_ref(), &registry, &settings).await {
                break;
            }
            continue;
        }

        if !offline && !settings.llm_config().await.is_connected() {
            println!("No LLM provider connected. Use /provider <id> <model> <api_key> first.");
            continue;
        }
        run_turn(&agent, line).await;
    }

    Ok(())
}

/// Send one message, aborting it on Ctrl-C.
async fn run_turn(agent: &Arc<Agent>, text: &str) {
    println!("[{}] You: {}", timestamp(), text);

    let mut task = {
        let agent = agent.clone();
        let text = text.to_string();
        tokio::spawn(async move { agent.send_message(&text).await })
    };

    let mut watch_ctrl_c = true;
    let joined = loop {
        tokio::select! {
            joined = &mut task => break joined,
            signal = tokio::signal::ctrl_c(), if watch_ctrl_c => match signal {
                Ok(()) => {
                    if agent.abort() {
                        println!("[{}] Aborting...", timestamp());
                    }
                }
                Err(e) => {
                    tracing::warn!("Cannot listen for Ctrl-C: {}", e);
                    watch_ctrl_c = false;
                }
            },
        }
    };

    match joined {
        Ok(Ok(TurnOutcome::Completed {
            iterations,
            tool_calls,
            ..
        })) => {
            tracing::debug!(iterations, tool_calls, "Turn completed");
        }
        Ok(Ok(TurnOutcome::Failed { error })) => {
            tracing::debug!(error = %error, "Turn failed");
        }
        Ok(Ok(TurnOutcome::Aborted)) => println!("[{}] Turn aborted.", timestamp()),
        Ok(Err(e)) => println!("{}", e),
        Err(e) => tracing::error!("Agent task failed: {}", e),
    }
}

/// Handle a `/command`. Returns false when the REPL should exit.
async fn run_command(
    command: &str,
    agent: &Agent,
    model: &dyn ModelClient,
    registry: &ToolRegistry,
    settings: &SharedSettingsStore,
) -> bool {
    let parts: Vec<&str> = command.split_whitespace().collect();
    match parts.as_slice() {
        ["quit"] | ["exit"] => return false,
        ["help"] => println!("{}", HELP),
        ["providers"] => {
            let current = settings.llm_config().await;
            for provider in PROVIDERS {
                let marker = if current.provider_id.as_deref() == Some(provider.id) {
                    "*"
                } else {
                    " "
                };
                let support = if provider.openai_compatible {
                    ""
                } else {
                    " (not supported by this client)"
                };
                println!("{} {:<10} {}{}", marker, provider.id, provider.name, support);
                println!("             models: {}", provider.models.join(", "));
            }
        }
        ["provider", id, model, api_key] => match LlmConfig::for_provider(id, model, api_key) {
            Ok(llm) => {
                let name = llm.provider().map_or(*id, |p| p.name);
                match settings.set_llm_config(llm).await {
                    Ok(()) => println!("Connected to {} ({}).", name, model),
                    Err(e) => println!("Failed to save settings: {}", e),
                }
            }
            Err(e) => println!("{}", e),
        },
        ["test"] => {
            println!("[{}] Testing connection with {}...", timestamp(), model.name());
            match llm::test_connection(model).await {
                Ok(()) => println!("Connection successful! Ready to use."),
                Err(e) => println!("Connection error: {}", e),
            }
        }
        ["tools"] => {
            let config = settings.tool_config().await;
            for schema in registry.all_tools() {
                let enabled = ToolKind::from_name(&schema.name).is_some_and(|k| config.is_enabled(k));
                println!(
                    "[{}] {:<20} {}",
                    if enabled { "on" } else { "off" },
                    schema.name,
                    schema.description
                );
            }
        }
        ["tool", name, state @ ("on" | "off")] => match ToolKind::from_name(name) {
            Some(kind) => match settings.set_tool_enabled(kind, *state == "on").await {
                Ok((true, _)) => println!("{} is now {}.", kind, state),
                Ok((false, _)) => println!("{} is already {}.", kind, state),
                Err(e) => println!("Failed to save settings: {}", e),
            },
            None => println!("Unknown tool: {}", name),
        },
        ["credential", tool, key, value] => match ToolKind::from_name(tool) {
            Some(kind) => match settings.set_tool_credential(kind, key, value).await {
                Ok(()) => println!("Saved {} for {}.", key, kind),
                Err(e) => println!("Failed to save settings: {}", e),
            },
            None => println!("Unknown tool: {}", tool),
        },
        ["clear"] => match agent.clear_conversation().await {
            Ok(()) => println!("Conversation cleared."),
            Err(e) => println!("{}", e),
        },
        _ => println!("Unknown command. Type /help for commands."),
    }
    true
}
