//! Observer contract between the agent loop and whatever renders it.
//!
//! The loop calls these hooks synchronously as it runs and ignores their
//! results. [`ChannelObserver`] turns them into [`AgentEvent`]s for
//! front-ends that consume a stream.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::agent::AgentStatus;
use crate::llm::ToolCallRequest;
use crate::tools::ToolResult;

/// Hooks invoked by the agent loop.
pub trait AgentObserver: Send + Sync {
    fn on_user_message(&self, _text: &str) {}

    fn on_assistant_message(&self, _text: &str) {}

    fn on_tool_call_started(&self, _call: &ToolCallRequest) {}

    fn on_tool_call_finished(&self, _name: &str, _result: &ToolResult) {}

    fn on_status_changed(&self, _status: AgentStatus) {}

    /// Transient notification for a failed or aborted turn.
    fn on_error(&self, _message: &str) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl AgentObserver for NoopObserver {}

/// Loop events as data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    UserMessage { text: String },
    AssistantMessage { text: String },
    ToolCallStarted { call: ToolCallRequest },
    ToolCallFinished { name: String, result: ToolResult },
    StatusChanged { status: AgentStatus },
    Error { message: String },
}

/// Forwards every hook as an [`AgentEvent`] on an unbounded channel.
///
/// Events are dropped once the receiver is gone.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

impl AgentObserver for ChannelObserver {
    fn on_user_message(&self, text: &str) {
        self.send(AgentEvent::UserMessage {
            text: text.to_string(),
        });
    }

    fn on_assistant_message(&self, text: &str) {
        self.send(AgentEvent::AssistantMessage {
            text: text.to_string(),
        });
    }

    fn on_tool_call_started(&self, call: &ToolCallRequest) {
        self.send(AgentEvent::ToolCallStarted { call: call.clone() });
    }

    fn on_tool_call_finished(&self, name: &str, result: &ToolResult) {
        self.send(AgentEvent::ToolCallFinished {
            name: name.to_string(),
            result: result.clone(),
        });
    }

    fn on_status_changed(&self, status: AgentStatus) {
        self.send(AgentEvent::StatusChanged { status });
    }

    fn on_error(&self, message: &str) {
        self.send(AgentEvent::Error {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_observer_forwards_in_order() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_user_message("hi");
        observer.on_status_changed(AgentStatus::Thinking);
        observer.on_tool_call_finished("google_search", &ToolResult::ok(json!({ "total_results": 0 })));

        assert_eq!(rx.try_recv().unwrap(), AgentEvent::UserMessage { text: "hi".to_string() });
        assert_eq!(
            rx.try_recv().unwrap(),
            AgentEvent::StatusChanged {
                status: AgentStatus::Thinking
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), AgentEvent::ToolCallFinished { name, .. } if name == "google_search"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_ignored() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_error("nobody listening");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = AgentEvent::Error {
            message: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "error", "message": "boom" })
        );
    }
}
