//! Session state owned by the agent loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::llm::ConversationEntry;

/// Observable loop status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Ready,
    Thinking,
    Executing,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Thinking => write!(f, "Thinking"),
            Self::Executing => write!(f, "Executing"),
            Self::Error => write!(f, "Error"),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    conversation: Vec<ConversationEntry>,
    status: AgentStatus,
}

/// Conversation, status and the `loop_active` gate of one chat session.
///
/// Only the loop mutates the conversation, and only while it holds an
/// [`ActiveTurn`]; everyone else gets snapshots.
#[derive(Debug, Default)]
pub struct AgentSession {
    state: RwLock<SessionState>,
    loop_active: AtomicBool,
    abort: Mutex<CancellationToken>,
}

impl AgentSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a turn is running.
    pub fn is_active(&self) -> bool {
        self.loop_active.load(Ordering::Acquire)
    }

    pub async fn conversation(&self) -> Vec<ConversationEntry> {
        self.state.read().await.conversation.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.conversation.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn status(&self) -> AgentStatus {
        self.state.read().await.status
    }

    /// Cancel the running turn. Returns false when idle.
    pub fn abort(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.abort.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        true
    }

    /// Claim the session for a turn, or `None` if one is already running.
    pub(crate) fn try_begin(&self) -> Option<ActiveTurn<'_>> {
        self.loop_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let token = CancellationToken::new();
        *self.abort.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        Some(ActiveTurn { session: self, token })
    }
}

/// Exclusive hold on the session; clears `loop_active` when dropped.
pub(crate) struct ActiveTurn<'a> {
    session: &'a AgentSession,
    token: CancellationToken,
}

impl ActiveTurn<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn push(&self, entry: ConversationEntry) {
        self.session.state.write().await.conversation.push(entry);
    }

    pub async fn snapshot(&self) -> Vec<ConversationEntry> {
        self.session.conversation().await
    }

    /// Set the status; returns whether it changed.
    pub async fn set_status(&self, status: AgentStatus) -> bool {
        let mut state = self.session.state.write().await;
        let changed = state.status != status;
        state.status = status;
        changed
    }

    pub async fn clear(&self) {
        self.session.state.write().await.conversation.clear();
    }
}

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        self.session.loop_active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_refused_until_drop() {
        let session = AgentSession::new();
        let turn = session.try_begin().unwrap();
        assert!(session.is_active());
        assert!(session.try_begin().is_none());
        drop(turn);
        assert!(!session.is_active());
        assert!(session.try_begin().is_some());
    }

    #[test]
    fn abort_only_hits_the_running_turn() {
        let session = AgentSession::new();
        assert!(!session.abort());

        let turn = session.try_begin().unwrap();
        assert!(session.abort());
        assert!(turn.token().is_cancelled());
        drop(turn);

        let next = session.try_begin().unwrap();
        assert!(!next.token().is_cancelled());
    }

    #[tokio::test]
    async fn turn_mutates_state() {
        let session = AgentSession::new();
        let turn = session.try_begin().unwrap();
        turn.push(ConversationEntry::user("hello")).await;
        assert!(turn.set_status(AgentStatus::Thinking).await);
        assert!(!turn.set_status(AgentStatus::Thinking).await);
        drop(turn);

        assert_eq!(session.len().await, 1);
        assert_eq!(session.status().await, AgentStatus::Thinking);
        assert_eq!(AgentStatus::Executing.to_string(), "Executing");
    }
}
