//! Agent module - the tool-calling chat loop.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Append the user message to the conversation
//! 2. Call the model with the currently enabled tools
//! 3. If the model requests tool calls, execute them in order and feed
//!    each result back
//! 4. Repeat until the model answers without tool calls, the turn is
//!    aborted, or the iteration cap is reached

mod agent_loop;
mod prompt;
mod session;

pub use agent_loop::{Agent, AgentError, TurnOutcome};
pub use prompt::build_system_prompt;
pub use session::{AgentSession, AgentStatus};
