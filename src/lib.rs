//! # toolloop
//!
//! A conversational agent that lets a language model call tools in a loop.
//!
//! This library provides:
//! - The agent loop that alternates model inference and tool execution
//! - A closed registry of tools: web search, generic HTTP requests and a
//!   sandboxed JavaScript interpreter
//! - Persisted LLM and tool settings
//! - An OpenAI-compatible model client plus deterministic offline doubles
//!
//! ## Architecture
//!
//! The agent follows the "tools in a loop" pattern:
//! 1. Receive a user message
//! 2. Offer the model the schemas of the enabled tools
//! 3. Call the model, execute any tool calls it returns
//! 4. Feed the results back and repeat until it answers with text only
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use toolloop::{agent::Agent, config::Config, llm::HeuristicModelClient};
//! use toolloop::{settings::SettingsStore, tools::ToolRegistry};
//!
//! let config = Config::from_env()?;
//! let settings = Arc::new(SettingsStore::new(&config.data_dir).await);
//! let agent = Agent::new(
//!     config,
//!     Arc::new(HeuristicModelClient::new()),
//!     Arc::new(ToolRegistry::offline()),
//!     settings,
//! );
//! let outcome = agent.send_message("Calculate the factorial of 10").await?;
//! ```

pub mod agent;
pub mod config;
pub mod events;
pub mod llm;
pub mod providers;
pub mod settings;
pub mod tools;

pub use config::Config;

#[cfg(test)]
#[global_allocator]
static ALLOCATOR: tools::javascript::CountingAllocator = tools::javascript::CountingAllocator;
