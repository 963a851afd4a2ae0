//! # Tower Group Chat
//!
//! A Tower-based orchestrator for multi-agent group chats over OpenAI LLMs.
//! A fixed set of agents shares one append-only conversation; each turn a
//! selection strategy picks the next speaker, the speaker appends exactly one
//! message, and a bounded termination strategy decides whether to stop.
//!
//! ## Core Concepts
//!
//! - **Agent**: a named participant implementing [`GroupAgent`]; [`ChatAgent`]
//!   drives a completion provider with bound arguments and tools
//! - **Selection / Termination**: Tower services deciding who speaks next and
//!   whether to stop; prompt-based versions ask the LLM for structured JSON
//! - **Forced termination**: a turn that invokes a configured tool (e.g.
//!   `execute_query`) completes the run right away
//! - **Sessions**: [`SessionManager`] guarantees at most one active loop per
//!   session and exposes only request/response operations
//!
//! ## Getting Started
//!
//! Set your OpenAI API key in the `OPENAI_API_KEY` environment variable.
//!
//! ```rust,no_run
//! use tower_groupchat::{
//!     harden, ChatAgent, GroupChat, GroupChatConfig, Message, OpenAIProvider,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = GroupChatConfig::default();
//! let provider = harden(OpenAIProvider::from_env(), &config);
//!
//! let writer = ChatAgent::builder("Writer")
//!     .config(&config)
//!     .description("Drafts answers")
//!     .instructions("Answer the user's question briefly.")
//!     .build(provider.clone())?;
//! let reviewer = ChatAgent::builder("Reviewer")
//!     .config(&config)
//!     .description("Checks drafts and approves them")
//!     .instructions("Review the last answer. Say 'approved' when it is good.")
//!     .build(provider.clone())?;
//!
//! let mut group = GroupChat::builder("demo")
//!     .config(&config)
//!     .agent(writer)
//!     .agent(reviewer)
//!     .prompt_strategies(provider, &config)
//!     .build()?;
//!
//! group.add_message(Message::user("What is a B-tree?")).await;
//! let run = group.invoke(&CancellationToken::new()).await?;
//! for message in &run.messages {
//!     println!("{}", message.transcript_line());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod filters;
pub mod groups;
pub mod items;
pub mod memory;
pub mod observability;
pub mod provider;
pub mod resilience;
pub mod runner;
pub mod selection;
pub mod sessions;
pub mod termination;
pub mod tool;

pub use agent::{
    AgentArguments, AgentDescriptor, AgentRegistry, ChatAgent, ChatAgentBuilder, GroupAgent,
    TurnContext, TurnOutput,
};
pub use config::{BusyPolicy, GroupChatConfig, RetryConfig};
pub use error::{GroupChatError, Result};
pub use events::{EventNotifier, GroupChatEvent};
pub use filters::ForcedTerminationFilter;
pub use groups::{GroupBuilder, GroupChat, GroupRun, LoopPhase, StopCause};
pub use items::{Message, Role};
pub use memory::{ConversationHandle, TruncationReducer};
pub use observability::{init_tracing, spawn_event_logger, LogFormat};
pub use provider::{
    BoxModelService, FixedProvider, ModelService, OpenAIProvider, ProviderResponse,
    ScriptedProvider, Usage,
};
pub use resilience::harden;
pub use selection::{
    PromptSelectionStrategy, SelectionRequest, SelectionResult, SelectionStrategy,
    SequentialSelectionStrategy,
};
pub use sessions::{GroupFactory, SessionId, SessionManager};
pub use termination::{
    PromptTerminationStrategy, Termination, TerminationRequest, TerminationResult,
    TerminationStrategy, TerminationVerdict,
};
pub use tool::{tool_typed, ToolDef, ToolInvocation, ToolOutput, ToolRouter};

// Re-export async-openai types that users need
pub use async_openai::{config::OpenAIConfig, Client};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
