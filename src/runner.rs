//! Agent runner: one turn, one message
//!
//! Runs the selected agent against a snapshot of the conversation, applies the
//! forced-termination filter to the tools it invoked, appends exactly one
//! assistant message and publishes it. A failed turn appends nothing.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::agent::{GroupAgent, TurnContext};
use crate::error::{GroupChatError, Result};
use crate::events::EventNotifier;
use crate::filters::ForcedTerminationFilter;
use crate::items::Message;
use crate::memory::ConversationHandle;
use crate::provider::Usage;

/// What a completed turn left behind.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    /// The appended message
    pub message: Message,
    /// Forced-termination tool that fired during the turn
    pub forced_by: Option<String>,
    pub usage: Usage,
}

impl TurnRecord {
    pub fn is_forced(&self) -> bool {
        self.forced_by.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct AgentRunner {
    filter: ForcedTerminationFilter,
    notifier: EventNotifier,
}

impl AgentRunner {
    pub fn new(filter: ForcedTerminationFilter, notifier: EventNotifier) -> Self {
        Self { filter, notifier }
    }

    pub fn filter(&self) -> &ForcedTerminationFilter {
        &self.filter
    }

    #[instrument(skip_all, fields(agent = %agent.name(), turn = turn))]
    pub async fn run_turn(
        &self,
        agent: &Arc<dyn GroupAgent>,
        conversation: &ConversationHandle,
        turn: usize,
    ) -> Result<TurnRecord> {
        let history = conversation.snapshot().await;
        let ctx = TurnContext::new(history)
            .with_filter(self.filter.clone())
            .with_turn(turn);

        let output = agent.respond(ctx).await.map_err(|e| match e {
            GroupChatError::AgentExecution { .. } | GroupChatError::Cancelled(_) => e,
            other => GroupChatError::agent(agent.name(), other),
        })?;

        // Agents other than ChatAgent may only report what they invoked.
        let forced_by = output
            .forced_by
            .clone()
            .or_else(|| self.filter.first_match(&output.invoked_tools));

        let message =
            Message::assistant(agent.name(), output.content).with_tool_calls(output.invoked_tools);
        conversation.append(message.clone()).await;
        self.notifier.message(&message);
        debug!(forced = ?forced_by, chars = message.content.len(), "turn appended");

        Ok(TurnRecord {
            message,
            forced_by,
            usage: output.usage,
        })
    }
}
