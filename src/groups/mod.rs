//! Multi-agent group chat orchestration
//!
//! A `GroupChat` ties the registry, the two decision points and the runner
//! into repeated turns:
//!
//! ```text
//! IDLE → SELECTING → RUNNING → EVALUATING_TERMINATION → (SELECTING | COMPLETE)
//!                     any state ──error──▶ FAILED
//! ```
//!
//! - **Selection** (who speaks next) sees the conversation and the candidate
//!   agents. Every decoded decision is published before the name is checked
//!   against the registry; an unknown name fails the run.
//! - **Termination** (should we stop) sees only a bounded suffix of the
//!   conversation and is capped: the evaluation after `max_iterations` stops
//!   the run without asking the strategy.
//! - **Forced termination**: a turn that invoked a configured tool completes
//!   the run right away and the termination strategy is not consulted.
//!
//! Composition
//! ```rust,ignore
//! let mut group = GroupBuilder::new("session-1")
//!     .agent(query_builder)
//!     .agent(chart_visualizer)
//!     .agent(markdown_formatter)
//!     .selection(PromptSelectionStrategy::new(provider.clone(), "gpt-4o-mini"))
//!     .termination(PromptTerminationStrategy::new(provider, "gpt-4o-mini"))
//!     .forced_termination_tools(["execute_query"])
//!     .build()?;
//! group.add_message(Message::user("show me delays for flight AA123")).await;
//! let run = group.invoke(&CancellationToken::new()).await?;
//! ```
//!
//! Testing strategy
//! - Fake agents implementing `GroupAgent`, decision strategies from
//!   `tower::service_fn` and the scripted provider
//! - Assert the appended messages, the stop cause, which decisions reached a
//!   provider, and the event sequence

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::{util::BoxCloneService, Service, ServiceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentRegistry, GroupAgent};
use crate::config::GroupChatConfig;
use crate::error::{GroupChatError, Result};
use crate::events::{EventNotifier, GroupChatEvent};
use crate::filters::ForcedTerminationFilter;
use crate::items::Message;
use crate::memory::ConversationHandle;
use crate::provider::{BoxModelService, Usage};
use crate::runner::AgentRunner;
use crate::selection::{
    BoxSelectionStrategy, PromptSelectionStrategy, SelectionRequest, SelectionStrategy,
    SequentialSelectionStrategy,
};
use crate::termination::{
    never_terminate, BoxTerminationStrategy, PromptTerminationStrategy, Termination,
    TerminationStrategy, VerdictSource,
};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Selecting,
    Running,
    EvaluatingTermination,
    Complete,
    Failed,
}

/// Why a run reached `COMPLETE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// A forced-termination tool ran during the last turn
    ForcedByTool(String),
    /// The termination strategy voted to stop
    TerminationStrategy { reason: String },
    /// The evaluation counter exceeded the configured maximum
    MaxIterations,
}

/// Result of one run of the loop.
#[derive(Debug, Clone)]
pub struct GroupRun {
    /// Messages appended during this run, in order
    pub messages: Vec<Message>,
    pub turns: usize,
    pub stop: StopCause,
    /// Token usage of the agent turns
    pub usage: Usage,
}

impl GroupRun {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// One session's orchestration loop and the state it owns.
pub struct GroupChat {
    session_id: String,
    registry: AgentRegistry,
    selection: BoxSelectionStrategy,
    termination: Termination,
    runner: AgentRunner,
    conversation: ConversationHandle,
    notifier: EventNotifier,
    phase: LoopPhase,
    reset_iterations_on_complete: bool,
}

impl std::fmt::Debug for GroupChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupChat")
            .field("session_id", &self.session_id)
            .field("agents", &self.registry)
            .field("termination", &self.termination)
            .field("phase", &self.phase)
            .finish()
    }
}

impl GroupChat {
    pub fn builder(session_id: impl Into<String>) -> GroupBuilder {
        GroupBuilder::new(session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Termination evaluations since the last reset.
    pub fn iterations(&self) -> usize {
        self.termination.iterations()
    }

    pub fn max_iterations(&self) -> usize {
        self.termination.max_iterations()
    }

    pub fn conversation(&self) -> &ConversationHandle {
        &self.conversation
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GroupChatEvent> {
        self.notifier.subscribe()
    }

    /// Route this group's events to `notifier`.
    ///
    /// Used by owners that hand out subscriptions before the group exists.
    pub fn set_notifier(&mut self, notifier: EventNotifier) {
        self.runner = AgentRunner::new(self.runner.filter().clone(), notifier.clone());
        self.notifier = notifier;
    }

    // `GroupChat` is not `Sync`: these futures must own a handle clone, never
    // borrow `self`, to stay `Send`.

    pub fn add_message(&self, message: Message) -> impl Future<Output = ()> + Send + 'static {
        let conversation = self.conversation.clone();
        async move { conversation.append(message).await }
    }

    pub fn add_messages(
        &self,
        messages: impl IntoIterator<Item = Message>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let conversation = self.conversation.clone();
        let messages: Vec<Message> = messages.into_iter().collect();
        async move { conversation.extend(messages).await }
    }

    pub fn history(&self) -> impl Future<Output = Vec<Message>> + Send + 'static {
        let conversation = self.conversation.clone();
        async move { conversation.snapshot().await }
    }

    /// Clear the iteration counter without touching the conversation.
    pub fn reset_iterations(&mut self) {
        self.termination.reset();
    }

    /// Run turns until the loop completes, fails or `cancel` fires.
    ///
    /// A failed or cancelled run leaves every message appended by earlier,
    /// completed turns in place and never appends a partial one.
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn invoke(&mut self, cancel: &CancellationToken) -> Result<GroupRun> {
        self.phase = LoopPhase::Idle;
        info!(
            agents = self.registry.len(),
            iterations = self.termination.iterations(),
            "🚀 group chat run starting"
        );

        let session_id = self.session_id.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GroupChatError::Cancelled(format!(
                "session {} shut down",
                session_id
            ))),
            run = self.run_turns() => run,
        };

        match outcome {
            Ok(run) => {
                self.phase = LoopPhase::Complete;
                if self.reset_iterations_on_complete {
                    self.termination.reset();
                }
                info!(turns = run.turns, stop = ?run.stop, "🎯 group chat run complete");
                self.notifier.completed(run.turns, &run.stop);
                Ok(run)
            }
            Err(e) => {
                self.phase = LoopPhase::Failed;
                match &e {
                    GroupChatError::Cancelled(_) => warn!("group chat run cancelled"),
                    other => error!(kind = other.kind(), error = %other, "❌ group chat run failed"),
                }
                self.notifier.failed(&e);
                Err(e)
            }
        }
    }

    async fn run_turns(&mut self) -> Result<GroupRun> {
        let mut messages = Vec::new();
        let mut usage = Usage::default();
        let mut turns = 0usize;

        let stop = loop {
            // SELECTING
            self.phase = LoopPhase::Selecting;
            let request = SelectionRequest::new(
                self.conversation.snapshot().await,
                self.registry.descriptors(),
            );
            let selection = self.selection.ready().await?.call(request).await?;
            self.notifier.selection(&selection);
            let agent = self.registry.resolve(&selection.next_agent)?;
            info!(agent = %selection.next_agent, reason = %selection.reason, "📍 agent selected");

            // RUNNING
            self.phase = LoopPhase::Running;
            turns += 1;
            let record = self
                .runner
                .run_turn(&agent, &self.conversation, turns)
                .await?;
            usage += record.usage;
            messages.push(record.message);

            // EVALUATING_TERMINATION
            self.phase = LoopPhase::EvaluatingTermination;
            if let Some(tool) = record.forced_by {
                info!(agent = %agent.name(), tool = %tool, "🛑 forced termination");
                break StopCause::ForcedByTool(tool);
            }

            let history = self.conversation.snapshot().await;
            let result = self
                .termination
                .evaluate(agent.name(), &history, &self.registry.descriptors())
                .await?;
            self.notifier.termination(agent.name(), &result);
            debug!(
                iteration = result.iteration,
                should_stop = result.should_stop,
                source = ?result.source,
                "termination evaluated"
            );
            if result.should_stop {
                break match result.source {
                    VerdictSource::MaxIterations => StopCause::MaxIterations,
                    _ => StopCause::TerminationStrategy {
                        reason: result.reason,
                    },
                };
            }
        };

        Ok(GroupRun {
            messages,
            turns,
            stop,
            usage,
        })
    }
}

/// Assembles a [`GroupChat`].
pub struct GroupBuilder {
    session_id: String,
    agents: Vec<Arc<dyn GroupAgent>>,
    selection: Option<BoxSelectionStrategy>,
    termination: Option<BoxTerminationStrategy>,
    max_iterations: usize,
    termination_window: usize,
    termination_agents: Option<Vec<String>>,
    forced_tools: Vec<String>,
    reset_iterations_on_complete: bool,
    event_capacity: usize,
    notifier: Option<EventNotifier>,
    conversation: Option<ConversationHandle>,
}

impl GroupBuilder {
    pub fn new(session_id: impl Into<String>) -> Self {
        let defaults = GroupChatConfig::default();
        Self {
            session_id: session_id.into(),
            agents: Vec::new(),
            selection: None,
            termination: None,
            max_iterations: defaults.max_iterations,
            termination_window: defaults.termination_window,
            termination_agents: None,
            forced_tools: defaults.forced_termination_tools,
            reset_iterations_on_complete: defaults.reset_iterations_on_complete,
            event_capacity: defaults.event_capacity,
            notifier: None,
            conversation: None,
        }
    }

    /// Apply loop bounds and forced tools from `config`.
    pub fn config(mut self, config: &GroupChatConfig) -> Self {
        self.max_iterations = config.max_iterations;
        self.termination_window = config.termination_window;
        self.forced_tools = config.forced_termination_tools.clone();
        self.reset_iterations_on_complete = config.reset_iterations_on_complete;
        self.event_capacity = config.event_capacity;
        self
    }

    /// Prompt-based selection and termination over `provider`, using the
    /// decision model and selection window from `config`.
    pub fn prompt_strategies(self, provider: BoxModelService, config: &GroupChatConfig) -> Self {
        let selection = PromptSelectionStrategy::new(provider.clone(), &config.decision_model)
            .with_window(config.selection_window);
        let termination = PromptTerminationStrategy::new(provider, &config.decision_model);
        self.selection(selection).termination(termination)
    }

    pub fn agent<A>(mut self, agent: A) -> Self
    where
        A: GroupAgent + 'static,
    {
        self.agents.push(Arc::new(agent));
        self
    }

    pub fn shared_agent(mut self, agent: Arc<dyn GroupAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn selection<S>(mut self, strategy: S) -> Self
    where
        S: SelectionStrategy + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        self.selection = Some(BoxCloneService::new(strategy));
        self
    }

    pub fn termination<T>(mut self, strategy: T) -> Self
    where
        T: TerminationStrategy + Clone + Send + 'static,
        T::Future: Send + 'static,
    {
        self.termination = Some(BoxCloneService::new(strategy));
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn termination_window(mut self, window: usize) -> Self {
        self.termination_window = window;
        self
    }

    /// Only turns by these agents may be stopped by the termination strategy.
    pub fn allow_termination_by<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.termination_agents = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    pub fn forced_termination_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forced_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn reset_iterations_on_complete(mut self, enabled: bool) -> Self {
        self.reset_iterations_on_complete = enabled;
        self
    }

    /// Publish into an existing channel instead of a fresh one.
    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Continue an existing conversation instead of starting an empty one.
    pub fn conversation(mut self, conversation: ConversationHandle) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn build(self) -> Result<GroupChat> {
        if self.max_iterations == 0 {
            return Err(GroupChatError::Configuration(
                "max_iterations must be at least 1".into(),
            ));
        }
        if self.termination_window == 0 {
            return Err(GroupChatError::Configuration(
                "termination_window must be at least 1".into(),
            ));
        }
        let registry = AgentRegistry::new(self.agents)?;

        let mut termination = Termination::new(
            self.termination.unwrap_or_else(never_terminate),
            self.max_iterations,
            self.termination_window,
        );
        if let Some(allowed) = self.termination_agents {
            if let Some(unknown) = allowed.iter().find(|name| !registry.contains(name)) {
                return Err(GroupChatError::Configuration(format!(
                    "termination allow-list names unknown agent {}",
                    unknown
                )));
            }
            termination = termination.allow_agents(allowed);
        }

        let notifier = match self.notifier {
            Some(notifier) => notifier,
            None => EventNotifier::with_capacity(self.session_id.clone(), self.event_capacity),
        };
        let runner = AgentRunner::new(
            ForcedTerminationFilter::new(self.forced_tools),
            notifier.clone(),
        );
        let selection = self
            .selection
            .unwrap_or_else(|| BoxCloneService::new(SequentialSelectionStrategy::new()));

        Ok(GroupChat {
            session_id: self.session_id,
            registry,
            selection,
            termination,
            runner,
            conversation: self.conversation.unwrap_or_default(),
            notifier,
            phase: LoopPhase::Idle,
            reset_iterations_on_complete: self.reset_iterations_on_complete,
        })
    }
}
