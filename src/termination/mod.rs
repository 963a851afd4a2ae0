//! Termination: should the conversation stop
//!
//! What this module provides
//! - `TerminationStrategy`: a Tower seam returning a stop/continue verdict for
//!   the turn that just finished
//! - `PromptTerminationStrategy<P>`: one structured decision request per call
//! - `Termination`: the evaluation wrapper owned by a group. It counts
//!   evaluations, short-circuits once the hard cap is exceeded, applies the
//!   agent allow-list and hands the strategy only the reduced history
//!
//! Evaluation order (per call to `Termination::evaluate`)
//! 1. increment the iteration counter
//! 2. counter > max: stop with `MAX_ITERATIONS_REASON`, no strategy call
//! 3. agent outside the allow-list: continue, no strategy call
//! 4. otherwise ask the strategy with the last `window` messages
//!
//! The counter only returns to zero through `reset`.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use async_openai::types::{CreateChatCompletionRequestArgs, ResponseFormat};
use serde::{Deserialize, Serialize};
use tower::{util::BoxCloneService, Service, ServiceExt};
use tracing::{debug, debug_span, info, Instrument};

use crate::agent::AgentDescriptor;
use crate::codec::{self, CodecError};
use crate::error::{GroupChatError, Result};
use crate::items::Message;
use crate::memory::{HistoryReducer, TruncationReducer};
use crate::provider::ModelService;
use crate::selection::render_agents;

/// Rationale reported when the hard iteration cap stops the loop.
pub const MAX_ITERATIONS_REASON: &str = "max iterations reached";

/// Termination prompt used when none is supplied.
pub const DEFAULT_TERMINATION_TEMPLATE: &str = "\
You review a conversation between specialists answering a user's request.
Decide whether the user's request has been fully answered and the conversation should end.

Participants:
{{$agents}}

Most recent messages:
{{$history}}

Respond with a single JSON object of the form
{\"should_terminate\": true|false, \"termination_reason\": \"<why>\"}";

/// Input to a termination strategy.
#[derive(Debug, Clone)]
pub struct TerminationRequest {
    /// Agent whose turn just finished
    pub agent: String,
    /// Reduced history
    pub history: Vec<Message>,
    pub agents: Vec<AgentDescriptor>,
}

/// A strategy's raw stop/continue decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationVerdict {
    pub should_terminate: bool,
    pub reason: String,
}

impl TerminationVerdict {
    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            should_terminate: true,
            reason: reason.into(),
        }
    }

    pub fn proceed(reason: impl Into<String>) -> Self {
        Self {
            should_terminate: false,
            reason: reason.into(),
        }
    }
}

/// Where a termination result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// The strategy was consulted
    Strategy,
    /// The hard iteration cap short-circuited the evaluation
    MaxIterations,
    /// The agent is not allowed to end the conversation
    NotEligible,
}

/// Outcome of one termination evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationResult {
    pub should_stop: bool,
    pub reason: String,
    /// Counter value after this evaluation
    pub iteration: usize,
    pub source: VerdictSource,
}

/// Wire shape of a termination decision.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminationResponse {
    pub should_terminate: bool,
    pub termination_reason: String,
}

/// Decode a termination decision from raw model output.
pub fn parse_termination(raw: &str) -> Result<TerminationVerdict> {
    let decoded: TerminationResponse =
        codec::decode_structured(raw).map_err(|e: CodecError| GroupChatError::TerminationParse {
            message: e.to_string(),
            raw: raw.to_string(),
        })?;
    Ok(TerminationVerdict {
        should_terminate: decoded.should_terminate,
        reason: decoded.termination_reason,
    })
}

pub trait TerminationStrategy:
    Service<TerminationRequest, Response = TerminationVerdict, Error = GroupChatError>
{
}
impl<T> TerminationStrategy for T where
    T: Service<TerminationRequest, Response = TerminationVerdict, Error = GroupChatError>
{
}

pub type BoxTerminationStrategy =
    BoxCloneService<TerminationRequest, TerminationVerdict, GroupChatError>;

/// Strategy that always continues; only the iteration cap ends the loop.
pub fn never_terminate() -> BoxTerminationStrategy {
    BoxCloneService::new(tower::service_fn(|_req: TerminationRequest| async {
        Ok::<_, GroupChatError>(TerminationVerdict::proceed("no termination strategy configured"))
    }))
}

/// Asks the completion provider for a structured termination decision.
#[derive(Clone)]
pub struct PromptTerminationStrategy<P> {
    provider: P,
    model: String,
    template: String,
}

impl<P> PromptTerminationStrategy<P> {
    pub fn new(provider: P, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            template: DEFAULT_TERMINATION_TEMPLATE.to_string(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn render_prompt(&self, req: &TerminationRequest) -> String {
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("agents".to_string(), render_agents(&req.agents));
        vars.insert("history".to_string(), codec::render_transcript(&req.history));
        vars.insert("agent".to_string(), req.agent.clone());
        codec::render_template(&self.template, &vars)
    }
}

impl<P> Service<TerminationRequest> for PromptTerminationStrategy<P>
where
    P: ModelService + Clone + Send + 'static,
    P::Future: Send + 'static,
{
    type Response = TerminationVerdict;
    type Error = GroupChatError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: TerminationRequest) -> Self::Future {
        let span = debug_span!("termination", agent = %req.agent, messages = req.history.len());
        let prompt = self.render_prompt(&req);
        let model = self.model.clone();
        let mut provider = self.provider.clone();
        Box::pin(
            async move {
                let request = CreateChatCompletionRequestArgs::default()
                    .model(model)
                    .messages(vec![codec::user_message(prompt)
                        .map_err(|e| GroupChatError::Provider(e.to_string()))?])
                    .response_format(ResponseFormat::JsonObject)
                    .build()
                    .map_err(|e| GroupChatError::Provider(e.to_string()))?;
                let response = provider
                    .ready()
                    .await
                    .map_err(GroupChatError::from_boxed)?
                    .call(request)
                    .await
                    .map_err(GroupChatError::from_boxed)?;
                let raw = response.assistant.content.unwrap_or_default();
                let verdict = parse_termination(&raw)?;
                debug!(should_terminate = verdict.should_terminate, reason = %verdict.reason, "termination decoded");
                Ok(verdict)
            }
            .instrument(span),
        )
    }
}

/// Bounded termination evaluation owned by one group.
pub struct Termination {
    strategy: BoxTerminationStrategy,
    reducer: TruncationReducer,
    max_iterations: usize,
    allowed: Option<BTreeSet<String>>,
    iterations: usize,
}

impl std::fmt::Debug for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Termination")
            .field("window", &self.reducer.window)
            .field("max_iterations", &self.max_iterations)
            .field("allowed", &self.allowed)
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl Termination {
    pub fn new<S>(strategy: S, max_iterations: usize, window: usize) -> Self
    where
        S: TerminationStrategy + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self {
            strategy: BoxCloneService::new(strategy),
            reducer: TruncationReducer::new(window),
            max_iterations,
            allowed: None,
            iterations: 0,
        }
    }

    /// Only turns taken by these agents may end the conversation.
    pub fn allow_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn window(&self) -> usize {
        self.reducer.window
    }

    pub fn is_eligible(&self, agent: &str) -> bool {
        self.allowed.as_ref().map_or(true, |set| set.contains(agent))
    }

    /// Clear the iteration counter.
    pub fn reset(&mut self) {
        self.iterations = 0;
    }

    /// Evaluate the turn `agent` just took against `history`.
    pub async fn evaluate(
        &mut self,
        agent: &str,
        history: &[Message],
        agents: &[AgentDescriptor],
    ) -> Result<TerminationResult> {
        self.iterations += 1;
        let iteration = self.iterations;

        if iteration > self.max_iterations {
            info!(iteration, max = self.max_iterations, "🛑 iteration cap reached");
            return Ok(TerminationResult {
                should_stop: true,
                reason: MAX_ITERATIONS_REASON.to_string(),
                iteration,
                source: VerdictSource::MaxIterations,
            });
        }

        if !self.is_eligible(agent) {
            debug!(agent, iteration, "agent not eligible to terminate");
            return Ok(TerminationResult {
                should_stop: false,
                reason: format!("{} is not eligible to end the conversation", agent),
                iteration,
                source: VerdictSource::NotEligible,
            });
        }

        let request = TerminationRequest {
            agent: agent.to_string(),
            history: self.reducer.reduce(history).to_vec(),
            agents: agents.to_vec(),
        };
        let verdict = self
            .strategy
            .ready()
            .await?
            .call(request)
            .await?;
        Ok(TerminationResult {
            should_stop: verdict.should_terminate,
            reason: verdict.reason,
            iteration,
            source: VerdictSource::Strategy,
        })
    }
}
