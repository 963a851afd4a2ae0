//! Selection strategies: who speaks next
//!
//! What this module provides
//! - A Tower seam deciding the next agent from the conversation and the
//!   candidate agents
//!
//! Exports
//! - Models
//!   - `SelectionRequest { history, agents }`
//!   - `SelectionResult { next_agent, reason }`
//! - Services
//!   - `SelectionStrategy: Service<SelectionRequest, Response=SelectionResult, Error=GroupChatError>`
//!   - `PromptSelectionStrategy<P: ModelService>`: one structured decision request per call
//!   - `SequentialSelectionStrategy`: round-robin over registration order
//!
//! Implementation strategy
//! - Strategies decode, they do not validate: registry membership is checked
//!   by the orchestration loop right after it publishes the selection event,
//!   so subscribers see every decision, including ones naming unknown agents
//! - Malformed model output is a `SelectionParse` error and is never retried
//!
//! Testing strategy
//! - Scripted provider replies; assert prompt contents and decoded results

use std::future::Future;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_openai::types::{CreateChatCompletionRequestArgs, ResponseFormat};
use serde::{Deserialize, Serialize};
use tower::{util::BoxCloneService, Service, ServiceExt};
use tracing::{debug, debug_span, Instrument};

use crate::agent::AgentDescriptor;
use crate::codec::{self, CodecError};
use crate::error::GroupChatError;
use crate::items::Message;
use crate::memory;
use crate::provider::ModelService;

/// Selection prompt used when none is supplied.
pub const DEFAULT_SELECTION_TEMPLATE: &str = "\
You coordinate a group of specialists answering a user's request together.
Pick the participant that should take the next turn, based on the conversation so far.

Participants:
{{$agents}}

Conversation:
{{$history}}

Only choose from the participants listed above. Never choose the user.
Respond with a single JSON object of the form
{\"next_agent\": \"<participant name>\", \"selection_reason\": \"<why>\"}";

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    /// Conversation the decision is based on
    pub history: Vec<Message>,
    /// Candidates, in registration order
    pub agents: Vec<AgentDescriptor>,
}

impl SelectionRequest {
    pub fn new(history: Vec<Message>, agents: Vec<AgentDescriptor>) -> Self {
        Self { history, agents }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub next_agent: String,
    pub reason: String,
}

impl SelectionResult {
    pub fn new(next_agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            next_agent: next_agent.into(),
            reason: reason.into(),
        }
    }
}

/// Wire shape of a selection decision.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionResponse {
    pub next_agent: String,
    pub selection_reason: String,
}

/// Decode a selection decision from raw model output.
pub fn parse_selection(raw: &str) -> Result<SelectionResult, GroupChatError> {
    let parse_err = |e: CodecError| GroupChatError::SelectionParse {
        message: e.to_string(),
        raw: raw.to_string(),
    };
    let decoded: SelectionResponse = codec::decode_structured(raw).map_err(parse_err)?;
    let next_agent = decoded.next_agent.trim();
    if next_agent.is_empty() {
        return Err(GroupChatError::SelectionParse {
            message: "next_agent is empty".into(),
            raw: raw.to_string(),
        });
    }
    Ok(SelectionResult::new(next_agent, decoded.selection_reason))
}

pub trait SelectionStrategy:
    Service<SelectionRequest, Response = SelectionResult, Error = GroupChatError>
{
}
impl<T> SelectionStrategy for T where
    T: Service<SelectionRequest, Response = SelectionResult, Error = GroupChatError>
{
}

pub type BoxSelectionStrategy = BoxCloneService<SelectionRequest, SelectionResult, GroupChatError>;

/// `- name: description` lines for the `{{$agents}}` placeholder.
pub fn render_agents(agents: &[AgentDescriptor]) -> String {
    agents
        .iter()
        .map(|a| {
            if a.description.is_empty() {
                format!("- {}", a.name)
            } else {
                format!("- {}: {}", a.name, a.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Asks the completion provider for a structured selection decision.
#[derive(Clone)]
pub struct PromptSelectionStrategy<P> {
    provider: P,
    model: String,
    template: String,
    window: Option<usize>,
}

impl<P> PromptSelectionStrategy<P> {
    pub fn new(provider: P, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            template: DEFAULT_SELECTION_TEMPLATE.to_string(),
            window: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Bound the history the decision sees; the full history is used by default.
    pub fn with_window(mut self, window: Option<usize>) -> Self {
        self.window = window;
        self
    }

    pub fn render_prompt(&self, req: &SelectionRequest) -> String {
        let history = match self.window {
            Some(w) => memory::reduce(&req.history, w),
            None => &req.history[..],
        };
        let mut vars = std::collections::BTreeMap::new();
        vars.insert("agents".to_string(), render_agents(&req.agents));
        vars.insert("history".to_string(), codec::render_transcript(history));
        codec::render_template(&self.template, &vars)
    }
}

impl<P> Service<SelectionRequest> for PromptSelectionStrategy<P>
where
    P: ModelService + Clone + Send + 'static,
    P::Future: Send + 'static,
{
    type Response = SelectionResult;
    type Error = GroupChatError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SelectionRequest) -> Self::Future {
        let span = debug_span!(
            "selection",
            candidates = req.agents.len(),
            messages = req.history.len()
        );
        let prompt = self.render_prompt(&req);
        let model = self.model.clone();
        let mut provider = self.provider.clone();
        Box::pin(async move {
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
            let result = parse_selection(&raw)?;
            debug!(next_agent = %result.next_agent, reason = %result.reason, "selection decoded");
            Ok(result)
        }
        .instrument(span))
    }
}

/// Round-robin over the candidates in registration order.
///
/// Clones share the cursor.
#[derive(Clone, Default)]
pub struct SequentialSelectionStrategy {
    cursor: Arc<AtomicUsize>,
}

impl SequentialSelectionStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start over from the first agent.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::SeqCst);
    }
}

impl Service<SelectionRequest> for SequentialSelectionStrategy {
    type Response = SelectionResult;
    type Error = GroupChatError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SelectionRequest) -> Self::Future {
        let result = if req.agents.is_empty() {
            Err(GroupChatError::Configuration(
                "no agents to select from".into(),
            ))
        } else {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % req.agents.len();
            Ok(SelectionResult::new(
                req.agents[idx].name.clone(),
                format!("turn {} in sequence", idx + 1),
            ))
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderResponse, ScriptedProvider};
    use async_openai::types::{ChatCompletionRequestMessage, ChatCompletionRequestUserMessageContent};

    fn agents() -> Vec<AgentDescriptor> {
        vec![
            AgentDescriptor::new("QueryBuilder", "Builds and runs data queries"),
            AgentDescriptor::new("Formatter", "Formats the final answer"),
        ]
    }

    fn prompt_of(provider: &ScriptedProvider) -> String {
        match &provider.requests()[0].messages[0] {
            ChatCompletionRequestMessage::User(u) => match &u.content {
                ChatCompletionRequestUserMessageContent::Text(t) => t.clone(),
                _ => String::new(),
            },
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn parse_accepts_valid_and_rejects_malformed() {
        let ok = parse_selection(r#"{"next_agent":"Formatter","selection_reason":"data ready"}"#)
            .unwrap();
        assert_eq!(ok, SelectionResult::new("Formatter", "data ready"));

        for raw in [
            "Formatter",
            r#"{"agent":"Formatter"}"#,
            r#"{"next_agent":"  ","selection_reason":"x"}"#,
            r#"{"next_agent":"Formatter"}"#,
            "",
        ] {
            assert!(
                matches!(parse_selection(raw), Err(GroupChatError::SelectionParse { .. })),
                "accepted {:?}",
                raw
            );
        }
    }

    #[tokio::test]
    async fn prompt_strategy_renders_agents_and_history() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::text(
            r#"{"next_agent":"QueryBuilder","selection_reason":"needs data"}"#,
        )]);
        let mut strategy = PromptSelectionStrategy::new(provider.clone(), "gpt-4o-mini");
        let req = SelectionRequest::new(vec![Message::user("delays for AA123")], agents());
        let result = strategy.ready().await.unwrap().call(req).await.unwrap();
        assert_eq!(result.next_agent, "QueryBuilder");

        let prompt = prompt_of(&provider);
        assert!(prompt.contains("- QueryBuilder: Builds and runs data queries"));
        assert!(prompt.contains("USER [user]: delays for AA123"));
        assert_eq!(provider.requests()[0].model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn strategy_does_not_validate_membership() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::text(
            r#"{"next_agent":"Nonexistent","selection_reason":"?"}"#,
        )]);
        let mut strategy = PromptSelectionStrategy::new(provider, "m");
        let result = strategy
            .ready()
            .await
            .unwrap()
            .call(SelectionRequest::new(vec![], agents()))
            .await
            .unwrap();
        assert_eq!(result.next_agent, "Nonexistent");
    }

    #[tokio::test]
    async fn window_bounds_rendered_history() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::text(
            r#"{"next_agent":"Formatter","selection_reason":"format"}"#,
        )]);
        let mut strategy = PromptSelectionStrategy::new(provider.clone(), "m").with_window(Some(1));
        let history = vec![Message::user("first"), Message::assistant("QueryBuilder", "second")];
        strategy
            .ready()
            .await
            .unwrap()
            .call(SelectionRequest::new(history, agents()))
            .await
            .unwrap();
        let prompt = prompt_of(&provider);
        assert!(!prompt.contains("first"));
        assert!(prompt.contains("ASSISTANT [QueryBuilder]: second"));
    }

    #[tokio::test]
    async fn provider_failure_is_provider_error() {
        let provider = ScriptedProvider::default();
        provider.push_error("connection reset");
        let mut strategy = PromptSelectionStrategy::new(provider, "m");
        let err = strategy
            .ready()
            .await
            .unwrap()
            .call(SelectionRequest::new(vec![], agents()))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupChatError::Provider(_)));
    }

    #[tokio::test]
    async fn sequential_cycles_through_agents() {
        let mut strategy = SequentialSelectionStrategy::new();
        let mut picked = Vec::new();
        for _ in 0..3 {
            let r = strategy
                .ready()
                .await
                .unwrap()
                .call(SelectionRequest::new(vec![], agents()))
                .await
                .unwrap();
            picked.push(r.next_agent);
        }
        assert_eq!(picked, vec!["QueryBuilder", "Formatter", "QueryBuilder"]);
        strategy.reset();
        let r = strategy
            .ready()
            .await
            .unwrap()
            .call(SelectionRequest::new(vec![], agents()))
            .await
            .unwrap();
        assert_eq!(r.next_agent, "QueryBuilder");
    }
}
