//! Completion provider abstraction
//!
//! What this module provides
//! - A Tower service seam between the orchestration engine and whatever turns a
//!   prompt into text. Agent turns and selection/termination decisions all go
//!   through the same `ModelService`.
//!
//! Exports
//! - Models
//!   - `ProviderResponse { assistant, prompt_tokens, completion_tokens }`
//! - Services
//!   - `ModelService: Service<CreateChatCompletionRequest, Response=ProviderResponse, Error=BoxError>`
//!   - Implementations: `OpenAIProvider`, `FixedProvider`, `ScriptedProvider`
//! - Utils
//!   - `assistant_text`, `assistant_tool_calls` response constructors
//!
//! Testing strategy
//! - `ScriptedProvider` replays queued responses and records every request so
//!   tests can assert how many decisions actually reached the model.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionResponseMessage, ChatCompletionToolType,
        CreateChatCompletionRequest, FunctionCall, Role,
    },
    Client,
};
use tower::{util::BoxCloneService, BoxError, Service};
use tracing::{debug, trace};

/// One assistant reply plus token accounting.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub assistant: ChatCompletionResponseMessage,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl ProviderResponse {
    pub fn new(assistant: ChatCompletionResponseMessage) -> Self {
        Self {
            assistant,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: usize, completion_tokens: usize) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }

    /// Plain text reply.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(assistant_text(content))
    }

    /// Reply requesting the given `(tool_name, json_arguments)` calls.
    pub fn tool_calls<I, N, A>(calls: I) -> Self
    where
        I: IntoIterator<Item = (N, A)>,
        N: Into<String>,
        A: Into<String>,
    {
        Self::new(assistant_tool_calls(calls))
    }
}

/// Token accounting aggregated over provider calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Usage {
    pub fn record(&mut self, response: &ProviderResponse) {
        self.prompt_tokens += response.prompt_tokens;
        self.completion_tokens += response.completion_tokens;
    }

    pub fn total(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// Completion provider seam.
pub trait ModelService:
    Service<CreateChatCompletionRequest, Response = ProviderResponse, Error = BoxError>
{
}
impl<T> ModelService for T where
    T: Service<CreateChatCompletionRequest, Response = ProviderResponse, Error = BoxError>
{
}

/// Type-erased, clonable provider.
pub type BoxModelService = BoxCloneService<CreateChatCompletionRequest, ProviderResponse, BoxError>;

/// Erase a concrete provider into a [`BoxModelService`].
pub fn boxed<P>(provider: P) -> BoxModelService
where
    P: ModelService + Clone + Send + 'static,
    P::Future: Send + 'static,
{
    BoxCloneService::new(provider)
}

/// Build an assistant response carrying only text.
#[allow(deprecated)]
pub fn assistant_text(content: impl Into<String>) -> ChatCompletionResponseMessage {
    ChatCompletionResponseMessage {
        content: Some(content.into()),
        refusal: None,
        tool_calls: None,
        role: Role::Assistant,
        function_call: None,
        audio: None,
    }
}

/// Build an assistant response requesting tool calls; ids are `call_<n>`.
#[allow(deprecated)]
pub fn assistant_tool_calls<I, N, A>(calls: I) -> ChatCompletionResponseMessage
where
    I: IntoIterator<Item = (N, A)>,
    N: Into<String>,
    A: Into<String>,
{
    let tool_calls = calls
        .into_iter()
        .enumerate()
        .map(|(i, (name, arguments))| ChatCompletionMessageToolCall {
            id: format!("call_{}", i),
            r#type: ChatCompletionToolType::Function,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        })
        .collect();
    ChatCompletionResponseMessage {
        content: None,
        refusal: None,
        tool_calls: Some(tool_calls),
        role: Role::Assistant,
        function_call: None,
        audio: None,
    }
}

/// OpenAI chat-completions provider.
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Arc<Client<OpenAIConfig>>,
}

impl OpenAIProvider {
    pub fn new(client: Arc<Client<OpenAIConfig>>) -> Self {
        Self { client }
    }

    /// Provider over a default client (reads `OPENAI_API_KEY`).
    pub fn from_env() -> Self {
        Self::new(Arc::new(Client::new()))
    }
}

impl Service<CreateChatCompletionRequest> for OpenAIProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            debug!(model = %req.model, messages = req.messages.len(), "chat completion request");
            let response = client.chat().create(req).await?;
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| -> BoxError { "no choices in response".into() })?;
            let (prompt_tokens, completion_tokens) = response
                .usage
                .map(|u| (u.prompt_tokens as usize, u.completion_tokens as usize))
                .unwrap_or((0, 0));
            trace!(prompt_tokens, completion_tokens, "chat completion response");
            Ok(ProviderResponse {
                assistant: choice.message,
                prompt_tokens,
                completion_tokens,
            })
        })
    }
}

/// Provider that returns the same response for every request.
#[derive(Clone)]
pub struct FixedProvider {
    response: ProviderResponse,
}

impl FixedProvider {
    pub fn new(response: ProviderResponse) -> Self {
        Self { response }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(ProviderResponse::text(content))
    }
}

impl Service<CreateChatCompletionRequest> for FixedProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: CreateChatCompletionRequest) -> Self::Future {
        let response = self.response.clone();
        Box::pin(async move { Ok(response) })
    }
}

/// Provider replaying a queue of scripted outcomes and recording requests.
///
/// Clones share the same script and the same request log.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<VecDeque<Result<ProviderResponse, String>>>>,
    requests: Arc<Mutex<Vec<CreateChatCompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = ProviderResponse>,
    {
        let provider = Self::default();
        for r in responses {
            provider.push(r);
        }
        provider
    }

    /// Queue a successful response.
    pub fn push(&self, response: ProviderResponse) {
        self.lock_script().push_back(Ok(response));
    }

    /// Queue a text response.
    pub fn push_text(&self, content: impl Into<String>) {
        self.push(ProviderResponse::text(content));
    }

    /// Queue a failure.
    pub fn push_error(&self, message: impl Into<String>) {
        self.lock_script().push_back(Err(message.into()));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<CreateChatCompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.lock_script().len()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ProviderResponse, String>>> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Service<CreateChatCompletionRequest> for ScriptedProvider {
    type Response = ProviderResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreateChatCompletionRequest) -> Self::Future {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(req);
        let next = self.lock_script().pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(message.into()),
                None => Err("scripted provider exhausted".into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::types::CreateChatCompletionRequestArgs;
    use tower::ServiceExt;

    fn req() -> CreateChatCompletionRequest {
        CreateChatCompletionRequestArgs::default()
            .model("gpt-4o")
            .messages(vec![])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn scripted_provider_replays_in_order_and_records() {
        let mut p = ScriptedProvider::new(vec![ProviderResponse::text("a")]);
        p.push_error("boom");
        let first = p.ready().await.unwrap().call(req()).await.unwrap();
        assert_eq!(first.assistant.content.as_deref(), Some("a"));
        let second = p.ready().await.unwrap().call(req()).await.unwrap_err();
        assert_eq!(second.to_string(), "boom");
        let third = p.ready().await.unwrap().call(req()).await.unwrap_err();
        assert!(third.to_string().contains("exhausted"));
        assert_eq!(p.call_count(), 3);
        assert_eq!(p.remaining(), 0);
    }

    #[tokio::test]
    async fn clones_share_script() {
        let p = ScriptedProvider::new(vec![ProviderResponse::text("x")]);
        let mut clone = p.clone();
        let _ = clone.ready().await.unwrap().call(req()).await.unwrap();
        assert_eq!(p.call_count(), 1);
        assert_eq!(p.remaining(), 0);
    }

    #[tokio::test]
    async fn fixed_provider_repeats() {
        let mut p = boxed(FixedProvider::text("same"));
        for _ in 0..3 {
            let r = p.ready().await.unwrap().call(req()).await.unwrap();
            assert_eq!(r.assistant.content.as_deref(), Some("same"));
        }
    }

    #[test]
    fn usage_accumulates() {
        let mut usage = Usage::default();
        usage.record(&ProviderResponse::text("a").with_usage(10, 2));
        usage += Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
        };
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.total(), 14);
    }

    #[test]
    fn tool_call_constructor_numbers_ids() {
        let m = assistant_tool_calls(vec![("execute_query", "{}"), ("write_chart", "{}")]);
        let calls = m.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[1].function.name, "write_chart");
    }
}
