//! # Agents (orientation)
//!
//! A group agent is a named participant that produces exactly one message per
//! turn from the shared conversation and its session-scoped bound arguments.
//! Agent configurations differ only at construction time; the orchestration
//! loop sees the single [`GroupAgent`] capability.
//!
//! [`ChatAgent`] is the stock implementation: an instructions template, tool
//! bindings, and an auto-invoking tool loop over a completion provider.
//! [`AgentRegistry`] is the fixed, ordered set of agents of one session.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionTool, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tower::{Service, ServiceExt};
use tracing::{debug, instrument};

use crate::codec;
use crate::config::GroupChatConfig;
use crate::error::{GroupChatError, Result};
use crate::filters::ForcedTerminationFilter;
use crate::items::Message;
use crate::provider::{BoxModelService, ProviderResponse, Usage};
use crate::tool::{ToolDef, ToolInvocation, ToolOutput, ToolRouter};

/// Default model for agent turns when none is configured.
pub const DEFAULT_AGENT_MODEL: &str = "gpt-4o";

/// Default cap on provider round-trips inside a single turn.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Everything an agent may look at while taking its turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    /// Snapshot of the shared conversation at the start of the turn
    pub history: Vec<Message>,
    /// Tools that end the run as soon as they return
    pub filter: ForcedTerminationFilter,
    /// 1-based turn number within the current run
    pub turn: usize,
}

impl TurnContext {
    pub fn new(history: Vec<Message>) -> Self {
        Self {
            history,
            filter: ForcedTerminationFilter::disabled(),
            turn: 1,
        }
    }

    pub fn with_filter(mut self, filter: ForcedTerminationFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_turn(mut self, turn: usize) -> Self {
        self.turn = turn;
        self
    }
}

/// What one agent turn produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    pub content: String,
    /// Names of the tools invoked during the turn, in call order
    pub invoked_tools: Vec<String>,
    /// Set when the turn ended early because a forced-termination tool ran
    pub forced_by: Option<String>,
    pub usage: Usage,
}

impl TurnOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// The capability every participant exposes to the loop.
#[async_trait]
pub trait GroupAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Short capability summary shown to the selection strategy.
    fn description(&self) -> &str {
        ""
    }

    async fn respond(&self, ctx: TurnContext) -> Result<TurnOutput>;
}

/// Session-scoped values bound into an agent's instructions template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentArguments(BTreeMap<String, String>);

impl AgentArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// LLM-backed agent with an auto-invoking tool loop.
pub struct ChatAgent {
    name: String,
    description: String,
    instructions: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    arguments: AgentArguments,
    router: Arc<Mutex<ToolRouter>>,
    tool_specs: Vec<ChatCompletionTool>,
    parallel_tools: bool,
    max_tool_rounds: usize,
    provider: Arc<Mutex<BoxModelService>>,
}

impl std::fmt::Debug for ChatAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatAgent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tool_specs.len())
            .finish()
    }
}

impl ChatAgent {
    pub fn builder(name: impl Into<String>) -> ChatAgentBuilder {
        ChatAgentBuilder::new(name)
    }

    pub fn arguments(&self) -> &AgentArguments {
        &self.arguments
    }

    /// Instructions with the bound arguments substituted.
    pub fn rendered_instructions(&self) -> String {
        codec::render_template(&self.instructions, self.arguments.as_map())
    }

    fn build_request(
        &self,
        messages: Vec<async_openai::types::ChatCompletionRequestMessage>,
    ) -> Result<CreateChatCompletionRequest> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);
        if let Some(t) = self.temperature {
            builder.temperature(t);
        }
        if let Some(mt) = self.max_tokens {
            builder.max_completion_tokens(mt);
        }
        if !self.tool_specs.is_empty() {
            builder.tools(self.tool_specs.clone());
            builder.parallel_tool_calls(self.parallel_tools);
        }
        builder
            .build()
            .map_err(|e| GroupChatError::agent(&self.name, format!("request build error: {}", e)))
    }

    async fn call_provider(&self, req: CreateChatCompletionRequest) -> Result<ProviderResponse> {
        let mut svc = self.provider.lock().await.clone();
        svc.ready()
            .await
            .map_err(|e| GroupChatError::agent(&self.name, e))?
            .call(req)
            .await
            .map_err(|e| GroupChatError::agent(&self.name, e))
    }

    async fn run_tools(
        &self,
        calls: Vec<ChatCompletionMessageToolCall>,
        filter: &ForcedTerminationFilter,
    ) -> Result<Vec<ToolOutcome>> {
        let invocations = calls
            .into_iter()
            .map(|tc| {
                let raw = tc.function.arguments.trim();
                let arguments = if raw.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(raw).map_err(|e| {
                        GroupChatError::agent(
                            &self.name,
                            format!("tool {} arguments are not valid JSON: {}", tc.function.name, e),
                        )
                    })?
                };
                Ok::<_, GroupChatError>(ToolInvocation {
                    id: tc.id,
                    arguments,
                    name: tc.function.name,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let router = self.router.lock().await.clone();

        if invocations.len() > 1 && self.parallel_tools {
            // Fire in parallel, preserve order. The whole batch runs even when
            // it contains a forced-termination tool.
            let futures: Vec<_> = invocations
                .into_iter()
                .map(|inv| {
                    let mut router = router.clone();
                    async move {
                        let name = inv.name.clone();
                        let output = router.ready().await?.call(inv).await?;
                        Ok::<_, tower::BoxError>(ToolOutcome { name, output })
                    }
                })
                .collect();
            return futures::future::try_join_all(futures)
                .await
                .map_err(|e| GroupChatError::agent(&self.name, e));
        }

        let mut outcomes = Vec::with_capacity(invocations.len());
        for inv in invocations {
            let name = inv.name.clone();
            let mut router = router.clone();
            let output = router
                .ready()
                .await
                .map_err(|e| GroupChatError::agent(&self.name, e))?
                .call(inv)
                .await
                .map_err(|e| GroupChatError::agent(&self.name, format!("tool {}: {}", name, e)))?;
            let forced = filter.matches(&name);
            outcomes.push(ToolOutcome { name, output });
            if forced {
                // Nothing after a forced-termination tool may run.
                break;
            }
        }
        Ok(outcomes)
    }
}

struct ToolOutcome {
    name: String,
    output: ToolOutput,
}

#[async_trait]
impl GroupAgent for ChatAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    #[instrument(skip_all, fields(agent = %self.name, turn = ctx.turn))]
    async fn respond(&self, ctx: TurnContext) -> Result<TurnOutput> {
        let map_codec = |e: codec::CodecError| GroupChatError::agent(&self.name, e);

        let mut messages = Vec::with_capacity(ctx.history.len() + 1);
        messages.push(codec::system_message(self.rendered_instructions()).map_err(map_codec)?);
        messages.extend(codec::to_request_messages(&ctx.history).map_err(map_codec)?);

        let mut invoked_tools: Vec<String> = Vec::new();
        let mut usage = Usage::default();

        for round in 0..self.max_tool_rounds {
            let req = self.build_request(messages.clone())?;
            let response = self.call_provider(req).await?;
            usage.record(&response);

            let tool_calls = response.assistant.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() {
                debug!(round, tools = invoked_tools.len(), "agent produced final answer");
                return Ok(TurnOutput {
                    content: response.assistant.content.unwrap_or_default(),
                    invoked_tools,
                    forced_by: None,
                    usage,
                });
            }

            messages.push(codec::assistant_request(&response.assistant).map_err(map_codec)?);
            let outcomes = self.run_tools(tool_calls, &ctx.filter).await?;
            invoked_tools.extend(outcomes.iter().map(|o| o.name.clone()));

            if let Some(forced) = outcomes.iter().find(|o| ctx.filter.matches(&o.name)) {
                // The fetched data becomes the turn's message.
                debug!(round, tool = %forced.name, "forced-termination tool returned");
                return Ok(TurnOutput {
                    content: forced.output.as_text(),
                    invoked_tools,
                    forced_by: Some(forced.name.clone()),
                    usage,
                });
            }
            for ToolOutcome { name, output } in outcomes {
                debug!(round, tool = %name, "tool returned");
                messages.push(codec::tool_result(output.id.clone(), output.as_text()).map_err(map_codec)?);
            }
        }

        Err(GroupChatError::agent(
            &self.name,
            format!("exceeded {} tool rounds without a final answer", self.max_tool_rounds),
        ))
    }
}

/// Builder for [`ChatAgent`].
pub struct ChatAgentBuilder {
    name: String,
    description: String,
    instructions: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    arguments: AgentArguments,
    tools: Vec<ToolDef>,
    parallel_tools: bool,
    max_tool_rounds: usize,
}

impl ChatAgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            model: DEFAULT_AGENT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            arguments: AgentArguments::new(),
            tools: Vec::new(),
            parallel_tools: false,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    /// Take the model and tool-round bound from `config`.
    pub fn config(mut self, config: &GroupChatConfig) -> Self {
        self.model = config.agent_model.clone();
        self.max_tool_rounds = config.max_tool_rounds;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Instructions template; `{{$key}}` is replaced by the bound argument `key`.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn max_tokens(mut self, mt: u32) -> Self {
        self.max_tokens = Some(mt);
        self
    }

    pub fn argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key, value);
        self
    }

    pub fn arguments(mut self, arguments: AgentArguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn tool(mut self, tool: ToolDef) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolDef>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn parallel_tools(mut self, enabled: bool) -> Self {
        self.parallel_tools = enabled;
        self
    }

    pub fn max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn build(self, provider: BoxModelService) -> Result<ChatAgent> {
        if self.name.trim().is_empty() {
            return Err(GroupChatError::Configuration(
                "agent name must not be empty".into(),
            ));
        }
        if self.max_tool_rounds == 0 {
            return Err(GroupChatError::Configuration(format!(
                "agent {}: max_tool_rounds must be at least 1",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(GroupChatError::Configuration(format!(
                    "agent {}: duplicate tool {}",
                    self.name, tool.name
                )));
            }
        }
        let (router, tool_specs) = ToolRouter::new(self.tools);
        Ok(ChatAgent {
            name: self.name,
            description: self.description,
            instructions: self.instructions,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            arguments: self.arguments,
            router: Arc::new(Mutex::new(router)),
            tool_specs,
            parallel_tools: self.parallel_tools,
            max_tool_rounds: self.max_tool_rounds,
            provider: Arc::new(Mutex::new(provider)),
        })
    }
}

/// What decision strategies know about a candidate agent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub description: String,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// The fixed, ordered set of agents participating in one session.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn GroupAgent>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl AgentRegistry {
    /// Registry over `agents`; names must be unique and the set non-empty.
    pub fn new(agents: Vec<Arc<dyn GroupAgent>>) -> Result<Self> {
        if agents.is_empty() {
            return Err(GroupChatError::Configuration(
                "a group needs at least one agent".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &agents {
            if !seen.insert(agent.name().to_string()) {
                return Err(GroupChatError::Configuration(format!(
                    "duplicate agent name: {}",
                    agent.name()
                )));
            }
        }
        Ok(Self { agents })
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GroupAgent>> {
        self.agents.iter().find(|a| a.name() == name).cloned()
    }

    /// Look up `name`, failing with `UnknownAgent` when it is not registered.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn GroupAgent>> {
        self.get(name).ok_or_else(|| GroupChatError::UnknownAgent {
            name: name.to_string(),
            registered: self.names(),
        })
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn at(&self, index: usize) -> Option<Arc<dyn GroupAgent>> {
        self.agents.get(index).cloned()
    }

    /// Name and description of every agent, in registration order.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.agents
            .iter()
            .map(|a| AgentDescriptor {
                name: a.name().to_string(),
                description: a.description().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{boxed, ProviderResponse, ScriptedProvider};
    use crate::tool::tool_typed;
    use async_openai::types::ChatCompletionRequestMessage;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize, JsonSchema)]
    struct QueryArgs {
        query: String,
    }

    fn execute_query(calls: Arc<AtomicUsize>) -> ToolDef {
        tool_typed("execute_query", "Run a query", move |args: QueryArgs| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, tower::BoxError>(format!("rows for {}", args.query))
            }
        })
    }

    fn lookup_tool() -> ToolDef {
        tool_typed("lookup", "Look something up", |args: QueryArgs| async move {
            Ok::<_, tower::BoxError>(serde_json::json!({ "found": args.query }))
        })
    }

    fn system_text(req: &CreateChatCompletionRequest) -> String {
        match &req.messages[0] {
            ChatCompletionRequestMessage::System(s) => match &s.content {
                async_openai::types::ChatCompletionRequestSystemMessageContent::Text(t) => {
                    t.clone()
                }
                _ => String::new(),
            },
            other => panic!("expected system message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn plain_answer_without_tools() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::text("hello").with_usage(5, 1)]);
        let agent = ChatAgent::builder("Formatter")
            .instructions("Format things")
            .build(boxed(provider.clone()))
            .unwrap();
        let out = agent
            .respond(TurnContext::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(out.content, "hello");
        assert!(out.invoked_tools.is_empty());
        assert_eq!(out.usage.prompt_tokens, 5);
        // system + one history message
        assert_eq!(provider.requests()[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn bound_arguments_render_into_instructions() {
        let provider = ScriptedProvider::new(vec![ProviderResponse::text("ok")]);
        let agent = ChatAgent::builder("QueryBuilder")
            .instructions("Use this schema: {{$schema}}")
            .argument("schema", "<Schema Namespace=\"Flights\"/>")
            .build(boxed(provider.clone()))
            .unwrap();
        agent.respond(TurnContext::new(vec![])).await.unwrap();
        assert_eq!(
            system_text(&provider.requests()[0]),
            "Use this schema: <Schema Namespace=\"Flights\"/>"
        );
    }

    #[tokio::test]
    async fn tool_round_then_final_answer() {
        let provider = ScriptedProvider::new(vec![
            ProviderResponse::tool_calls(vec![("lookup", r#"{"query":"AA123"}"#)]),
            ProviderResponse::text("found it"),
        ]);
        let agent = ChatAgent::builder("Helper")
            .tool(lookup_tool())
            .build(boxed(provider.clone()))
            .unwrap();
        let out = agent.respond(TurnContext::new(vec![])).await.unwrap();
        assert_eq!(out.content, "found it");
        assert_eq!(out.invoked_tools, vec!["lookup"]);
        assert_eq!(out.forced_by, None);
        // second request carries the assistant tool call and the tool result
        let second = &provider.requests()[1];
        assert!(matches!(
            second.messages.last(),
            Some(ChatCompletionRequestMessage::Tool(_))
        ));
    }

    #[tokio::test]
    async fn forced_tool_ends_turn_with_tool_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![ProviderResponse::tool_calls(vec![
            ("execute_query", r#"{"query":"Flights?$filter=Id eq 'AA123'"}"#),
            ("lookup", r#"{"query":"never"}"#),
        ])]);
        let agent = ChatAgent::builder("QueryBuilder")
            .tool(execute_query(calls.clone()))
            .tool(lookup_tool())
            .build(boxed(provider.clone()))
            .unwrap();
        let ctx = TurnContext::new(vec![Message::user("delays for AA123")])
            .with_filter(ForcedTerminationFilter::new(["execute_query"]));
        let out = agent.respond(ctx).await.unwrap();
        assert_eq!(out.forced_by.as_deref(), Some("execute_query"));
        assert_eq!(out.invoked_tools, vec!["execute_query"]);
        assert_eq!(out.content, "rows for Flights?$filter=Id eq 'AA123'");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn parallel_batch_reports_every_tool_it_ran() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![ProviderResponse::tool_calls(vec![
            ("execute_query", r#"{"query":"AA123"}"#),
            ("lookup", r#"{"query":"gate"}"#),
        ])]);
        let agent = ChatAgent::builder("QueryBuilder")
            .tool(execute_query(calls.clone()))
            .tool(lookup_tool())
            .parallel_tools(true)
            .build(boxed(provider.clone()))
            .unwrap();
        let ctx = TurnContext::new(vec![Message::user("delays for AA123")])
            .with_filter(ForcedTerminationFilter::new(["execute_query"]));
        let out = agent.respond(ctx).await.unwrap();
        assert_eq!(out.forced_by.as_deref(), Some("execute_query"));
        assert_eq!(out.invoked_tools, vec!["execute_query", "lookup"]);
        assert_eq!(out.content, "rows for AA123");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn malformed_tool_arguments_fail_the_turn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::new(vec![ProviderResponse::tool_calls(vec![(
            "execute_query",
            "{not json",
        )])]);
        let agent = ChatAgent::builder("QueryBuilder")
            .tool(execute_query(calls.clone()))
            .build(boxed(provider.clone()))
            .unwrap();
        let err = agent
            .respond(TurnContext::new(vec![Message::user("delays?")]))
            .await
            .unwrap_err();
        match err {
            GroupChatError::AgentExecution { agent, message } => {
                assert_eq!(agent, "QueryBuilder");
                assert!(message.contains("execute_query arguments"), "{}", message);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn tool_round_limit_is_an_execution_error() {
        let provider = FixedToolLoop::provider();
        let agent = ChatAgent::builder("Looper")
            .tool(lookup_tool())
            .max_tool_rounds(2)
            .build(provider)
            .unwrap();
        let err = agent.respond(TurnContext::new(vec![])).await.unwrap_err();
        assert!(matches!(err, GroupChatError::AgentExecution { ref agent, .. } if agent == "Looper"));
    }

    struct FixedToolLoop;
    impl FixedToolLoop {
        fn provider() -> BoxModelService {
            boxed(crate::provider::FixedProvider::new(ProviderResponse::tool_calls(
                vec![("lookup", r#"{"query":"again"}"#)],
            )))
        }
    }

    #[tokio::test]
    async fn provider_failure_is_agent_execution_error() {
        let provider = ScriptedProvider::default();
        provider.push_error("503 service unavailable");
        let agent = ChatAgent::builder("QueryBuilder")
            .build(boxed(provider))
            .unwrap();
        let err = agent.respond(TurnContext::new(vec![])).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn registry_rejects_duplicates_and_resolves_names() {
        let provider = boxed(ScriptedProvider::default());
        let a: Arc<dyn GroupAgent> =
            Arc::new(ChatAgent::builder("A").build(provider.clone()).unwrap());
        let b: Arc<dyn GroupAgent> =
            Arc::new(ChatAgent::builder("B").build(provider.clone()).unwrap());
        let dup: Arc<dyn GroupAgent> = Arc::new(ChatAgent::builder("A").build(provider).unwrap());

        assert!(AgentRegistry::new(vec![]).is_err());
        assert!(AgentRegistry::new(vec![a.clone(), dup]).is_err());

        let registry = AgentRegistry::new(vec![a, b]).unwrap();
        assert_eq!(registry.names(), vec!["A", "B"]);
        assert_eq!(registry.position("B"), Some(1));
        assert!(registry.resolve("A").is_ok());
        match registry.resolve("Nonexistent") {
            Err(GroupChatError::UnknownAgent { name, registered }) => {
                assert_eq!(name, "Nonexistent");
                assert_eq!(registered, vec!["A", "B"]);
            }
            _ => panic!("expected UnknownAgent"),
        }
    }

    #[test]
    fn builder_rejects_empty_name() {
        let provider = boxed(ScriptedProvider::default());
        assert!(matches!(
            ChatAgent::builder("  ").build(provider),
            Err(GroupChatError::Configuration(_))
        ));
    }
}
