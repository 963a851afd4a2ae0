//! Configuration for group chat sessions
//!
//! Defaults reproduce the reference deployment: five termination evaluations,
//! a two-message termination window, unbounded selection history, and a forced
//! stop after the query-execution tool runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GroupChatError, Result};

/// Tool whose invocation ends the loop in the reference deployment.
pub const DEFAULT_FORCED_TOOL: &str = "execute_query";

/// What to do when a request arrives for a session whose loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Fail fast with `ConcurrencyViolation`
    #[default]
    Reject,
    /// Wait until the active loop finishes
    Queue,
}

/// Top-level configuration of one group chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupChatConfig {
    /// Hard cap on termination evaluations per session
    pub max_iterations: usize,

    /// Messages the termination strategy sees
    pub termination_window: usize,

    /// Messages the selection strategy sees (`None` = full history)
    pub selection_window: Option<usize>,

    /// Tool names that force the loop to stop after the turn that invoked them
    pub forced_termination_tools: Vec<String>,

    /// Reset the iteration counter every time a loop run completes
    pub reset_iterations_on_complete: bool,

    /// Capacity of the per-session event channel
    pub event_capacity: usize,

    /// Behaviour when a session already has an active loop
    pub busy_policy: BusyPolicy,

    /// Default model for agent turns
    pub agent_model: String,

    /// Model used for selection and termination decisions
    pub decision_model: String,

    /// Upper bound on provider round-trips inside one agent turn
    pub max_tool_rounds: usize,

    /// Per-call provider timeout in milliseconds
    pub provider_timeout_ms: u64,

    /// Retry configuration for transient provider failures
    pub retry: RetryConfig,
}

impl Default for GroupChatConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            termination_window: 2,
            selection_window: None,
            forced_termination_tools: vec![DEFAULT_FORCED_TOOL.to_string()],
            reset_iterations_on_complete: false,
            event_capacity: 256,
            busy_policy: BusyPolicy::Reject,
            agent_model: "gpt-4o".to_string(),
            decision_model: "gpt-4o-mini".to_string(),
            max_tool_rounds: 8,
            provider_timeout_ms: 60_000,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 disables retrying)
    pub max_retries: usize,

    /// Initial retry delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl GroupChatConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn termination_window(mut self, window: usize) -> Self {
        self.termination_window = window;
        self
    }

    pub fn selection_window(mut self, window: usize) -> Self {
        self.selection_window = Some(window);
        self
    }

    pub fn forced_termination_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forced_termination_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn reset_iterations_on_complete(mut self, enabled: bool) -> Self {
        self.reset_iterations_on_complete = enabled;
        self
    }

    pub fn busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn agent_model(mut self, model: impl Into<String>) -> Self {
        self.agent_model = model.into();
        self
    }

    pub fn decision_model(mut self, model: impl Into<String>) -> Self {
        self.decision_model = model.into();
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Reject settings that would make the loop unbounded or blind.
    pub fn validate(&self) -> Result<()> {
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
        if self.selection_window == Some(0) {
            return Err(GroupChatError::Configuration(
                "selection_window must be at least 1 when set".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(GroupChatError::Configuration(
                "event_capacity must be at least 1".into(),
            ));
        }
        if self.max_tool_rounds == 0 {
            return Err(GroupChatError::Configuration(
                "max_tool_rounds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from environment variables over the defaults
pub fn from_env() -> GroupChatConfig {
    from_lookup(|key| std::env::var(key).ok())
}

/// Same as [`from_env`] with an injectable variable source.
pub fn from_lookup<F>(lookup: F) -> GroupChatConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = GroupChatConfig::default();

    if let Some(max) = lookup("GROUPCHAT_MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
        config.max_iterations = max;
    }

    if let Some(window) = lookup("GROUPCHAT_TERMINATION_WINDOW").and_then(|v| v.parse().ok()) {
        config.termination_window = window;
    }

    if let Some(window) = lookup("GROUPCHAT_SELECTION_WINDOW").and_then(|v| v.parse().ok()) {
        config.selection_window = Some(window);
    }

    if let Some(tools) = lookup("GROUPCHAT_FORCED_TOOLS") {
        config.forced_termination_tools = tools
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
    }

    if let Some(policy) = lookup("GROUPCHAT_BUSY_POLICY") {
        match policy.to_lowercase().as_str() {
            "queue" => config.busy_policy = BusyPolicy::Queue,
            "reject" => config.busy_policy = BusyPolicy::Reject,
            other => tracing::warn!(value = other, "ignoring unknown GROUPCHAT_BUSY_POLICY"),
        }
    }

    if let Some(model) = lookup("OPENAI_MODEL") {
        config.agent_model = model;
    }

    if let Some(model) = lookup("GROUPCHAT_DECISION_MODEL") {
        config.decision_model = model;
    }

    if let Some(retries) = lookup("GROUPCHAT_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        config.retry.max_retries = retries;
    }

    config
}

/// Parse configuration from a JSON document; missing fields take defaults.
pub fn from_json_str(json: &str) -> Result<GroupChatConfig> {
    let config: GroupChatConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<GroupChatConfig> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        GroupChatError::Configuration(format!("{}: {}", path.as_ref().display(), e))
    })?;
    let config: GroupChatConfig =
        toml::from_str(&contents).map_err(|e| GroupChatError::Configuration(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
