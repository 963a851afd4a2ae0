//! Error types for group chat orchestration

use thiserror::Error;
use tower::BoxError;

/// Result type alias for the group chat engine
pub type Result<T> = std::result::Result<T, GroupChatError>;

/// Every failure the orchestration loop can surface to its caller.
///
/// None of these are swallowed: a failed loop returns the originating error
/// and leaves the conversation exactly as it was before the failing turn.
#[derive(Debug, Error)]
pub enum GroupChatError {
    /// The selection decision could not be decoded
    #[error("Selection parse error: {message}")]
    SelectionParse { message: String, raw: String },

    /// The selection named an agent outside the registry
    #[error("Unknown agent selected: {name} (registered: {registered:?})")]
    UnknownAgent {
        name: String,
        registered: Vec<String>,
    },

    /// The termination decision could not be decoded
    #[error("Termination parse error: {message}")]
    TerminationParse { message: String, raw: String },

    /// Completion provider or tool failure during an agent turn
    #[error("Agent execution error ({agent}): {message}")]
    AgentExecution { agent: String, message: String },

    /// A second loop tried to run on a session that already has one active
    #[error("Concurrency violation: session {session_id} already has an active loop")]
    ConcurrencyViolation { session_id: String },

    /// The session was shut down while the loop was in flight
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Completion provider failure while deciding selection or termination
    #[error("Provider error: {0}")]
    Provider(String),

    /// Invalid configuration or builder input
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GroupChatError {
    /// Wrap a provider or tool failure raised while `agent` was taking its turn.
    pub fn agent(agent: impl Into<String>, err: impl std::fmt::Display) -> Self {
        GroupChatError::AgentExecution {
            agent: agent.into(),
            message: err.to_string(),
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Parse failures and registry mismatches are logic errors; repeating the
    /// call would only repeat them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GroupChatError::Provider(_) | GroupChatError::AgentExecution { .. }
        )
    }

    /// Short, stable label used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            GroupChatError::SelectionParse { .. } => "selection_parse",
            GroupChatError::UnknownAgent { .. } => "unknown_agent",
            GroupChatError::TerminationParse { .. } => "termination_parse",
            GroupChatError::AgentExecution { .. } => "agent_execution",
            GroupChatError::ConcurrencyViolation { .. } => "concurrency_violation",
            GroupChatError::Cancelled(_) => "cancelled",
            GroupChatError::Provider(_) => "provider",
            GroupChatError::Configuration(_) => "configuration",
            GroupChatError::Serialization(_) => "serialization",
        }
    }

    /// Recover a typed error that travelled through a `BoxError` seam.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<GroupChatError>() {
            Ok(typed) => *typed,
            Err(other) => GroupChatError::Provider(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GroupChatError::UnknownAgent {
            name: "Nonexistent".to_string(),
            registered: vec!["QueryBuilder".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown agent selected: Nonexistent (registered: [\"QueryBuilder\"])"
        );

        let err = GroupChatError::ConcurrencyViolation {
            session_id: "s1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Concurrency violation: session s1 already has an active loop"
        );
    }

    #[test]
    fn parse_errors_are_not_transient() {
        let sel = GroupChatError::SelectionParse {
            message: "bad".into(),
            raw: "??".into(),
        };
        let term = GroupChatError::TerminationParse {
            message: "bad".into(),
            raw: "??".into(),
        };
        assert!(!sel.is_transient());
        assert!(!term.is_transient());
        assert!(GroupChatError::Provider("503".into()).is_transient());
        assert!(!GroupChatError::Cancelled("shutdown".into()).is_transient());
    }

    #[test]
    fn boxed_typed_error_round_trips() {
        let boxed: BoxError = Box::new(GroupChatError::Cancelled("bye".into()));
        assert!(matches!(
            GroupChatError::from_boxed(boxed),
            GroupChatError::Cancelled(_)
        ));

        let boxed: BoxError = "connection reset".into();
        assert!(matches!(
            GroupChatError::from_boxed(boxed),
            GroupChatError::Provider(m) if m == "connection reset"
        ));
    }
}
