//! Messages exchanged in a group chat
//!
//! A `Message` is immutable once it has been appended to a conversation; its
//! sequence position is its index in the conversation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author name used for messages typed by the human participant.
pub const USER_AUTHOR: &str = "user";

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Upper-case label used when rendering transcripts.
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "TOOL",
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Agent name, or `"user"` for human input
    pub author: String,
    pub content: String,
    /// Names of the tools invoked while producing this message, in call order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            author: author.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, USER_AUTHOR, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, "system", content)
    }

    /// A message produced by the named agent.
    pub fn assistant(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, agent, content)
    }

    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Tool, tool_name, content)
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<String>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Transcript line in the `ROLE [author]: content` form.
    pub fn transcript_line(&self) -> String {
        let content = if self.content.is_empty() {
            "<No Content>"
        } else {
            self.content.as_str()
        };
        format!("{} [{}]: {}", self.role.label(), self.author, content)
    }
}
