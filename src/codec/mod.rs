//! Conversions between conversation messages and provider wire/prompt text
//!
//! What this module provides
//! - `to_request_messages`: the shared log rendered as chat-completion request
//!   messages. Each message keeps its author as the `name` field, so every
//!   agent can tell the other speakers apart
//! - Turn-local helpers (`assistant_request`, `tool_result`) for the tool loop
//! - Prompt text: `render_template` substitutes `{{$key}}` placeholders,
//!   `render_transcript` produces `ROLE [author]: content` lines
//! - `decode_structured`: the validated boundary between free-form model text
//!   and typed decisions
//!
//! Composition
//! - Pure functions; agents and decision strategies call them at the edge
//!   before and after a provider round-trip.

use std::collections::BTreeMap;

use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionResponseMessage,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::items::{Message, Role};

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("request message build error: {0}")]
    Build(String),
    #[error("no JSON object found in model output")]
    NoJsonObject,
    #[error("invalid JSON object: {0}")]
    InvalidJson(String),
}

/// Provider `name` fields only accept `[A-Za-z0-9_-]`.
fn participant_name(author: &str) -> String {
    author
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn system_message(content: impl Into<String>) -> Result<ChatCompletionRequestMessage, CodecError> {
    let sys = ChatCompletionRequestSystemMessageArgs::default()
        .content(content.into())
        .build()
        .map_err(|e| CodecError::Build(e.to_string()))?;
    Ok(sys.into())
}

pub fn user_message(content: impl Into<String>) -> Result<ChatCompletionRequestMessage, CodecError> {
    let usr = ChatCompletionRequestUserMessageArgs::default()
        .content(content.into())
        .build()
        .map_err(|e| CodecError::Build(e.to_string()))?;
    Ok(usr.into())
}

/// Convert one conversation message to its request-side form.
pub fn to_request_message(message: &Message) -> Result<ChatCompletionRequestMessage, CodecError> {
    let name = participant_name(&message.author);
    let built: ChatCompletionRequestMessage = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(|e| CodecError::Build(e.to_string()))?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .name(name)
            .build()
            .map_err(|e| CodecError::Build(e.to_string()))?
            .into(),
        // Tool results in the shared log have no originating call id in this
        // request, so they travel as named assistant content.
        Role::Assistant | Role::Tool => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content.clone())
            .name(name)
            .build()
            .map_err(|e| CodecError::Build(e.to_string()))?
            .into(),
    };
    Ok(built)
}

/// Convert the shared log, in order.
pub fn to_request_messages(history: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, CodecError> {
    history.iter().map(to_request_message).collect()
}

/// Echo an assistant response (including its tool calls) back into a turn-local request.
pub fn assistant_request(
    assistant: &ChatCompletionResponseMessage,
) -> Result<ChatCompletionRequestMessage, CodecError> {
    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
    builder.content(assistant.content.clone().unwrap_or_default());
    if let Some(tool_calls) = assistant.tool_calls.clone() {
        builder.tool_calls(tool_calls);
    }
    let built = builder
        .build()
        .map_err(|e| CodecError::Build(e.to_string()))?;
    Ok(built.into())
}

/// Tool result message answering `tool_call_id`.
pub fn tool_result(
    tool_call_id: impl Into<String>,
    content: impl Into<String>,
) -> Result<ChatCompletionRequestMessage, CodecError> {
    let msg = ChatCompletionRequestToolMessageArgs::default()
        .content(content.into())
        .tool_call_id(tool_call_id.into())
        .build()
        .map_err(|e| CodecError::Build(e.to_string()))?;
    Ok(msg.into())
}

/// `ROLE [author]: content` lines, one per message.
pub fn render_transcript(history: &[Message]) -> String {
    history
        .iter()
        .map(Message::transcript_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substitute `{{$key}}` placeholders. Unknown keys render as the empty string.
pub fn render_template(template: &str, arguments: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{$") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match arguments.get(key) {
                    Some(value) => out.push_str(value),
                    None => debug!(placeholder = key, "template placeholder has no bound value"),
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder: keep the remainder literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode a single JSON object from model output.
///
/// Accepts a bare object, an object wrapped in a Markdown code fence, or an
/// object surrounded by prose. Anything else is an error.
pub fn decode_structured<T: DeserializeOwned>(raw: &str) -> Result<T, CodecError> {
    let trimmed = strip_fence(raw.trim());
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }
    let start = trimmed.find('{').ok_or(CodecError::NoJsonObject)?;
    let end = trimmed.rfind('}').ok_or(CodecError::NoJsonObject)?;
    if end < start {
        return Err(CodecError::NoJsonObject);
    }
    serde_json::from_str::<T>(&trimmed[start..=end])
        .map_err(|e| CodecError::InvalidJson(e.to_string()))
}

fn strip_fence(text: &str) -> &str {
    let Some(body) = text.strip_prefix("```") else {
        return text;
    };
    // Drop an optional language tag on the opening line.
    let body = match body.find('\n') {
        Some(nl) => &body[nl + 1..],
        None => body,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}
