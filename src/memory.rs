//! Conversation state and bounded history views
//!
//! `ConversationState` is the authoritative, append-only log of a session.
//! Reducers hand decision strategies a bounded read-only suffix of that log
//! without ever truncating it.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::items::Message;

/// Append-only ordered message log owned by one session.
///
/// There is deliberately no way to edit, remove or reorder a message. A
/// session that needs a clean slate gets a new `ConversationState`.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one message to the tail.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Add several messages to the tail, in order.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Full ordered sequence at call time.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Borrowed view of the log.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Shared handle to a session's conversation.
///
/// Every operation holds the lock for a single read or append only, so a
/// history request from one front-end never waits on a provider call made by
/// the running loop.
#[derive(Debug, Clone, Default)]
pub struct ConversationHandle {
    inner: Arc<RwLock<ConversationState>>,
}

impl ConversationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, message: Message) {
        self.inner.write().await.append(message);
    }

    pub async fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        self.inner.write().await.extend(messages);
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.inner.read().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn last(&self) -> Option<Message> {
        self.inner.read().await.last().cloned()
    }
}

/// The most recent `window` messages of `history`, in original order.
pub fn reduce(history: &[Message], window: usize) -> &[Message] {
    let start = history.len().saturating_sub(window);
    &history[start..]
}

/// Maps a full message sequence to the bounded view a decision is made on.
pub trait HistoryReducer: Send + Sync {
    fn reduce<'a>(&self, history: &'a [Message]) -> &'a [Message];
}

/// Keeps only the last `window` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationReducer {
    pub window: usize,
}

impl TruncationReducer {
    pub fn new(window: usize) -> Self {
        Self { window }
    }
}

impl HistoryReducer for TruncationReducer {
    fn reduce<'a>(&self, history: &'a [Message]) -> &'a [Message] {
        reduce(history, self.window)
    }
}

/// Passes the whole history through.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullHistory;

impl HistoryReducer for FullHistory {
    fn reduce<'a>(&self, history: &'a [Message]) -> &'a [Message] {
        history
    }
}
