//! Loop events for external subscribers
//!
//! The orchestration loop writes events to a broadcast channel and never waits
//! on subscribers. Front-ends (console renderer, network broadcaster) drain
//! their own receiver at their own pace; a receiver that falls behind the
//! channel capacity observes `RecvError::Lagged` instead of slowing the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::groups::StopCause;
use crate::items::Message;
use crate::selection::SelectionResult;
use crate::termination::TerminationResult;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something observable happened inside a session's loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupChatEvent {
    /// An agent turn completed and its message was appended
    Message {
        session_id: String,
        message: Message,
    },
    /// A selection decision was decoded (before registry validation)
    Selection {
        session_id: String,
        result: SelectionResult,
    },
    /// A termination evaluation finished, including cap short-circuits
    Termination {
        session_id: String,
        agent: String,
        result: TerminationResult,
    },
    /// The run reached `COMPLETE`
    Completed {
        session_id: String,
        turns: usize,
        stop: StopCause,
    },
    /// The run reached `FAILED`
    Failed {
        session_id: String,
        kind: String,
        error: String,
    },
}

impl GroupChatEvent {
    pub fn session_id(&self) -> &str {
        match self {
            GroupChatEvent::Message { session_id, .. }
            | GroupChatEvent::Selection { session_id, .. }
            | GroupChatEvent::Termination { session_id, .. }
            | GroupChatEvent::Completed { session_id, .. }
            | GroupChatEvent::Failed { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            GroupChatEvent::Message { .. } => "message",
            GroupChatEvent::Selection { .. } => "selection",
            GroupChatEvent::Termination { .. } => "termination",
            GroupChatEvent::Completed { .. } => "completed",
            GroupChatEvent::Failed { .. } => "failed",
        }
    }
}

/// Session-scoped broadcast publisher.
///
/// Clones publish into the same channel.
#[derive(Clone)]
pub struct EventNotifier {
    session_id: String,
    tx: broadcast::Sender<GroupChatEvent>,
    emit_count: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("session_id", &self.session_id)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl EventNotifier {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_capacity(session_id, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(session_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            session_id: session_id.into(),
            tx,
            emit_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish without waiting. Returns how many receivers got the event.
    pub fn emit(&self, event: GroupChatEvent) -> usize {
        self.emit_count.fetch_add(1, Ordering::Relaxed);
        let event_type = event.event_type();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(session_id = %self.session_id, event_type, delivered, "event emitted");
        delivered
    }

    pub fn message(&self, message: &Message) -> usize {
        self.emit(GroupChatEvent::Message {
            session_id: self.session_id.clone(),
            message: message.clone(),
        })
    }

    pub fn selection(&self, result: &SelectionResult) -> usize {
        self.emit(GroupChatEvent::Selection {
            session_id: self.session_id.clone(),
            result: result.clone(),
        })
    }

    pub fn termination(&self, agent: &str, result: &TerminationResult) -> usize {
        self.emit(GroupChatEvent::Termination {
            session_id: self.session_id.clone(),
            agent: agent.to_string(),
            result: result.clone(),
        })
    }

    pub fn completed(&self, turns: usize, stop: &StopCause) -> usize {
        self.emit(GroupChatEvent::Completed {
            session_id: self.session_id.clone(),
            turns,
            stop: stop.clone(),
        })
    }

    pub fn failed(&self, error: &crate::error::GroupChatError) -> usize {
        self.emit(GroupChatEvent::Failed {
            session_id: self.session_id.clone(),
            kind: error.kind().to_string(),
            error: error.to_string(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupChatEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}
