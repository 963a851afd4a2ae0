//! Observability: tracing setup and loop event logging
//!
//! What this module provides
//! - `init_tracing(LogFormat)` installs a `tracing-subscriber` fmt subscriber
//!   filtered by `RUST_LOG` (default `info`)
//! - `spawn_event_logger(receiver)` turns a session's event stream into
//!   structured log lines; messages render as `ROLE [author]: content`
//!
//! Composition
//! - `init_tracing(LogFormat::Compact)?;`
//! - `spawn_event_logger(group.subscribe());`
//!
//! Testing strategy
//! - Drive the logger with a notifier and assert it drains until the channel
//!   closes

use std::str::FromStr;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::{GroupChatError, Result};
use crate::events::GroupChatEvent;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = GroupChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(GroupChatError::Configuration(format!(
                "unknown log format: {}",
                other
            ))),
        }
    }
}

/// Install the global subscriber.
///
/// Fails if one is already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| GroupChatError::Configuration(format!("tracing init failed: {}", e)))
}

/// Console rendering of one event, or `None` for events only worth a debug line.
pub fn render_event(event: &GroupChatEvent) -> Option<String> {
    match event {
        GroupChatEvent::Message { message, .. } => Some(message.transcript_line()),
        GroupChatEvent::Completed { turns, stop, .. } => {
            Some(format!("group chat complete after {} turns ({:?})", turns, stop))
        }
        GroupChatEvent::Failed { kind, error, .. } => Some(format!("{}: {}", kind, error)),
        GroupChatEvent::Selection { .. } | GroupChatEvent::Termination { .. } => None,
    }
}

/// Log every event from `receiver` until the channel closes.
///
/// A lagging logger reports how many events it missed and keeps going.
pub fn spawn_event_logger(mut receiver: broadcast::Receiver<GroupChatEvent>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    log_event(&event);
                    logged += 1;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        logged
    })
}

fn log_event(event: &GroupChatEvent) {
    let session_id = event.session_id();
    match event {
        GroupChatEvent::Message { message, .. } => {
            info!(
                session_id,
                role = message.role.label(),
                author = %message.author,
                tools = ?message.tool_calls,
                "{}",
                message.transcript_line()
            );
        }
        GroupChatEvent::Selection { result, .. } => {
            info!(
                session_id,
                next_agent = %result.next_agent,
                reason = %result.reason,
                "📍 selection"
            );
        }
        GroupChatEvent::Termination { agent, result, .. } => {
            info!(
                session_id,
                agent = %agent,
                iteration = result.iteration,
                should_stop = result.should_stop,
                source = ?result.source,
                reason = %result.reason,
                "termination evaluated"
            );
        }
        GroupChatEvent::Completed { turns, stop, .. } => {
            info!(session_id, turns, stop = ?stop, "🎯 group chat complete");
        }
        GroupChatEvent::Failed { kind, error, .. } => {
            error!(session_id, kind = %kind, error = %error, "❌ group chat failed");
        }
    }
}
