//! Sessions: request/response front-end over per-session group chats
//!
//! What this module provides
//! - `SessionManager`, the only entry point front-ends (console, web hub) use
//! - At most one active loop per session; distinct sessions never share state
//! - Lazy creation of a session's group through an injected `GroupFactory`
//! - Explicit `reset_session` that swaps agents, strategies, counter and
//!   conversation in one step
//!
//! Concurrency model
//! - Each session owns a `tokio::sync::Mutex<GroupChat>`: holding it *is*
//!   running the loop. `BusyPolicy::Reject` uses `try_lock` and fails with
//!   `ConcurrencyViolation`; `BusyPolicy::Queue` waits for it.
//! - History reads go through the conversation handle and never take the run
//!   lock, so a front-end can render the transcript while a loop is active.
//! - `shutdown` cancels the session's token; an in-flight provider call is
//!   dropped and the loop returns `Cancelled` without a partial append.
//!
//! Testing strategy
//! - Fake agents gated on `tokio::sync::Notify` to hold a loop open while a
//!   second request arrives
//! - Factories built from closures; count how often they run

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::{BusyPolicy, GroupChatConfig};
use crate::error::{GroupChatError, Result};
use crate::events::{EventNotifier, GroupChatEvent};
use crate::groups::{GroupChat, GroupRun};
use crate::items::Message;
use crate::memory::ConversationHandle;

/// Session identifier newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Source of a session's agents and strategies.
///
/// The notifier and conversation are offered for `GroupBuilder::notifier` /
/// `GroupBuilder::conversation`. Using them is optional: the manager rebinds
/// the returned group to the session's notifier and reads history from
/// whatever conversation the group ended up with.
#[async_trait]
pub trait GroupFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &SessionId,
        notifier: EventNotifier,
        conversation: ConversationHandle,
    ) -> Result<GroupChat>;
}

#[async_trait]
impl<F> GroupFactory for F
where
    F: Fn(&SessionId, EventNotifier, ConversationHandle) -> Result<GroupChat> + Send + Sync,
{
    async fn create(
        &self,
        session_id: &SessionId,
        notifier: EventNotifier,
        conversation: ConversationHandle,
    ) -> Result<GroupChat> {
        (self)(session_id, notifier, conversation)
    }
}

struct Session {
    id: SessionId,
    group: Mutex<GroupChat>,
    conversation: RwLock<ConversationHandle>,
    notifier: EventNotifier,
    cancel: CancellationToken,
}

/// Owns every live session and serializes the loops within each one.
pub struct SessionManager {
    factory: Arc<dyn GroupFactory>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    busy_policy: BusyPolicy,
    event_capacity: usize,
}

impl SessionManager {
    pub fn new<F>(factory: F) -> Self
    where
        F: GroupFactory + 'static,
    {
        Self::with_config(factory, &GroupChatConfig::default())
    }

    /// Manager taking its busy policy and event capacity from `config`.
    pub fn with_config<F>(factory: F, config: &GroupChatConfig) -> Self
    where
        F: GroupFactory + 'static,
    {
        Self {
            factory: Arc::new(factory),
            sessions: RwLock::new(HashMap::new()),
            busy_policy: config.busy_policy,
            event_capacity: config.event_capacity,
        }
    }

    pub fn busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    /// Append a user message and run the loop.
    #[instrument(skip(self, text), fields(session_id = %session_id))]
    pub async fn send(&self, session_id: &SessionId, text: impl Into<String>) -> Result<GroupRun> {
        let session = self.session(session_id).await?;
        let mut group = self.acquire(&session).await?;
        let append = group.add_message(Message::user(text));
        append.await;
        group.invoke(&session.cancel).await
    }

    /// Run the loop on input that is already in the conversation.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn start(&self, session_id: &SessionId) -> Result<GroupRun> {
        let session = self.session(session_id).await?;
        let mut group = self.acquire(&session).await?;
        group.invoke(&session.cancel).await
    }

    /// Append messages without running the loop.
    ///
    /// Goes through the run lock so the messages never land in the middle
    /// of an active loop.
    #[instrument(skip(self, messages), fields(session_id = %session_id))]
    pub async fn add_messages(
        &self,
        session_id: &SessionId,
        messages: impl IntoIterator<Item = Message>,
    ) -> Result<()> {
        let session = self.session(session_id).await?;
        let group = self.acquire(&session).await?;
        let append = group.add_messages(messages);
        append.await;
        Ok(())
    }

    /// Snapshot of the conversation; empty for an unknown session.
    pub async fn history(&self, session_id: &SessionId) -> Vec<Message> {
        let session = self.sessions.read().await.get(session_id).cloned();
        match session {
            Some(session) => session.conversation.read().await.snapshot().await,
            None => Vec::new(),
        }
    }

    /// Termination evaluations since the session was last (re)initialized.
    ///
    /// Waits for an active loop to finish.
    pub async fn iterations(&self, session_id: &SessionId) -> Option<usize> {
        let session = self.sessions.read().await.get(session_id).cloned()?;
        let group = session.group.lock().await;
        Some(group.iterations())
    }

    /// Rebuild the session's group from the factory.
    ///
    /// Agents, strategies, the iteration counter and the conversation are
    /// replaced while the run lock is held; event subscribers stay attached.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn reset_session(&self, session_id: &SessionId) -> Result<()> {
        let session = self.session(session_id).await?;
        let mut group = self.acquire(&session).await?;

        let mut fresh = self
            .factory
            .create(session_id, session.notifier.clone(), ConversationHandle::new())
            .await?;
        fresh.set_notifier(session.notifier.clone());

        *session.conversation.write().await = fresh.conversation().clone();
        *group = fresh;
        info!("🔄 session reset");
        Ok(())
    }

    /// Cancel any in-flight loop and drop the session.
    ///
    /// Returns whether the session existed.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn shutdown(&self, session_id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                session.cancel.cancel();
                info!("session shut down");
                true
            }
            None => false,
        }
    }

    /// Receive the session's loop events, creating the session if needed.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<broadcast::Receiver<GroupChatEvent>> {
        Ok(self.session(session_id).await?.notifier.subscribe())
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn session(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return Ok(session.clone());
        }

        let notifier = EventNotifier::with_capacity(session_id.as_str(), self.event_capacity);
        let mut group = self
            .factory
            .create(session_id, notifier.clone(), ConversationHandle::new())
            .await?;
        group.set_notifier(notifier.clone());
        let conversation = group.conversation().clone();
        let candidate = Arc::new(Session {
            id: session_id.clone(),
            group: Mutex::new(group),
            conversation: RwLock::new(conversation),
            notifier,
            cancel: CancellationToken::new(),
        });

        // Another caller may have created it while the factory ran.
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "session created");
                candidate
            })
            .clone();
        Ok(session)
    }

    async fn acquire<'a>(&self, session: &'a Session) -> Result<MutexGuard<'a, GroupChat>> {
        match self.busy_policy {
            BusyPolicy::Reject => {
                session
                    .group
                    .try_lock()
                    .map_err(|_| GroupChatError::ConcurrencyViolation {
                        session_id: session.id.to_string(),
                    })
            }
            BusyPolicy::Queue => {
                debug!(session_id = %session.id, "waiting for active loop");
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => Err(GroupChatError::Cancelled(format!(
                        "session {} shut down",
                        session.id
                    ))),
                    group = session.group.lock() => Ok(group),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{GroupAgent, TurnContext, TurnOutput};
    use crate::groups::{GroupBuilder, StopCause};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Answer;

    #[async_trait]
    impl GroupAgent for Answer {
        fn name(&self) -> &str {
            "Answer"
        }

        async fn respond(&self, ctx: TurnContext) -> Result<TurnOutput> {
            Ok(TurnOutput::text(format!("reply #{}", ctx.history.len())))
        }
    }

    fn factory(
        created: Arc<AtomicUsize>,
    ) -> impl Fn(&SessionId, EventNotifier, ConversationHandle) -> Result<GroupChat> + Send + Sync
    {
        move |id, notifier, conversation| {
            created.fetch_add(1, Ordering::SeqCst);
            GroupBuilder::new(id.as_str())
                .agent(Answer)
                .max_iterations(1)
                .notifier(notifier)
                .conversation(conversation)
                .build()
        }
    }

    #[tokio::test]
    async fn sessions_are_created_lazily_and_kept() {
        let created = Arc::new(AtomicUsize::new(0));
        let manager = SessionManager::new(factory(created.clone()));
        let id = SessionId::from("s1");

        assert!(manager.history(&id).await.is_empty());
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let run = manager.send(&id, "hello").await.unwrap();
        assert_eq!(run.stop, StopCause::MaxIterations);
        manager.send(&id, "again").await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(manager.contains(&id).await);

        let history = manager.history(&id).await;
        assert_eq!(history[0].content, "hello");
        assert!(history.len() > 2);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let manager = SessionManager::new(factory(Arc::new(AtomicUsize::new(0))));
        manager.send(&"a".into(), "one").await.unwrap();
        manager.send(&"b".into(), "two").await.unwrap();
        assert_eq!(manager.history(&"a".into()).await[0].content, "one");
        assert_eq!(manager.history(&"b".into()).await[0].content, "two");
        assert_eq!(
            manager.session_ids().await,
            vec![SessionId::from("a"), SessionId::from("b")]
        );
    }

    #[tokio::test]
    async fn reset_replaces_conversation_and_counter() {
        let created = Arc::new(AtomicUsize::new(0));
        let manager = SessionManager::new(factory(created.clone()));
        let id = SessionId::from("s1");
        manager.send(&id, "hello").await.unwrap();
        assert_eq!(manager.iterations(&id).await, Some(2));

        manager.reset_session(&id).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert!(manager.history(&id).await.is_empty());
        assert_eq!(manager.iterations(&id).await, Some(0));
    }

    #[tokio::test]
    async fn add_messages_does_not_run_the_loop() {
        let manager = SessionManager::new(factory(Arc::new(AtomicUsize::new(0))));
        let id = SessionId::from("hub");
        manager
            .add_messages(&id, vec![Message::user("earlier question")])
            .await
            .unwrap();
        assert_eq!(manager.history(&id).await.len(), 1);
        let run = manager.start(&id).await.unwrap();
        assert!(run.turns >= 1);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn request_futures_are_send() {
        let manager = SessionManager::new(factory(Arc::new(AtomicUsize::new(0))));
        let id = SessionId::from("s1");
        assert_send(&manager.send(&id, "hello"));
        assert_send(&manager.start(&id));
        assert_send(&manager.add_messages(&id, vec![Message::user("earlier")]));
        assert_send(&manager.reset_session(&id));
        assert_send(&manager.subscribe(&id));
        assert_send(&manager.history(&id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_runs_on_a_spawned_task() {
        let manager = Arc::new(SessionManager::new(factory(Arc::new(AtomicUsize::new(0)))));
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.send(&SessionId::from(id), "hello").await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().stop, StopCause::MaxIterations);
        }
        assert_eq!(manager.history(&"a".into()).await[0].content, "hello");
    }

    #[tokio::test]
    async fn factory_may_ignore_the_offered_handles() {
        let manager = SessionManager::new(
            |id: &SessionId, _notifier: EventNotifier, _conversation: ConversationHandle| {
                GroupBuilder::new(id.as_str())
                    .agent(Answer)
                    .max_iterations(1)
                    .build()
            },
        );
        let id = SessionId::from("s1");
        let mut events = manager.subscribe(&id).await.unwrap();

        manager.send(&id, "hello").await.unwrap();
        let history = manager.history(&id).await;
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].author, "Answer");

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.event_type())
            .collect();
        assert!(kinds.contains(&"message"));
        assert_eq!(kinds.last(), Some(&"completed"));

        manager.reset_session(&id).await.unwrap();
        assert!(manager.history(&id).await.is_empty());
        manager.send(&id, "after reset").await.unwrap();
        assert_eq!(manager.history(&id).await[0].content, "after reset");
        assert!(events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn shutdown_drops_the_session() {
        let manager = SessionManager::new(factory(Arc::new(AtomicUsize::new(0))));
        let id = SessionId::from("s1");
        manager.send(&id, "hello").await.unwrap();
        assert!(manager.shutdown(&id).await);
        assert!(!manager.contains(&id).await);
        assert!(!manager.shutdown(&id).await);
        assert!(manager.history(&id).await.is_empty());
    }
}
