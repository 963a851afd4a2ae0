//! Session front-end: one loop per session, cancellation and reset

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use tower_groupchat::{
    BusyPolicy, ConversationHandle, EventNotifier, GroupAgent, GroupBuilder, GroupChat,
    GroupChatConfig, GroupChatError, Result, SessionId, SessionManager, StopCause,
    TerminationRequest, TerminationVerdict, TurnContext, TurnOutput,
};

/// Agent whose turn blocks until released.
struct Gated {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl GroupAgent for Gated {
    fn name(&self) -> &str {
        "Gated"
    }

    async fn respond(&self, _ctx: TurnContext) -> Result<TurnOutput> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(TurnOutput::text("released"))
    }
}

struct Gates {
    started: Arc<Notify>,
    release: Arc<Notify>,
    created: Arc<AtomicUsize>,
}

impl Gates {
    fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn factory(
        &self,
    ) -> impl Fn(&SessionId, EventNotifier, ConversationHandle) -> Result<GroupChat> + Send + Sync
    {
        let started = self.started.clone();
        let release = self.release.clone();
        let created = self.created.clone();
        move |id, notifier, conversation| {
            created.fetch_add(1, Ordering::SeqCst);
            GroupBuilder::new(id.as_str())
                .agent(Gated {
                    started: started.clone(),
                    release: release.clone(),
                })
                .termination(tower::service_fn(|_req: TerminationRequest| async {
                    Ok::<_, GroupChatError>(TerminationVerdict::stop("one turn per run"))
                }))
                .notifier(notifier)
                .conversation(conversation)
                .build()
        }
    }
}

#[tokio::test]
async fn second_loop_is_rejected_while_first_runs() {
    let gates = Gates::new();
    let manager = Arc::new(SessionManager::new(gates.factory()));
    let id = SessionId::from("s1");

    let first = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.send(&id, "first").await })
    };
    gates.started.notified().await;

    let err = manager.send(&id, "second").await.unwrap_err();
    assert!(matches!(err, GroupChatError::ConcurrencyViolation { ref session_id } if session_id == "s1"));
    // The rejected message never reached the conversation.
    assert_eq!(manager.history(&id).await.len(), 1);

    // A different session is unaffected.
    let other = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send(&"s2".into(), "hi").await })
    };
    gates.started.notified().await;

    gates.release.notify_one();
    gates.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().turns, 1);
    assert_eq!(other.await.unwrap().unwrap().turns, 1);
}

#[tokio::test]
async fn queued_loop_runs_after_the_first() {
    let gates = Gates::new();
    let manager = Arc::new(
        SessionManager::with_config(gates.factory(), &GroupChatConfig::default())
            .busy_policy(BusyPolicy::Queue),
    );
    let id = SessionId::from("s1");

    let first = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.send(&id, "first").await })
    };
    gates.started.notified().await;

    let second = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.send(&id, "second").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    // Still waiting: only the first user message is in the log.
    assert_eq!(manager.history(&id).await.len(), 1);

    // Release turns until both runs are done.
    let releaser = {
        let release = gates.release.clone();
        tokio::spawn(async move {
            loop {
                release.notify_one();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    releaser.abort();

    let stopped = StopCause::TerminationStrategy {
        reason: "one turn per run".into(),
    };
    assert_eq!(first.stop, stopped);
    assert_eq!(second.stop, stopped);

    // Turns never interleave: each user message is followed by its own run.
    let history = manager.history(&id).await;
    let first_len = 1 + first.messages.len();
    assert_eq!(history[0].content, "first");
    assert_eq!(history[first_len].content, "second");
    assert!(history[1..first_len].iter().all(|m| m.author == "Gated"));
    assert!(history[first_len + 1..].iter().all(|m| m.author == "Gated"));
}

#[tokio::test]
async fn shutdown_cancels_in_flight_loop() {
    let gates = Gates::new();
    let manager = Arc::new(SessionManager::new(gates.factory()));
    let id = SessionId::from("s1");
    let mut events = manager.subscribe(&id).await.unwrap();

    let running = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.send(&id, "long question").await })
    };
    gates.started.notified().await;

    assert!(manager.shutdown(&id).await);
    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, GroupChatError::Cancelled(_)));

    // The cancelled turn appended nothing; the failure was published.
    let mut saw_message = false;
    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        match event.event_type() {
            "message" => saw_message = true,
            "failed" => saw_failed = true,
            _ => {}
        }
    }
    assert!(!saw_message);
    assert!(saw_failed);
    assert!(!manager.contains(&id).await);

    // The next request starts a fresh session.
    let next = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.send(&id, "again").await })
    };
    gates.started.notified().await;
    gates.release.notify_one();
    next.await.unwrap().unwrap();
    assert_eq!(gates.created.load(Ordering::SeqCst), 2);
    assert_eq!(manager.history(&id).await[0].content, "again");
}

#[tokio::test]
async fn reset_session_rebuilds_from_the_factory() {
    let gates = Gates::new();
    let manager = Arc::new(SessionManager::new(gates.factory()));
    let id = SessionId::from("s1");
    let mut events = manager.subscribe(&id).await.unwrap();
    assert_eq!(gates.created.load(Ordering::SeqCst), 1);

    let run = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.send(&id, "question").await })
    };
    gates.started.notified().await;
    gates.release.notify_one();
    run.await.unwrap().unwrap();
    assert_eq!(manager.history(&id).await.len(), 2);
    assert_eq!(manager.iterations(&id).await, Some(1));

    manager.reset_session(&id).await.unwrap();
    assert_eq!(gates.created.load(Ordering::SeqCst), 2);
    assert!(manager.history(&id).await.is_empty());
    assert_eq!(manager.iterations(&id).await, Some(0));

    // Subscribers survive the reset.
    while events.try_recv().is_ok() {}
    let run = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.send(&id, "after reset").await })
    };
    gates.started.notified().await;
    gates.release.notify_one();
    run.await.unwrap().unwrap();
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event_type());
    }
    assert!(kinds.contains(&"message"));
    assert_eq!(kinds.last(), Some(&"completed"));
}
