//! Integration tests for the background sweeper

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use studysync::engine::{CreateSessionRequest, EngineError, SessionEngine};
use studysync::protocol::{InviteAction, ServerMessage};
use studysync::registry::ConnectionRegistry;
use studysync::session::{SessionId, SessionStatus, StudySession, UserId, Visibility};
use studysync::store::{MemoryStore, SessionStore};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

fn setup() -> (Arc<SessionEngine>, Arc<MemoryStore>, Arc<ConnectionRegistry>) {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let engine = Arc::new(SessionEngine::new(store.clone(), registry.clone()));
    (engine, store, registry)
}

fn request_at(start_at: DateTime<Utc>, duration_minutes: i64) -> CreateSessionRequest {
    CreateSessionRequest {
        subject: "Thermodynamics".to_string(),
        start_at,
        duration_minutes,
        note: String::new(),
        visibility: Visibility::Private,
        invitees: Vec::new(),
    }
}

#[tokio::test]
async fn test_sweeper_starts_due_session_with_zero_connections() -> Result<()> {
    let (engine, store, _registry) = setup();
    let alice = UserId::new("alice");
    let start = Utc::now() - ChronoDuration::minutes(1);

    let session = engine
        .create_session(&alice, "Alice", request_at(start, 30))
        .await?;
    assert_eq!(session.status, SessionStatus::Scheduled);

    let (started, ended) = engine.sweep_at(Utc::now()).await?;
    assert_eq!(started, 1);
    assert_eq!(ended, 0);

    let stored = store.get(session.id).await?.unwrap();
    assert_eq!(stored.status, SessionStatus::InProgress);
    // Time-forced starts never stamp the live-join marker
    assert!(stored.actual_start_time.is_none());

    Ok(())
}

#[tokio::test]
async fn test_sweeper_ignores_future_sessions() -> Result<()> {
    let (engine, store, _registry) = setup();
    let alice = UserId::new("alice");
    let start = Utc::now() + ChronoDuration::hours(1);

    let session = engine
        .create_session(&alice, "Alice", request_at(start, 30))
        .await?;

    let (started, ended) = engine.sweep_at(Utc::now()).await?;
    assert_eq!(started, 0);
    assert_eq!(ended, 0);
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::Scheduled
    );

    Ok(())
}

#[tokio::test]
async fn test_sweeper_ignores_pending_sessions() -> Result<()> {
    let (engine, store, _registry) = setup();
    let alice = UserId::new("alice");
    let start = Utc::now() - ChronoDuration::minutes(5);

    let mut req = request_at(start, 30);
    req.invitees = vec![UserId::new("bob")];
    let session = engine.create_session(&alice, "Alice", req).await?;
    assert_eq!(session.status, SessionStatus::Pending);

    engine.sweep_at(Utc::now()).await?;

    // No acceptance yet, so the sweeper leaves it alone
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::Pending
    );

    Ok(())
}

#[tokio::test]
async fn test_sweeper_completes_exactly_at_end_time() -> Result<()> {
    let (engine, store, _registry) = setup();
    let alice = UserId::new("alice");
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();

    let session = engine
        .create_session(&alice, "Alice", request_at(start, 30))
        .await?;

    engine.sweep_at(start).await?;
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::InProgress
    );

    // One second before the window elapses: still live
    let almost = start + ChronoDuration::minutes(30) - ChronoDuration::seconds(1);
    let (_, ended) = engine.sweep_at(almost).await?;
    assert_eq!(ended, 0);
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::InProgress
    );

    // Exactly at the boundary: completed
    let boundary = start + ChronoDuration::minutes(30);
    let (_, ended) = engine.sweep_at(boundary).await?;
    assert_eq!(ended, 1);
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::Completed
    );

    // Completion also drops the session's mutation lock
    assert_eq!(engine.lock_count().await, 0);

    Ok(())
}

#[tokio::test]
async fn test_sweep_tolerates_extreme_durations() -> Result<()> {
    let (engine, store, _registry) = setup();
    let now = Utc::now();

    // Persisted directly: creation-time validation caps the duration, but a
    // sweep must survive whatever the store hands back
    let mut session = StudySession::new(
        UserId::new("alice"),
        "Marathon",
        now - ChronoDuration::minutes(5),
        i64::MAX,
        "",
        Visibility::Private,
        &[],
        now,
    );
    session.status = SessionStatus::InProgress;
    store.insert(session.clone()).await?;

    // End-time arithmetic saturates, so the session stays live
    let (started, ended) = engine.sweep_at(now).await?;
    assert_eq!(started, 0);
    assert_eq!(ended, 0);
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::InProgress
    );

    // A second pass behaves the same
    let (_, ended) = engine.sweep_at(now + ChronoDuration::hours(1)).await?;
    assert_eq!(ended, 0);

    Ok(())
}

#[tokio::test]
async fn test_sweeper_broadcasts_globally() -> Result<()> {
    let (engine, _store, registry) = setup();
    let alice = UserId::new("alice");
    let start = Utc::now() - ChronoDuration::minutes(1);

    let session = engine
        .create_session(&alice, "Alice", request_at(start, 30))
        .await?;

    // An unrelated connection, not a room member, still hears the announcement
    let (tx, mut rx) = mpsc::channel(16);
    registry
        .register(UserId::new("carol"), "Carol".to_string(), tx)
        .await;

    engine.sweep_at(Utc::now()).await?;

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    match event {
        ServerMessage::SessionStarted { session_id, .. } => {
            assert_eq!(session_id, session.id)
        }
        other => panic!("Expected SessionStarted, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn test_full_scenario_timeline() -> Result<()> {
    // Session at 2026-01-01T10:00Z, 30 minutes, one invitee
    let (engine, store, _registry) = setup();
    let alice = UserId::new("alice");
    let bob = UserId::new("bob");
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();

    let mut req = request_at(start, 30);
    req.invitees = vec![bob.clone()];
    let session = engine.create_session(&alice, "Alice", req).await?;
    assert_eq!(session.status, SessionStatus::Pending);

    // Invitee accepts -> scheduled
    engine
        .respond_to_invite(session.id, &bob, InviteAction::Accept)
        .await?;
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::Scheduled
    );

    // 10:00Z: nobody joined, sweeper forces in_progress
    engine.sweep_at(start).await?;
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::InProgress
    );

    // 10:15Z: chat succeeds and is persisted
    let at_quarter_past = engine
        .send_message(session.id, &bob, "Bob", "halfway there")
        .await?;
    assert_eq!(
        store.get(session.id).await?.unwrap().messages[0].id,
        at_quarter_past.id
    );

    // 10:30Z: sweeper forces completed
    engine.sweep_at(start + ChronoDuration::minutes(30)).await?;
    assert_eq!(
        store.get(session.id).await?.unwrap().status,
        SessionStatus::Completed
    );

    // 10:31Z: chat is closed
    let result = engine.send_message(session.id, &bob, "Bob", "anyone?").await;
    assert!(matches!(result, Err(EngineError::NotLive)));

    Ok(())
}

/// Store wrapper that fails writes for one designated session
struct FailPutStore {
    inner: MemoryStore,
    fail_id: Mutex<Option<SessionId>>,
}

impl FailPutStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_id: Mutex::new(None),
        }
    }

    fn fail_for(&self, id: SessionId) {
        *self.fail_id.lock().unwrap() = Some(id);
    }
}

#[async_trait]
impl SessionStore for FailPutStore {
    async fn insert(&self, session: StudySession) -> Result<()> {
        self.inner.insert(session).await
    }

    async fn get(&self, id: SessionId) -> Result<Option<StudySession>> {
        self.inner.get(id).await
    }

    async fn put(&self, session: StudySession) -> Result<()> {
        if *self.fail_id.lock().unwrap() == Some(session.id) {
            anyhow::bail!("simulated write failure");
        }
        self.inner.put(session).await
    }

    async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<StudySession>> {
        self.inner.list_by_status(status).await
    }

    async fn list_for_user(&self, user: &UserId) -> Result<Vec<StudySession>> {
        self.inner.list_for_user(user).await
    }
}

#[tokio::test]
async fn test_sweep_isolates_per_session_failures() -> Result<()> {
    let store = Arc::new(FailPutStore::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let engine = SessionEngine::new(store.clone(), registry);
    let alice = UserId::new("alice");
    let start = Utc::now() - ChronoDuration::minutes(1);

    let broken = engine
        .create_session(&alice, "Alice", request_at(start, 30))
        .await?;
    let healthy = engine
        .create_session(&alice, "Alice", request_at(start, 30))
        .await?;
    store.fail_for(broken.id);

    let (started, _) = engine.sweep_at(Utc::now()).await?;

    // The failing session is skipped, the other still advances
    assert_eq!(started, 1);
    assert_eq!(
        store.get(healthy.id).await?.unwrap().status,
        SessionStatus::InProgress
    );
    assert_eq!(
        store.get(broken.id).await?.unwrap().status,
        SessionStatus::Scheduled
    );

    Ok(())
}
