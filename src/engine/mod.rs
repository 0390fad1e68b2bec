//! Session lifecycle engine - creation, invitation protocol, rooms, cancellation
//!
//! Every mutation of a session document runs under that session's lock, so a
//! sweeper tick and a connection-triggered mutation can never interleave a
//! read-modify-write on the same session.

mod chat;

use crate::protocol::{ErrorKind, InviteAction, ServerMessage};
use crate::registry::{ConnectionRegistry, RoomId};
use crate::session::{
    ParticipantStatus, SessionId, SessionStatus, StudySession, UserId, Visibility,
    MAX_DURATION_MINUTES,
};
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Failures surfaced to the originating connection as typed error events
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Caller lacks the required participant status or role")]
    Unauthorized,

    #[error("Session or participant entry not found")]
    NotFound,

    #[error("Session is not live")]
    NotLive,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Storage failure: {0}")]
    Storage(anyhow::Error),
}

impl EngineError {
    /// Protocol-level error category for this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Unauthorized => ErrorKind::Unauthorized,
            EngineError::NotFound => ErrorKind::NotFound,
            EngineError::NotLive => ErrorKind::NotLive,
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::Storage(_) => ErrorKind::Server,
        }
    }
}

/// Parameters for creating a session
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub subject: String,
    pub start_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub note: String,
    pub visibility: Visibility,
    pub invitees: Vec<UserId>,
}

/// The state machine governing session documents
///
/// Consumes the session store, emits events via the connection registry.
pub struct SessionEngine {
    store: Arc<dyn SessionStore>,
    registry: Arc<ConnectionRegistry>,
    /// Per-session mutation locks
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionEngine {
    pub fn new(store: Arc<dyn SessionStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            registry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get (or create) the mutation lock for a session
    pub(crate) async fn lock_for(&self, id: SessionId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the mutation lock of a session that reached a terminal state
    ///
    /// Terminal sessions reject every further transition, so a stale lock
    /// entry only wastes memory. A later operation recreates one on demand.
    pub(crate) async fn discard_lock(&self, id: SessionId) {
        self.locks.lock().await.remove(&id);
    }

    /// Number of sessions currently holding a mutation lock entry
    pub async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub(crate) async fn load(&self, id: SessionId) -> Result<StudySession, EngineError> {
        self.store
            .get(id)
            .await
            .map_err(EngineError::Storage)?
            .ok_or(EngineError::NotFound)
    }

    /// Create a session and notify invitees on their private channels
    ///
    /// The creator is inserted as an accepted participant; with invitees the
    /// session starts `pending`, otherwise it is immediately `scheduled`.
    pub async fn create_session(
        &self,
        creator: &UserId,
        creator_name: &str,
        req: CreateSessionRequest,
    ) -> Result<StudySession, EngineError> {
        if req.subject.trim().is_empty() {
            return Err(EngineError::InvalidInput("subject is required".into()));
        }
        if req.duration_minutes <= 0 || req.duration_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::InvalidInput(format!(
                "duration must be between 1 and {} minutes",
                MAX_DURATION_MINUTES
            )));
        }

        let now = Utc::now();
        let session = StudySession::new(
            creator.clone(),
            req.subject,
            req.start_at,
            req.duration_minutes,
            req.note,
            req.visibility,
            &req.invitees,
            now,
        );

        self.store
            .insert(session.clone())
            .await
            .map_err(EngineError::Storage)?;

        for participant in &session.participants {
            if participant.status != ParticipantStatus::Invited {
                continue;
            }
            self.registry
                .send_to_user(
                    &participant.user,
                    ServerMessage::ReceiveInvite {
                        from: creator.clone(),
                        name: creator_name.to_string(),
                        session: session.clone(),
                    },
                )
                .await;
        }

        // Creator sees the new session immediately in their own list
        self.registry
            .send_to_user(
                creator,
                ServerMessage::SessionCreated {
                    session: session.clone(),
                },
            )
            .await;

        Ok(session)
    }

    /// Accept or decline an invitation
    ///
    /// The first acceptance of a pending session promotes it to `scheduled`
    /// and announces joinability to every accepted participant.
    pub async fn respond_to_invite(
        &self,
        session_id: SessionId,
        user: &UserId,
        action: InviteAction,
    ) -> Result<StudySession, EngineError> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;
        let now = Utc::now();

        let entry = session
            .participant_mut(user)
            .filter(|p| p.status == ParticipantStatus::Invited)
            .ok_or(EngineError::NotFound)?;

        entry.status = match action {
            InviteAction::Accept => ParticipantStatus::Accepted,
            InviteAction::Decline => ParticipantStatus::Declined,
        };
        entry.responded_at = Some(now);

        let newly_scheduled = action == InviteAction::Accept
            && session.status == SessionStatus::Pending
            && session.has_accepted_participant();
        if newly_scheduled {
            session.status = SessionStatus::Scheduled;
        }
        session.updated_at = now;

        self.store
            .put(session.clone())
            .await
            .map_err(EngineError::Storage)?;

        match action {
            InviteAction::Accept => {
                self.registry
                    .send_to_user(
                        &session.creator,
                        ServerMessage::InviteAccepted {
                            session_id,
                            user_id: user.clone(),
                        },
                    )
                    .await;
            }
            InviteAction::Decline => {
                self.registry
                    .send_to_user(
                        &session.creator,
                        ServerMessage::InviteDeclined {
                            session_id,
                            user_id: user.clone(),
                        },
                    )
                    .await;
            }
        }

        // Refresh the responder's own session list
        self.registry
            .send_to_user(
                user,
                ServerMessage::SessionUpdated {
                    session: session.clone(),
                },
            )
            .await;

        if newly_scheduled {
            for participant in &session.participants {
                if participant.status != ParticipantStatus::Accepted {
                    continue;
                }
                self.registry
                    .send_to_user(
                        &participant.user,
                        ServerMessage::SessionScheduled {
                            session: session.clone(),
                        },
                    )
                    .await;
            }
        }

        Ok(session)
    }

    /// Join the session's live room
    ///
    /// The first join of a scheduled session flips it to `in_progress` and
    /// stamps `actual_start_time`; later joins see the session already live
    /// and neither re-stamp nor re-announce the start.
    pub async fn join_room(
        &self,
        session_id: SessionId,
        conn_id: Uuid,
        user: &UserId,
        name: &str,
    ) -> Result<StudySession, EngineError> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;

        if !session.is_accepted(user) {
            return Err(EngineError::Unauthorized);
        }
        if !session.status.is_joinable() {
            return Err(EngineError::Unauthorized);
        }

        let now = Utc::now();
        let starting = session.status == SessionStatus::Scheduled;
        if starting {
            session.status = SessionStatus::InProgress;
            session.actual_start_time = Some(now);
            session.updated_at = now;
            self.store
                .put(session.clone())
                .await
                .map_err(EngineError::Storage)?;
        }

        let room = RoomId::from(session_id);
        let live_count = self.registry.join_room(room, conn_id).await;

        if starting {
            self.registry
                .broadcast_room(
                    room,
                    ServerMessage::SessionStarted {
                        session_id,
                        session: session.clone(),
                    },
                    None,
                )
                .await;
        }

        self.registry
            .broadcast_room(
                room,
                ServerMessage::UserJoined {
                    session_id,
                    user_id: user.clone(),
                    name: name.to_string(),
                    live_count,
                },
                Some(conn_id),
            )
            .await;

        // Hand the joiner the persisted chat log
        self.registry
            .send_to_connection(
                conn_id,
                ServerMessage::SessionJoined {
                    session_id,
                    session: session.clone(),
                    messages: session.messages.clone(),
                    live_count,
                },
            )
            .await;

        Ok(session)
    }

    /// Leave the session's live room
    ///
    /// Only in-memory tracking changes; persisted status is never rolled back
    /// on an emptied room. The sweeper or cancellation ends a live session.
    pub async fn leave_room(
        &self,
        session_id: SessionId,
        conn_id: Uuid,
        user: &UserId,
        name: &str,
    ) -> Result<(), EngineError> {
        let room = RoomId::from(session_id);
        let live_count = self
            .registry
            .leave_room(room, conn_id)
            .await
            .ok_or(EngineError::NotFound)?;

        self.registry
            .send_to_connection(conn_id, ServerMessage::SessionLeft { session_id })
            .await;

        self.registry
            .broadcast_room(
                room,
                ServerMessage::UserLeft {
                    session_id,
                    user_id: user.clone(),
                    name: name.to_string(),
                    live_count,
                },
                None,
            )
            .await;

        Ok(())
    }

    /// Cancel a session (creator only, never from a terminal state)
    pub async fn cancel_session(
        &self,
        session_id: SessionId,
        caller: &UserId,
    ) -> Result<StudySession, EngineError> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;

        if session.creator != *caller {
            return Err(EngineError::Unauthorized);
        }
        if session.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Cancelled,
            });
        }

        session.status = SessionStatus::Cancelled;
        session.updated_at = Utc::now();
        self.store
            .put(session.clone())
            .await
            .map_err(EngineError::Storage)?;

        // The creator is a participant too, so this covers everyone
        for participant in &session.participants {
            self.registry
                .send_to_user(
                    &participant.user,
                    ServerMessage::SessionCancelled { session_id },
                )
                .await;
        }

        self.discard_lock(session_id).await;

        Ok(session)
    }

    /// Sessions the user created or was invited to (reconnect reconciliation)
    pub async fn sessions_for(&self, user: &UserId) -> Result<Vec<StudySession>, EngineError> {
        self.store
            .list_for_user(user)
            .await
            .map_err(EngineError::Storage)
    }

    /// Force time-driven transitions; see [`crate::sweeper`]
    ///
    /// Scans persisted state only: scheduled sessions whose start time passed
    /// go live, in-progress sessions whose window elapsed complete. Failures
    /// on one session never abort the sweep of the others.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<(usize, usize), EngineError> {
        let mut started = 0;
        let mut ended = 0;

        let due = self
            .store
            .list_by_status(SessionStatus::Scheduled)
            .await
            .map_err(EngineError::Storage)?;
        for candidate in due {
            if candidate.start_at > now {
                continue;
            }
            match self.sweep_start(candidate.id, now).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Sweeper failed to start session {}: {}", candidate.id, e);
                }
            }
        }

        let live = self
            .store
            .list_by_status(SessionStatus::InProgress)
            .await
            .map_err(EngineError::Storage)?;
        for candidate in live {
            if now < candidate.end_time() {
                continue;
            }
            match self.sweep_complete(candidate.id, now).await {
                Ok(true) => ended += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Sweeper failed to complete session {}: {}", candidate.id, e);
                }
            }
        }

        Ok((started, ended))
    }

    async fn sweep_start(&self, id: SessionId, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        // Re-check under the lock: a join may have raced us here
        let mut session = self.load(id).await?;
        if session.status != SessionStatus::Scheduled || session.start_at > now {
            return Ok(false);
        }

        session.status = SessionStatus::InProgress;
        session.updated_at = now;
        self.store
            .put(session.clone())
            .await
            .map_err(EngineError::Storage)?;

        // Global announcement: the room may still be empty at start time
        self.registry
            .broadcast_all(ServerMessage::SessionStarted {
                session_id: id,
                session,
            })
            .await;

        Ok(true)
    }

    async fn sweep_complete(&self, id: SessionId, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut session = self.load(id).await?;
        if session.status != SessionStatus::InProgress || now < session.end_time() {
            return Ok(false);
        }

        session.status = SessionStatus::Completed;
        session.updated_at = now;
        self.store
            .put(session)
            .await
            .map_err(EngineError::Storage)?;

        self.registry
            .broadcast_all(ServerMessage::SessionEnded { session_id: id })
            .await;

        self.discard_lock(id).await;

        Ok(true)
    }
}
