//! Message types for the studysync real-time protocol

use crate::session::{ChatMessage, SessionId, StudySession, UserId, Visibility};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response to a session invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteAction {
    Accept,
    Decline,
}

/// Error taxonomy reported back to the originating connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller lacks the required participant status or role
    Unauthorized,
    /// Session or participant entry absent
    NotFound,
    /// Chat attempted outside an in-progress session
    NotLive,
    /// Empty message text or malformed payload
    InvalidInput,
    /// Status change rejected by the lifecycle state machine
    InvalidTransition,
    /// Persistence failure or other internal error
    Server,
}

/// Lightweight session view for list responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub creator: UserId,
    pub subject: String,
    pub start_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: crate::session::SessionStatus,
}

impl From<&StudySession> for SessionSummary {
    fn from(s: &StudySession) -> Self {
        Self {
            id: s.id,
            creator: s.creator.clone(),
            subject: s.subject.clone(),
            start_at: s.start_at,
            duration_minutes: s.duration_minutes,
            status: s.status,
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake: credential plus protocol version, required first frame
    Hello {
        token: String,
        protocol_version: u32,
    },

    /// Create a session and invite friends
    CreateSession {
        subject: String,
        start_at: DateTime<Utc>,
        duration_minutes: i64,
        note: String,
        visibility: Visibility,
        invitees: Vec<UserId>,
    },

    /// Accept or decline an invitation
    RespondInvite {
        session_id: SessionId,
        action: InviteAction,
    },

    /// Cancel a session (creator only)
    CancelSession { session_id: SessionId },

    /// Join the live room
    JoinSession { session_id: SessionId },

    /// Leave the live room
    LeaveSession { session_id: SessionId },

    /// Send a chat message to the room
    SendChatMessage { session_id: SessionId, text: String },

    /// Typing indicator, fire-and-forget
    Typing {
        session_id: SessionId,
        is_typing: bool,
    },

    /// Request the persisted chat history
    GetSessionMessages { session_id: SessionId },

    /// List sessions the caller created or participates in
    /// (reconnect reconciliation)
    ListMySessions,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake response; the connection is now bound to this user
    Welcome {
        user_id: UserId,
        protocol_version: u32,
    },

    /// An invitation arrived on the user's private channel
    ReceiveInvite {
        from: UserId,
        name: String,
        session: StudySession,
    },

    /// Sent to the creator after a successful create
    SessionCreated { session: StudySession },

    /// Sent to a responder after accept/decline so their list refreshes
    SessionUpdated { session: StudySession },

    /// The session became joinable (first acceptance)
    SessionScheduled { session: StudySession },

    /// An invitee accepted; sent to the creator
    InviteAccepted {
        session_id: SessionId,
        user_id: UserId,
    },

    /// An invitee declined; sent to the creator
    InviteDeclined {
        session_id: SessionId,
        user_id: UserId,
    },

    /// The session went live (first join, or sweeper at start time)
    SessionStarted {
        session_id: SessionId,
        session: StudySession,
    },

    /// The session's scheduled time window elapsed
    SessionEnded { session_id: SessionId },

    /// The creator cancelled the session
    SessionCancelled { session_id: SessionId },

    /// Join confirmation with the current chat log and live count
    SessionJoined {
        session_id: SessionId,
        session: StudySession,
        messages: Vec<ChatMessage>,
        live_count: usize,
    },

    /// Leave confirmation
    SessionLeft { session_id: SessionId },

    /// Another participant joined the room
    UserJoined {
        session_id: SessionId,
        user_id: UserId,
        name: String,
        live_count: usize,
    },

    /// Another participant left the room
    UserLeft {
        session_id: SessionId,
        user_id: UserId,
        name: String,
        live_count: usize,
    },

    /// A chat message was appended and relayed
    NewChatMessage {
        session_id: SessionId,
        message: ChatMessage,
    },

    /// Typing indicator relay (receivers auto-clear after ~3s)
    UserTyping {
        session_id: SessionId,
        user_id: UserId,
        is_typing: bool,
    },

    /// Persisted chat history response
    SessionMessages {
        session_id: SessionId,
        messages: Vec<ChatMessage>,
    },

    /// List response for reconnect reconciliation
    SessionList { sessions: Vec<SessionSummary> },

    /// A join attempt failed
    JoinError {
        session_id: SessionId,
        kind: ErrorKind,
        message: String,
    },

    /// A chat operation failed
    ChatError {
        session_id: SessionId,
        kind: ErrorKind,
        message: String,
    },

    /// Generic error response
    Error { kind: ErrorKind, message: String },
}
