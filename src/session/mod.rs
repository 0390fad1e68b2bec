//! Study session domain model - statuses, participants, bounded chat log

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum number of chat messages retained per session (oldest dropped first)
pub const MESSAGE_LOG_CAP: usize = 500;

/// Maximum length of a single chat message in characters
pub const MAX_MESSAGE_LEN: usize = 2000;

/// Maximum planned session length in minutes (24 hours)
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable user identifier, resolved from the handshake credential
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique chat message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session lifecycle status
///
/// Transitions are monotonic along pending -> scheduled -> in_progress ->
/// completed; cancelled is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Completed and cancelled sessions never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Whether participants may join the live room in this status
    pub fn is_joinable(&self) -> bool {
        matches!(self, SessionStatus::Scheduled | SessionStatus::InProgress)
    }

    /// Check a forward transition against the state machine
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Scheduled, InProgress)
                | (InProgress, Completed)
                | (Pending, Cancelled)
                | (Scheduled, Cancelled)
                | (InProgress, Cancelled)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Invitation state of a single participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Accepted,
    Declined,
    Removed,
}

/// Who can discover the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Friends,
}

/// A user attached to a session via the invite/accept protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user: UserId,
    pub status: ParticipantStatus,
    pub invited_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Participant {
    fn invited(user: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            status: ParticipantStatus::Invited,
            invited_at: now,
            responded_at: None,
        }
    }

    fn accepted(user: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            status: ParticipantStatus::Accepted,
            invited_at: now,
            responded_at: Some(now),
        }
    }
}

/// One entry in a session's chat log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub user: UserId,
    /// Sender display name, cached at send time
    pub name: String,
    pub text: String,
    pub ts: DateTime<Utc>,
}

/// The central entity: a scheduled collaborative study period with its own
/// room and chat log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySession {
    pub id: SessionId,
    /// Owns cancellation rights
    pub creator: UserId,
    pub subject: String,
    pub note: String,
    pub visibility: Visibility,
    /// Scheduled wall-clock start
    pub start_at: DateTime<Utc>,
    /// Planned length in minutes
    pub duration_minutes: i64,
    pub status: SessionStatus,
    /// Stamped when the first participant actually joins the live room
    pub actual_start_time: Option<DateTime<Utc>>,
    pub participants: Vec<Participant>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StudySession {
    /// Create a new session
    ///
    /// The creator is always inserted as an already-accepted participant.
    /// Sessions with invitees start `pending`; with none, `scheduled`.
    pub fn new(
        creator: UserId,
        subject: impl Into<String>,
        start_at: DateTime<Utc>,
        duration_minutes: i64,
        note: impl Into<String>,
        visibility: Visibility,
        invitees: &[UserId],
        now: DateTime<Utc>,
    ) -> Self {
        let subject: String = subject.into();
        let mut participants = vec![Participant::accepted(creator.clone(), now)];
        for invitee in invitees {
            if *invitee == creator {
                continue;
            }
            participants.push(Participant::invited(invitee.clone(), now));
        }

        let status = if invitees.is_empty() {
            SessionStatus::Scheduled
        } else {
            SessionStatus::Pending
        };

        Self {
            id: SessionId::new(),
            creator,
            subject: subject.trim().to_string(),
            note: note.into(),
            visibility,
            start_at,
            duration_minutes,
            status,
            actual_start_time: None,
            participants,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Scheduled end: `start_at` plus the planned duration
    ///
    /// Out-of-range durations clamp to the far end of the representable
    /// time range instead of overflowing.
    pub fn end_time(&self) -> DateTime<Utc> {
        Duration::try_minutes(self.duration_minutes)
            .and_then(|d| self.start_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Look up a user's participant entry
    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user == user)
    }

    pub fn participant_mut(&mut self, user: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user == user)
    }

    /// Whether the user is an accepted participant
    pub fn is_accepted(&self, user: &UserId) -> bool {
        self.participant(user)
            .is_some_and(|p| p.status == ParticipantStatus::Accepted)
    }

    /// True once any participant (the creator counts) has accepted
    pub fn has_accepted_participant(&self) -> bool {
        self.participants
            .iter()
            .any(|p| p.status == ParticipantStatus::Accepted)
    }

    /// Append a chat message, truncating to the most recent
    /// [`MESSAGE_LOG_CAP`] entries (FIFO)
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() > MESSAGE_LOG_CAP {
            let excess = self.messages.len() - MESSAGE_LOG_CAP;
            self.messages.drain(..excess);
        }
    }
}
