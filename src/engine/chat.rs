//! Chat relay - append-and-broadcast pipeline for in-session messages

use super::{EngineError, SessionEngine};
use crate::protocol::ServerMessage;
use crate::registry::RoomId;
use crate::session::{ChatMessage, MessageId, SessionId, SessionStatus, UserId, MAX_MESSAGE_LEN};
use chrono::Utc;
use uuid::Uuid;

impl SessionEngine {
    /// Append a chat message and relay it to the room
    ///
    /// Authorization is checked against the persisted session, not the
    /// in-memory room tracking; chat is only open while the session is live.
    pub async fn send_message(
        &self,
        session_id: SessionId,
        user: &UserId,
        name: &str,
        text: &str,
    ) -> Result<ChatMessage, EngineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("message text is empty".into()));
        }
        if text.chars().count() > MAX_MESSAGE_LEN {
            return Err(EngineError::InvalidInput(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_LEN
            )));
        }

        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;

        if !session.is_accepted(user) {
            return Err(EngineError::Unauthorized);
        }
        if session.status != SessionStatus::InProgress {
            return Err(EngineError::NotLive);
        }

        let message = ChatMessage {
            id: MessageId::new(),
            user: user.clone(),
            name: name.to_string(),
            text: text.to_string(),
            ts: Utc::now(),
        };

        session.push_message(message.clone());
        session.updated_at = message.ts;
        self.store
            .put(session)
            .await
            .map_err(EngineError::Storage)?;

        let room = RoomId::from(session_id);
        self.registry.cache_message(room, message.clone()).await;
        self.registry
            .broadcast_room(
                room,
                ServerMessage::NewChatMessage {
                    session_id,
                    message: message.clone(),
                },
                None,
            )
            .await;

        Ok(message)
    }

    /// Persisted chat history; viewable by accepted participants at any time
    pub async fn get_messages(
        &self,
        session_id: SessionId,
        user: &UserId,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        let session = self.load(session_id).await?;
        if !session.is_accepted(user) {
            return Err(EngineError::Unauthorized);
        }
        Ok(session.messages)
    }

    /// Relay a typing indicator to the room, excluding the sender
    ///
    /// Fire-and-forget: non-members are silently ignored, nothing persists.
    /// Receivers auto-clear the indicator after ~3s without a follow-up.
    pub async fn typing(
        &self,
        session_id: SessionId,
        conn_id: Uuid,
        user: &UserId,
        is_typing: bool,
    ) {
        let room = RoomId::from(session_id);
        if !self.registry.is_room_member(room, conn_id).await {
            return;
        }
        self.registry
            .broadcast_room(
                room,
                ServerMessage::UserTyping {
                    session_id,
                    user_id: user.clone(),
                    is_typing,
                },
                Some(conn_id),
            )
            .await;
    }
}
