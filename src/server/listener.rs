//! TCP listener and server main loop

use super::connection::{client_writer_task, parse_client_message, read_message};
use crate::auth::{Identity, TokenVerifier};
use crate::config::Config;
use crate::engine::{CreateSessionRequest, SessionEngine};
use crate::protocol::{
    check_version_compatibility, ClientMessage, ErrorKind, ServerMessage, SessionSummary,
    PROTOCOL_VERSION,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Realtime coordination server
pub struct ServerListener {
    config: Config,
    engine: Arc<SessionEngine>,
    verifier: Arc<dyn TokenVerifier>,
}

impl ServerListener {
    pub fn new(config: Config, engine: Arc<SessionEngine>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            config,
            engine,
            verifier,
        }
    }

    /// Run the server
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        tracing::info!("Server listening on {}", self.config.server.listen_addr);

        // Main server loop
        loop {
            tokio::select! {
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                // Accept new connections
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            let verifier = Arc::clone(&self.verifier);
                            let queue_depth = self.config.server.client_queue_depth;
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, engine, verifier, queue_depth).await {
                                    tracing::error!("Client error ({}): {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Handle a single client connection
///
/// The first frame must be a verifiable Hello; anything else drops the
/// connection before any event is accepted.
async fn handle_client(
    stream: TcpStream,
    engine: Arc<SessionEngine>,
    verifier: Arc<dyn TokenVerifier>,
    queue_depth: usize,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::channel::<ServerMessage>(queue_depth);
    let writer_handle = tokio::spawn(client_writer_task(writer, rx));

    // Handshake gate
    let identity = match authenticate(&mut reader, verifier.as_ref()).await {
        Ok(Some(identity)) => identity,
        Ok(None) => {
            writer_handle.abort();
            return Ok(());
        }
        Err(reject) => {
            let _ = tx.send(reject).await;
            drop(tx);
            let _ = writer_handle.await;
            return Ok(());
        }
    };

    let conn_id = engine
        .registry()
        .register(identity.user.clone(), identity.name.clone(), tx.clone())
        .await;

    tracing::info!("Client connected: {} as {}", conn_id, identity.user);

    let _ = tx
        .send(ServerMessage::Welcome {
            user_id: identity.user.clone(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await;

    // Read and process events
    loop {
        match read_message(&mut reader).await {
            Ok(Some(bytes)) => match parse_client_message(&bytes) {
                Ok(msg) => {
                    if let Some(reply) = process_message(msg, conn_id, &identity, &engine).await {
                        if tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to parse message: {}", e);
                    let _ = tx
                        .send(ServerMessage::Error {
                            kind: ErrorKind::InvalidInput,
                            message: format!("Invalid message: {}", e),
                        })
                        .await;
                }
            },
            Ok(None) => {
                tracing::info!("Client disconnected: {}", conn_id);
                break;
            }
            Err(e) => {
                tracing::error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    // Best-effort cleanup: leave every room, tell the rooms about it
    let departures = engine.registry().unregister(conn_id).await;
    for departure in departures {
        engine
            .registry()
            .broadcast_room(
                departure.room,
                ServerMessage::UserLeft {
                    session_id: departure.room.session(),
                    user_id: departure.user,
                    name: departure.name,
                    live_count: departure.live_count,
                },
                None,
            )
            .await;
    }

    writer_handle.abort();

    tracing::info!("Client handler finished: {}", conn_id);

    Ok(())
}

/// Read and verify the handshake frame
///
/// Returns Ok(None) when the client disconnected or never sent a parseable
/// Hello; Err carries the rejection message to flush before dropping.
async fn authenticate<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
    verifier: &dyn TokenVerifier,
) -> std::result::Result<Option<Identity>, ServerMessage> {
    let bytes = match read_message(reader).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(None),
        Err(e) => {
            tracing::error!("Handshake read failed: {}", e);
            return Ok(None);
        }
    };

    let Ok(ClientMessage::Hello {
        token,
        protocol_version,
    }) = parse_client_message(&bytes)
    else {
        tracing::warn!("Dropping connection: first frame was not Hello");
        return Ok(None);
    };

    if let Err(e) = check_version_compatibility(protocol_version, PROTOCOL_VERSION) {
        return Err(ServerMessage::Error {
            kind: ErrorKind::InvalidInput,
            message: e.to_string(),
        });
    }

    match verifier.verify(&token) {
        Ok(identity) => Ok(Some(identity)),
        Err(e) => {
            tracing::warn!("Handshake rejected: {}", e);
            Err(ServerMessage::Error {
                kind: ErrorKind::Unauthorized,
                message: "Unauthorized".to_string(),
            })
        }
    }
}

/// Process a client event and return the optional direct reply
///
/// Success-side notifications are pushed by the engine through the registry;
/// failures always come back to the originating connection only.
async fn process_message(
    msg: ClientMessage,
    conn_id: Uuid,
    identity: &Identity,
    engine: &Arc<SessionEngine>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Hello { .. } => Some(ServerMessage::Error {
            kind: ErrorKind::InvalidInput,
            message: "Already authenticated".to_string(),
        }),

        ClientMessage::CreateSession {
            subject,
            start_at,
            duration_minutes,
            note,
            visibility,
            invitees,
        } => {
            let req = CreateSessionRequest {
                subject,
                start_at,
                duration_minutes,
                note,
                visibility,
                invitees,
            };
            match engine
                .create_session(&identity.user, &identity.name, req)
                .await
            {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        ClientMessage::RespondInvite { session_id, action } => {
            match engine
                .respond_to_invite(session_id, &identity.user, action)
                .await
            {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        ClientMessage::CancelSession { session_id } => {
            match engine.cancel_session(session_id, &identity.user).await {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        ClientMessage::JoinSession { session_id } => {
            match engine
                .join_room(session_id, conn_id, &identity.user, &identity.name)
                .await
            {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::JoinError {
                    session_id,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        ClientMessage::LeaveSession { session_id } => {
            match engine
                .leave_room(session_id, conn_id, &identity.user, &identity.name)
                .await
            {
                Ok(()) => None,
                Err(e) => Some(ServerMessage::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        ClientMessage::SendChatMessage { session_id, text } => {
            match engine
                .send_message(session_id, &identity.user, &identity.name, &text)
                .await
            {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::ChatError {
                    session_id,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        ClientMessage::Typing {
            session_id,
            is_typing,
        } => {
            engine
                .typing(session_id, conn_id, &identity.user, is_typing)
                .await;
            None
        }

        ClientMessage::GetSessionMessages { session_id } => {
            match engine.get_messages(session_id, &identity.user).await {
                Ok(messages) => Some(ServerMessage::SessionMessages {
                    session_id,
                    messages,
                }),
                Err(e) => Some(ServerMessage::ChatError {
                    session_id,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        ClientMessage::ListMySessions => match engine.sessions_for(&identity.user).await {
            Ok(sessions) => Some(ServerMessage::SessionList {
                sessions: sessions.iter().map(SessionSummary::from).collect(),
            }),
            Err(e) => Some(ServerMessage::Error {
                kind: e.kind(),
                message: e.to_string(),
            }),
        },
    }
}
