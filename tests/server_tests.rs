//! Integration tests for the server module

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use std::sync::Arc;
use std::time::Duration;
use studysync::auth::{Claims, JwtVerifier};
use studysync::config::Config;
use studysync::engine::SessionEngine;
use studysync::protocol::{
    deserialize, serialize, ClientMessage, ErrorKind, ServerMessage, PROTOCOL_VERSION,
};
use studysync::registry::ConnectionRegistry;
use studysync::server::ServerListener;
use studysync::session::{UserId, Visibility};
use studysync::store::MemoryStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_SECRET: &str = "integration-test-secret";

/// Helper to read a length-prefixed message
async fn read_message(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await.ok()?;
    Some(buffer)
}

/// Helper to write a length-prefixed message
async fn write_message(stream: &mut TcpStream, payload: &[u8]) {
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
}

fn make_token(sub: &str, name: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        name: name.to_string(),
        exp: (Utc::now() + ChronoDuration::hours(1)).timestamp() as u64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Start a server on the given port; returns the shutdown handle
fn start_server(port: u16) -> (mpsc::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let mut config = Config::default();
    config.server.listen_addr = format!("127.0.0.1:{}", port);
    config.auth.jwt_secret = TEST_SECRET.to_string();

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let engine = Arc::new(SessionEngine::new(store, registry));
    let verifier = Arc::new(JwtVerifier::new(TEST_SECRET));

    let server = ServerListener::new(config, engine, verifier);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move { server.run(shutdown_rx).await });
    (shutdown_tx, handle)
}

async fn hello(stream: &mut TcpStream, token: &str) {
    let msg = ClientMessage::Hello {
        token: token.to_string(),
        protocol_version: PROTOCOL_VERSION,
    };
    write_message(stream, &serialize(&msg).unwrap()).await;
}

#[tokio::test]
async fn test_server_welcomes_authenticated_client() {
    let (shutdown_tx, server_handle) = start_server(47621);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect("127.0.0.1:47621").await.unwrap();
    hello(&mut stream, &make_token("alice", "Alice")).await;

    let welcome_bytes = timeout(Duration::from_secs(2), read_message(&mut stream))
        .await
        .expect("Should receive message")
        .expect("Message should not be empty");

    let welcome: ServerMessage = deserialize(&welcome_bytes).expect("Should deserialize");

    match welcome {
        ServerMessage::Welcome {
            user_id,
            protocol_version,
        } => {
            assert_eq!(user_id, UserId::new("alice"));
            assert_eq!(protocol_version, PROTOCOL_VERSION);
        }
        _ => panic!("Expected Welcome message, got {:?}", welcome),
    }

    drop(stream);
    let _ = shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), server_handle).await;
}

#[tokio::test]
async fn test_server_rejects_bad_token() {
    let (shutdown_tx, server_handle) = start_server(47622);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect("127.0.0.1:47622").await.unwrap();
    hello(&mut stream, "not-a-real-token").await;

    let response_bytes = timeout(Duration::from_secs(2), read_message(&mut stream))
        .await
        .expect("Should receive response")
        .expect("Response should not be empty");

    let response: ServerMessage = deserialize(&response_bytes).expect("Should deserialize");
    match response {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Unauthorized),
        _ => panic!("Expected Error message, got {:?}", response),
    }

    // The server drops the connection after the rejection
    let eof = timeout(Duration::from_secs(2), read_message(&mut stream)).await;
    assert!(matches!(eof, Ok(None)));

    let _ = shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), server_handle).await;
}

#[tokio::test]
async fn test_server_rejects_wrong_protocol_version() {
    let (shutdown_tx, server_handle) = start_server(47623);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect("127.0.0.1:47623").await.unwrap();
    let msg = ClientMessage::Hello {
        token: make_token("alice", "Alice"),
        protocol_version: 999,
    };
    write_message(&mut stream, &serialize(&msg).unwrap()).await;

    let response_bytes = timeout(Duration::from_secs(2), read_message(&mut stream))
        .await
        .expect("Should receive response")
        .expect("Response should not be empty");

    let response: ServerMessage = deserialize(&response_bytes).expect("Should deserialize");
    match response {
        ServerMessage::Error { message, .. } => {
            assert!(message.contains("Protocol version mismatch"));
        }
        _ => panic!("Expected Error message, got {:?}", response),
    }

    let _ = shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), server_handle).await;
}

#[tokio::test]
async fn test_server_drops_connection_without_hello() {
    let (shutdown_tx, server_handle) = start_server(47624);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect("127.0.0.1:47624").await.unwrap();
    let msg = ClientMessage::ListMySessions;
    write_message(&mut stream, &serialize(&msg).unwrap()).await;

    // No welcome, no error: the unauthenticated connection just closes
    let eof = timeout(Duration::from_secs(2), read_message(&mut stream)).await;
    assert!(matches!(eof, Ok(None)));

    let _ = shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), server_handle).await;
}

#[tokio::test]
async fn test_create_and_join_over_the_wire() {
    let (shutdown_tx, server_handle) = start_server(47625);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect("127.0.0.1:47625").await.unwrap();
    hello(&mut stream, &make_token("alice", "Alice")).await;

    // Welcome
    let _ = timeout(Duration::from_secs(2), read_message(&mut stream))
        .await
        .unwrap()
        .unwrap();

    // Create a session with no invitees: immediately scheduled
    let create = ClientMessage::CreateSession {
        subject: "Databases".to_string(),
        start_at: Utc::now() + ChronoDuration::minutes(10),
        duration_minutes: 60,
        note: String::new(),
        visibility: Visibility::Private,
        invitees: vec![],
    };
    write_message(&mut stream, &serialize(&create).unwrap()).await;

    let created_bytes = timeout(Duration::from_secs(2), read_message(&mut stream))
        .await
        .unwrap()
        .unwrap();
    let session_id = match deserialize::<ServerMessage>(&created_bytes).unwrap() {
        ServerMessage::SessionCreated { session } => session.id,
        other => panic!("Expected SessionCreated, got {:?}", other),
    };

    // Join: the first join starts the session and returns the (empty) log
    let join = ClientMessage::JoinSession { session_id };
    write_message(&mut stream, &serialize(&join).unwrap()).await;

    let mut saw_started = false;
    let mut saw_joined = false;
    for _ in 0..2 {
        let bytes = timeout(Duration::from_secs(2), read_message(&mut stream))
            .await
            .unwrap()
            .unwrap();
        match deserialize::<ServerMessage>(&bytes).unwrap() {
            ServerMessage::SessionStarted { session_id: id, .. } => {
                assert_eq!(id, session_id);
                saw_started = true;
            }
            ServerMessage::SessionJoined {
                session_id: id,
                live_count,
                messages,
                ..
            } => {
                assert_eq!(id, session_id);
                assert_eq!(live_count, 1);
                assert!(messages.is_empty());
                saw_joined = true;
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }
    assert!(saw_started && saw_joined);

    drop(stream);
    let _ = shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), server_handle).await;
}
