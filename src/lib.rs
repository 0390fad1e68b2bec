//! studysync - real-time coordination for collaborative study sessions
//!
//! This crate provides the core functionality for studysync, including:
//! - Session lifecycle (invitation protocol, rooms, time-driven transitions)
//! - Chat relay over live session rooms
//! - Client-server protocol
//! - Configuration management
//!
//! # Architecture
//!
//! studysync uses a client-server model where:
//! - The server (`studysync-server`) manages session state and live rooms
//! - Clients connect over a framed socket, authenticate once per connection,
//!   and exchange lifecycle/chat events
//! - A background sweeper forces wall-clock transitions (start time reached,
//!   duration elapsed) independent of user action

pub mod auth;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod sweeper;
