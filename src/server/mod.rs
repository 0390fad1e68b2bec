//! Server module - TCP listener and client connection handling

mod connection;
mod listener;

pub use connection::{read_message, write_message};
pub use listener::ServerListener;
