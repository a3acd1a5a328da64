//! Presence Chat Server Library
//!
//! A single-threaded JSON chat server. Clients connect over TCP, announce
//! themselves with a `presence` message and are then relayed every chat
//! message any admitted client sends, their own included.
//!
//! # Features
//! - Presence handshake with a bounded timeout
//! - Draft-6 subset schema validation per message kind
//! - Broadcast of chat messages to every writable member
//! - Probe (presence re-announcement) and quit handling
//! - Per-connection failure isolation
//!
//! # Architecture
//! One task runs the whole server through readiness polling:
//! - `Server` owns the listener and the `Registry` of connections
//! - each iteration accepts, polls, reads and writes without ever
//!   blocking on a single peer
//! - no locks needed: the registry is only touched by the loop
//!
//! # Example
//! ```ignore
//! use presence_chat::{Config, SchemaSet, Server};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = Config::default();
//!     let settings = config.validate().unwrap();
//!     let schemas = SchemaSet::builtin().unwrap();
//!
//!     Server::bind(&settings, schemas).unwrap().run().await;
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod message;
pub mod registry;
pub mod schema;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use codec::{Codec, TextEncoding};
pub use config::{Cli, Config, ServerSettings};
pub use connection::Connection;
pub use error::{ConfigError, ConnError, DecodeError, SchemaError, ValidationError};
pub use message::{ChatMessage, Message, MessageKind, Presence, Response, User};
pub use registry::Registry;
pub use schema::{Schema, SchemaKind, SchemaSet};
pub use server::{Iteration, Server};
pub use types::ConnId;
