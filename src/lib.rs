//! # Gimlet
//!
//! A tunneling service that exposes or reaches TCP endpoints across a
//! NAT/firewall boundary using a single outbound connection from client
//! to server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Forwarding Engine                     │
//! │   (local listeners, reverse listeners, byte copy)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │        (many streams, per-stream flow control)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Session Layer                       │
//! │      (handshake, auth, framing, reader/writer)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                      │
//! │                (TCP, optional TLS)                   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! One physical connection carries many independent logical byte-streams,
//! each corresponding to one forwarded socket. The client authenticates
//! once per connection and negotiates which forwarding rules are active;
//! after that, either side opens streams as its listeners accept
//! connections.

pub mod auth;
pub mod client;
pub mod config;
pub mod forward;
pub mod protocol;
pub mod server;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Credential store error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Forwarding spec error: {0}")]
    Spec(#[from] forward::SpecParseError),

    #[error("Configuration error: {0}")]
    Config(String),
}
