//! Handshake protocol
//!
//! Performed once per connection, before any streams exist: the client
//! presents the protocol version, a credential and the forwarding specs
//! it wants active; the server answers with a session-level verdict plus
//! a per-spec decision. Messages are length-prefixed JSON over the raw
//! transport.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version, negotiated at handshake time
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum handshake message size (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// How long the server waits for a client's handshake request
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Handshake rejected: {0}")]
    Rejected(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client hello: version, credential and the requested forwarding specs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: u8,
    pub username: String,
    pub secret: String,
    /// Forwarding specs in their textual form, e.g. `2001:example.com:3000`
    pub specs: Vec<String>,
}

/// Why the server refused the session as a whole
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeError {
    VersionMismatch { expected: u8, actual: u8 },
    AuthFailed,
    Other(String),
}

impl HandshakeError {
    pub fn into_protocol_error(self) -> ProtocolError {
        match self {
            HandshakeError::VersionMismatch { expected, actual } => {
                ProtocolError::VersionMismatch { expected, actual }
            }
            HandshakeError::AuthFailed => ProtocolError::AuthFailed,
            HandshakeError::Other(msg) => ProtocolError::Rejected(msg),
        }
    }
}

/// Per-spec verdict; rejecting one spec does not fail the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecDecision {
    pub spec: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

/// Server verdict for the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub error: Option<HandshakeError>,
    /// One decision per requested spec, in request order
    pub specs: Vec<SpecDecision>,
}

impl HandshakeResponse {
    pub fn rejected(error: HandshakeError) -> Self {
        Self {
            accepted: false,
            error: Some(error),
            specs: Vec::new(),
        }
    }
}

/// Write a length-prefixed handshake message
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body =
        serde_json::to_vec(message).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed handshake message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let request = HandshakeRequest {
            version: PROTOCOL_VERSION,
            username: "alice".to_string(),
            secret: "hunter2".to_string(),
            specs: vec!["2001:3000".to_string(), "R:9000:127.0.0.1:22".to_string()],
        };
        write_message(&mut a, &request).await.unwrap();

        let received: HandshakeRequest = read_message(&mut b).await.unwrap();
        assert_eq!(received.version, PROTOCOL_VERSION);
        assert_eq!(received.username, "alice");
        assert_eq!(received.specs.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut a, mut b) = tokio::io::duplex(16);
        tokio::spawn(async move {
            let _ = a.write_all(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes()).await;
        });

        let result: Result<HandshakeRequest, _> = read_message(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge(_))));
    }

    #[tokio::test]
    async fn test_garbage_message_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&8u32.to_be_bytes()).await;
            let _ = a.write_all(b"not json").await;
        });

        let result: Result<HandshakeResponse, _> = read_message(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }
}
