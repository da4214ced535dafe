//! Tunnel layer - multiplexed streams over one transport connection
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing with a reader and a writer task per session
//! - Per-stream flow control

mod frame;
mod session;
mod stream;

pub use frame::{CloseReason, Frame, FrameType, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use session::{AdmissionPolicy, IncomingStreams, Session, Side};
pub use stream::{Stream, StreamReader, StreamWriter};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Session closed")]
    SessionClosed,

    #[error("Forward rejected: {0}")]
    ForwardRejected(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Flow control violation")]
    FlowControl,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maximum number of live streams per session
pub const MAX_STREAMS: usize = 1024;

/// Default flow-control window per stream (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 262144;
