//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |           Stream ID (4B)          |
//! +--------+--------+--------+--------+
//! |  Type  |       Length (4B)        |
//! +--------+--------+-----------------+
//! |          ... Length cont.         |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! Window-update frames carry a 4-byte big-endian increment as their
//! payload. Close frames carry either an empty payload (orderly
//! half-close) or a one-byte error code followed by a UTF-8 reason.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum payload size per frame (64 KB)
pub const MAX_PAYLOAD_SIZE: usize = 65536;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream open request, payload is the target address
    Open = 0x01,
    /// Data frame
    Data = 0x02,
    /// Window update (flow control)
    WindowUpdate = 0x03,
    /// Stream close (half-close, or error close with reason)
    Close = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::WindowUpdate),
            0x04 => Ok(FrameType::Close),
            _ => Err(TunnelError::MalformedFrame(format!(
                "unknown frame type: {}",
                value
            ))),
        }
    }
}

/// Reason carried by an error close, surfaced to the peer that opened
/// the stream so it can report the right stream-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// No forwarding rule authorizes the requested target
    ForwardRejected(String),
    /// The accepting side could not connect to the target
    DialFailed(String),
}

impl CloseReason {
    fn code(&self) -> u8 {
        match self {
            CloseReason::ForwardRejected(_) => 0x01,
            CloseReason::DialFailed(_) => 0x02,
        }
    }

    fn message(&self) -> &str {
        match self {
            CloseReason::ForwardRejected(msg) | CloseReason::DialFailed(msg) => msg,
        }
    }

    /// Parse a close payload. Empty means an orderly close.
    pub(crate) fn from_payload(payload: &[u8]) -> Result<Option<Self>, TunnelError> {
        if payload.is_empty() {
            return Ok(None);
        }
        let message = std::str::from_utf8(&payload[1..])
            .map_err(|_| TunnelError::MalformedFrame("close reason is not UTF-8".to_string()))?
            .to_string();
        match payload[0] {
            0x01 => Ok(Some(CloseReason::ForwardRejected(message))),
            0x02 => Ok(Some(CloseReason::DialFailed(message))),
            code => Err(TunnelError::MalformedFrame(format!(
                "unknown close code: {}",
                code
            ))),
        }
    }

    pub(crate) fn into_error(self) -> TunnelError {
        match self {
            CloseReason::ForwardRejected(msg) => TunnelError::ForwardRejected(msg),
            CloseReason::DialFailed(msg) => TunnelError::DialFailed(msg),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stream ID
    pub stream_id: u32,
    /// Frame type
    pub frame_type: FrameType,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a stream open frame
    pub fn open(stream_id: u32, target: &str) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Open,
            payload: Bytes::copy_from_slice(target.as_bytes()),
        }
    }

    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Data,
            payload,
        }
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            stream_id,
            frame_type: FrameType::WindowUpdate,
            payload: payload.freeze(),
        }
    }

    /// Create an orderly close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Close,
            payload: Bytes::new(),
        }
    }

    /// Create an error close frame carrying a reason for the peer
    pub fn close_with_reason(stream_id: u32, reason: &CloseReason) -> Self {
        let message = reason.message().as_bytes();
        let mut payload = BytesMut::with_capacity(1 + message.len());
        payload.put_u8(reason.code());
        payload.extend_from_slice(message);
        Self {
            stream_id,
            frame_type: FrameType::Close,
            payload: payload.freeze(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(payload_len as u32);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a frame from the front of `buf`, returning `None` when more
    /// bytes are needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let stream_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let frame_type = FrameType::try_from(buf[4])?;
        let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }
        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        if frame_type == FrameType::WindowUpdate && payload.len() != 4 {
            return Err(TunnelError::MalformedFrame(format!(
                "window update payload must be 4 bytes, got {}",
                payload.len()
            )));
        }

        Ok(Some(Self {
            stream_id,
            frame_type,
            payload,
        }))
    }

    /// Increment carried by a window update frame
    pub fn window_increment(&self) -> u32 {
        u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ])
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let mut encoded = original.encode().unwrap();

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded.frame_type, original.frame_type);
        assert_eq!(decoded.stream_id, original.stream_id);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut encoded = Frame::data(7, Bytes::new()).encode().unwrap();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_incomplete_frame() {
        let frame = Frame::data(1, Bytes::from_static(b"payload"));
        let encoded = frame.encode().unwrap();

        // Header alone is not enough
        let mut partial = BytesMut::from(&encoded[..FRAME_HEADER_SIZE]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());

        // Neither is a truncated payload
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut encoded = Frame::close(3).encode().unwrap();
        encoded[4] = 0x7F;
        assert!(matches!(
            Frame::decode(&mut encoded),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            Frame::data(1, payload).encode(),
            Err(TunnelError::FrameTooLarge(_, _))
        ));

        // A forged length field is rejected before buffering the payload
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32((MAX_PAYLOAD_SIZE + 1) as u32);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(TunnelError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn test_open_frame_roundtrip() {
        let target = "example.com:3000";
        let mut encoded = Frame::open(9, target).encode().unwrap();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded.frame_type, FrameType::Open);
        assert_eq!(decoded.stream_id, 9);
        assert_eq!(&decoded.payload[..], target.as_bytes());
    }

    #[test]
    fn test_window_update_roundtrip() {
        let mut encoded = Frame::window_update(5, 131072).encode().unwrap();
        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.window_increment(), 131072);
    }

    #[test]
    fn test_malformed_window_update() {
        let frame = Frame {
            stream_id: 5,
            frame_type: FrameType::WindowUpdate,
            payload: Bytes::from_static(b"xy"),
        };
        let mut encoded = frame.encode().unwrap();
        assert!(matches!(
            Frame::decode(&mut encoded),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_close_reason_roundtrip() {
        let reason = CloseReason::DialFailed("connection refused".to_string());
        let frame = Frame::close_with_reason(11, &reason);
        let parsed = CloseReason::from_payload(&frame.payload).unwrap();
        assert_eq!(parsed, Some(reason));

        assert_eq!(CloseReason::from_payload(&[]).unwrap(), None);
        assert!(CloseReason::from_payload(&[0x99, b'x']).is_err());
    }
}
