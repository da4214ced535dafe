//! Stream handles for one multiplexed, bidirectional byte-pipe
//!
//! A [`Stream`] is handed out by [`super::Session::open`] or received
//! from [`super::IncomingStreams`]. It splits into a reader and a writer
//! half so the two directions of a forwarding copy loop can run
//! concurrently.

use super::frame::{CloseReason, Frame, MAX_PAYLOAD_SIZE};
use super::session::Shared;
use super::{TunnelError, DEFAULT_WINDOW_SIZE};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Inbound event delivered from the session reader to a stream handle
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// Data received for the stream
    Data(Bytes),
    /// Remote sent an orderly close for its direction
    RemoteClose,
    /// Stream torn down with a terminal error
    Terminated(TunnelError),
}

/// One logical forwarded connection multiplexed within a session
pub struct Stream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl Stream {
    pub(crate) fn new(reader: StreamReader, writer: StreamWriter) -> Self {
        Self { reader, writer }
    }

    /// Stream ID
    pub fn id(&self) -> u32 {
        self.writer.id
    }

    /// Target address this stream was opened toward
    pub fn target(&self) -> &str {
        &self.reader.target
    }

    /// Split into independently usable read and write halves
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }

    /// Read the next chunk of data, see [`StreamReader::read`]
    pub async fn read(&mut self) -> Result<Option<Bytes>, TunnelError> {
        self.reader.read().await
    }

    /// Write application bytes, see [`StreamWriter::write`]
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        self.writer.write(data).await
    }

    /// Close the local direction, see [`StreamWriter::close`]
    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Tear the stream down with an error carried to the peer.
    pub async fn reject(mut self, reason: CloseReason) {
        self.writer.close_with_reason(reason).await;
    }
}

/// Read half of a [`Stream`]
pub struct StreamReader {
    id: u32,
    target: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    shared: Arc<Shared>,
    /// Bytes consumed since the last window update was sent
    consumed: u32,
    eof: bool,
}

impl StreamReader {
    pub(crate) fn new(
        id: u32,
        target: String,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            target,
            events,
            shared,
            consumed: 0,
            eof: false,
        }
    }

    /// Consume buffered bytes in receipt order.
    ///
    /// Returns `Ok(None)` once the remote has closed its direction and the
    /// buffer has drained. Suspends while the stream is open and no data
    /// is buffered. Consuming data replenishes the peer's send window once
    /// half of it has been used up.
    pub async fn read(&mut self) -> Result<Option<Bytes>, TunnelError> {
        if self.eof {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(StreamEvent::Data(data)) => {
                self.consumed = self.consumed.saturating_add(data.len() as u32);
                if self.consumed >= DEFAULT_WINDOW_SIZE / 2 {
                    let increment = std::mem::take(&mut self.consumed);
                    self.shared.replenish_window(self.id, increment).await;
                }
                Ok(Some(data))
            }
            Some(StreamEvent::RemoteClose) => {
                self.eof = true;
                Ok(None)
            }
            Some(StreamEvent::Terminated(err)) => {
                self.eof = true;
                Err(err)
            }
            None => {
                self.eof = true;
                Err(TunnelError::SessionClosed)
            }
        }
    }
}

/// Write half of a [`Stream`]
pub struct StreamWriter {
    id: u32,
    frame_tx: mpsc::Sender<Frame>,
    window: Arc<Semaphore>,
    shared: Arc<Shared>,
    closed: bool,
}

impl StreamWriter {
    pub(crate) fn new(
        id: u32,
        frame_tx: mpsc::Sender<Frame>,
        window: Arc<Semaphore>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            frame_tx,
            window,
            shared,
            closed: false,
        }
    }

    /// Enqueue application bytes toward the peer.
    ///
    /// Suspends while the outbound flow-control window is exhausted, so a
    /// sender can never have more unacknowledged bytes in flight than the
    /// last advertised window. Payloads larger than one frame are chunked.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        if self.closed {
            return Err(TunnelError::StreamClosed);
        }
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let permit = self
                .window
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| self.terminal_error())?;
            // Permits are returned by window-update frames, not on drop
            permit.forget();

            self.frame_tx
                .send(Frame::data(self.id, Bytes::copy_from_slice(chunk)))
                .await
                .map_err(|_| TunnelError::SessionClosed)?;
        }
        Ok(())
    }

    /// Close the local direction. Idempotent; sends a close frame once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.frame_tx.send(Frame::close(self.id)).await;
        self.shared.mark_local_closed(self.id);
    }

    /// Tear the stream down with an error close carried to the peer.
    pub(crate) async fn close_with_reason(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .frame_tx
            .send(Frame::close_with_reason(self.id, &reason))
            .await;
        self.shared.remove_stream(self.id);
    }

    fn terminal_error(&self) -> TunnelError {
        if self.shared.is_closed() {
            TunnelError::SessionClosed
        } else {
            TunnelError::StreamClosed
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.frame_tx.try_send(Frame::close(self.id));
            self.shared.mark_local_closed(self.id);
        }
    }
}
