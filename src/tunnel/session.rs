//! Session multiplexer
//!
//! A session exclusively owns one transport connection and multiplexes
//! many streams over it: one reader task decodes frames and routes them
//! by stream id, one writer task serializes queued frames back onto the
//! transport. The stream registry is a single mutex domain, never held
//! across an await.

use super::frame::{CloseReason, Frame, FrameType};
use super::stream::{Stream, StreamEvent, StreamReader, StreamWriter};
use super::{TunnelError, DEFAULT_WINDOW_SIZE, MAX_STREAMS};
use bytes::BytesMut;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, trace, warn};

/// Frames queued toward the writer task before senders suspend
const FRAME_QUEUE_DEPTH: usize = 256;

/// Remotely-initiated streams queued toward the acceptor
const ACCEPT_QUEUE_DEPTH: usize = 32;

/// Upper bound on accumulated send credit; a peer advertising more than
/// this is violating flow control
const MAX_WINDOW_CREDIT: usize = 1 << 30;

/// Which end of the tunnel this session is. Determines stream-id parity:
/// client-initiated streams are odd, server-initiated even, so the two
/// sides can never allocate the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Targets a peer is allowed to open streams toward.
///
/// Built from the forwarding rules negotiated at handshake time; a
/// remotely-initiated open for any other target is refused without
/// affecting the session.
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    targets: HashSet<String>,
}

impl AdmissionPolicy {
    pub fn new<I: IntoIterator<Item = String>>(targets: I) -> Self {
        Self {
            targets: targets.into_iter().collect(),
        }
    }

    /// A policy that refuses every remotely-initiated stream
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn allows(&self, target: &str) -> bool {
        self.targets.contains(target)
    }
}

/// Lifecycle of one stream, tracked in the session registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Both directions open
    Open,
    /// Local side has sent its close
    HalfClosedLocal,
    /// Remote side has sent its close
    HalfClosedRemote,
    /// Both directions closed
    Closed,
}

impl StreamState {
    fn close_local(&mut self) {
        *self = match *self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    fn close_remote(&mut self) {
        *self = match *self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    fn can_recv(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    fn is_closed(self) -> bool {
        self == StreamState::Closed
    }
}

/// Registry entry for one live stream
struct StreamEntry {
    /// Delivers inbound events to the stream's read half
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    /// Byte permits for the stream's write half
    send_window: Arc<Semaphore>,
    /// Bytes the peer may still send before waiting for a window update
    recv_window: u32,
    state: StreamState,
}

/// State shared by the session handle, the reader/writer tasks and all
/// stream handles.
pub(crate) struct Shared {
    streams: Mutex<HashMap<u32, StreamEntry>>,
    frame_tx: mpsc::Sender<Frame>,
    next_stream_id: AtomicU32,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Credit the peer's send window and notify it. Called from a stream's
    /// read half as it consumes buffered data.
    pub(crate) async fn replenish_window(&self, id: u32, increment: u32) {
        {
            let mut streams = self.streams.lock().unwrap();
            match streams.get_mut(&id) {
                Some(entry) => {
                    entry.recv_window = entry.recv_window.saturating_add(increment);
                }
                None => return,
            }
        }
        let _ = self.frame_tx.send(Frame::window_update(id, increment)).await;
    }

    /// Record a local half-close, dropping the entry once both directions
    /// are closed.
    pub(crate) fn mark_local_closed(&self, id: u32) {
        let mut streams = self.streams.lock().unwrap();
        let fully_closed = match streams.get_mut(&id) {
            Some(entry) => {
                entry.state.close_local();
                entry.state.is_closed()
            }
            None => false,
        };
        if fully_closed {
            if let Some(entry) = streams.remove(&id) {
                entry.send_window.close();
            }
        }
    }

    /// Drop a stream outright, waking any writer blocked on its window
    pub(crate) fn remove_stream(&self, id: u32) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(entry) = streams.remove(&id) {
            entry.send_window.close();
        }
    }

    /// Terminate every stream and wake both loops. Idempotent; safe to
    /// call from the reader, the writer, or the session handle.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let mut streams = self.streams.lock().unwrap();
        for (_, entry) in streams.drain() {
            let _ = entry
                .event_tx
                .send(StreamEvent::Terminated(TunnelError::SessionClosed));
            entry.send_window.close();
        }
    }

    async fn wait_closed(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Register a stream and build its handle. Fails with a session-fatal
/// error on a duplicate id and a stream-fatal one at the stream limit.
fn register_stream(shared: &Arc<Shared>, id: u32, target: String) -> Result<Stream, TunnelError> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let window = Arc::new(Semaphore::new(DEFAULT_WINDOW_SIZE as usize));

    {
        let mut streams = shared.streams.lock().unwrap();
        if shared.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        if streams.contains_key(&id) {
            return Err(TunnelError::MalformedFrame(format!(
                "duplicate stream id {}",
                id
            )));
        }
        if streams.len() >= MAX_STREAMS {
            return Err(TunnelError::ForwardRejected(
                "stream limit reached".to_string(),
            ));
        }
        streams.insert(
            id,
            StreamEntry {
                event_tx,
                send_window: Arc::clone(&window),
                recv_window: DEFAULT_WINDOW_SIZE,
                state: StreamState::Open,
            },
        );
    }

    let reader = StreamReader::new(id, target, event_rx, Arc::clone(shared));
    let writer = StreamWriter::new(id, shared.frame_tx.clone(), window, Arc::clone(shared));
    Ok(Stream::new(reader, writer))
}

/// Handle to an established session. Cheap to clone; all clones drive the
/// same underlying transport.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Take exclusive ownership of a transport's read/write halves and
    /// spawn the session's reader and writer tasks.
    ///
    /// `policy` governs which targets the peer may open streams toward.
    pub fn start<R, W>(
        read_half: R,
        write_half: W,
        side: Side,
        policy: AdmissionPolicy,
    ) -> (Session, IncomingStreams)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            frame_tx,
            next_stream_id: AtomicU32::new(match side {
                Side::Client => 1,
                Side::Server => 2,
            }),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });

        tokio::spawn(run_reader(
            read_half,
            Arc::clone(&shared),
            incoming_tx,
            policy,
        ));
        tokio::spawn(run_writer(write_half, frame_rx, Arc::clone(&shared)));

        (
            Session { shared },
            IncomingStreams { rx: incoming_rx },
        )
    }

    /// Open a locally-initiated stream toward `target`.
    pub async fn open(&self, target: &str) -> Result<Stream, TunnelError> {
        if self.shared.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = register_stream(&self.shared, id, target.to_string())?;
        if self
            .shared
            .frame_tx
            .send(Frame::open(id, target))
            .await
            .is_err()
        {
            self.shared.remove_stream(id);
            return Err(TunnelError::SessionClosed);
        }
        debug!("opened stream {} to {}", id, target);
        Ok(stream)
    }

    /// Deliberately tear the session down. Every open stream observes a
    /// terminal error and both loops stop.
    pub fn close(&self) {
        self.shared.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().unwrap().len()
    }

    /// Resolves once the session has been torn down
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }
}

/// Remotely-initiated streams accepted by the session reader
pub struct IncomingStreams {
    rx: mpsc::Receiver<Stream>,
}

impl IncomingStreams {
    /// Next accepted stream, or `None` once the session is down
    pub async fn next(&mut self) -> Option<Stream> {
        self.rx.recv().await
    }
}

async fn run_reader<R>(
    mut read_half: R,
    shared: Arc<Shared>,
    incoming_tx: mpsc::Sender<Stream>,
    policy: AdmissionPolicy,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    match read_loop(&mut read_half, &shared, &incoming_tx, &policy).await {
        Ok(()) => debug!("transport closed"),
        Err(e) => warn!("session reader failed: {}", e),
    }
    shared.teardown();
}

async fn read_loop<R>(
    read_half: &mut R,
    shared: &Arc<Shared>,
    incoming_tx: &mpsc::Sender<Stream>,
    policy: &AdmissionPolicy,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        while let Some(frame) = Frame::decode(&mut buf)? {
            handle_frame(frame, shared, incoming_tx, policy).await?;
        }

        tokio::select! {
            read = read_half.read_buf(&mut buf) => {
                if read? == 0 {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    return Err(TunnelError::MalformedFrame(
                        "transport closed mid-frame".to_string(),
                    ));
                }
            }
            _ = shared.wait_closed() => return Ok(()),
        }
    }
}

async fn handle_frame(
    frame: Frame,
    shared: &Arc<Shared>,
    incoming_tx: &mpsc::Sender<Stream>,
    policy: &AdmissionPolicy,
) -> Result<(), TunnelError> {
    trace!(
        "received frame type {:?} stream {} ({} bytes)",
        frame.frame_type,
        frame.stream_id,
        frame.payload.len()
    );

    match frame.frame_type {
        FrameType::Open => handle_open(frame, shared, incoming_tx, policy).await,
        FrameType::Data => handle_data(frame, shared).await,
        FrameType::WindowUpdate => {
            let increment = frame.window_increment() as usize;
            let streams = shared.streams.lock().unwrap();
            if let Some(entry) = streams.get(&frame.stream_id) {
                if entry.send_window.available_permits() + increment > MAX_WINDOW_CREDIT {
                    return Err(TunnelError::FlowControl);
                }
                entry.send_window.add_permits(increment);
            }
            Ok(())
        }
        FrameType::Close => handle_close(frame, shared),
    }
}

async fn handle_open(
    frame: Frame,
    shared: &Arc<Shared>,
    incoming_tx: &mpsc::Sender<Stream>,
    policy: &AdmissionPolicy,
) -> Result<(), TunnelError> {
    let id = frame.stream_id;
    let target = std::str::from_utf8(&frame.payload)
        .map_err(|_| TunnelError::MalformedFrame("open target is not UTF-8".to_string()))?
        .to_string();

    if !policy.allows(&target) {
        warn!("refused stream {}: no rule authorizes target {}", id, target);
        let reason = CloseReason::ForwardRejected(format!("no rule authorizes {}", target));
        let _ = shared
            .frame_tx
            .send(Frame::close_with_reason(id, &reason))
            .await;
        return Ok(());
    }

    let stream = match register_stream(shared, id, target.clone()) {
        Ok(stream) => stream,
        // Duplicate ids break the registry invariant; only terminating
        // the transport is safe
        Err(e @ TunnelError::MalformedFrame(_)) => return Err(e),
        Err(TunnelError::SessionClosed) => return Ok(()),
        Err(e) => {
            warn!("refused stream {} to {}: {}", id, target, e);
            let reason = CloseReason::ForwardRejected(e.to_string());
            let _ = shared
                .frame_tx
                .send(Frame::close_with_reason(id, &reason))
                .await;
            return Ok(());
        }
    };

    debug!("accepted stream {} to {}", id, target);
    if incoming_tx.send(stream).await.is_err() {
        shared.remove_stream(id);
        let reason = CloseReason::ForwardRejected("not accepting streams".to_string());
        let _ = shared
            .frame_tx
            .send(Frame::close_with_reason(id, &reason))
            .await;
    }
    Ok(())
}

async fn handle_data(frame: Frame, shared: &Arc<Shared>) -> Result<(), TunnelError> {
    let id = frame.stream_id;
    let event_tx = {
        let mut streams = shared.streams.lock().unwrap();
        match streams.get_mut(&id) {
            Some(entry) => {
                if !entry.state.can_recv() {
                    return Err(TunnelError::MalformedFrame(format!(
                        "data on stream {} after close",
                        id
                    )));
                }
                let len = frame.payload.len() as u32;
                if len > entry.recv_window {
                    return Err(TunnelError::FlowControl);
                }
                entry.recv_window -= len;
                Some(entry.event_tx.clone())
            }
            None => {
                // In-flight data for a stream we already dropped
                trace!("discarding data for unknown stream {}", id);
                None
            }
        }
    };

    if let Some(event_tx) = event_tx {
        if event_tx.send(StreamEvent::Data(frame.payload)).is_err() {
            // Consumer abandoned the stream without closing it
            debug!("stream {} receiver dropped, closing", id);
            shared.remove_stream(id);
            let _ = shared.frame_tx.send(Frame::close(id)).await;
        }
    }
    Ok(())
}

fn handle_close(frame: Frame, shared: &Arc<Shared>) -> Result<(), TunnelError> {
    let id = frame.stream_id;
    match CloseReason::from_payload(&frame.payload)? {
        Some(reason) => {
            debug!("stream {} failed on peer: {}", id, reason.clone().into_error());
            let mut streams = shared.streams.lock().unwrap();
            if let Some(entry) = streams.remove(&id) {
                let _ = entry
                    .event_tx
                    .send(StreamEvent::Terminated(reason.into_error()));
                entry.send_window.close();
            }
        }
        None => {
            let mut streams = shared.streams.lock().unwrap();
            let fully_closed = match streams.get_mut(&id) {
                Some(entry) => {
                    entry.state.close_remote();
                    let _ = entry.event_tx.send(StreamEvent::RemoteClose);
                    entry.state.is_closed()
                }
                None => false,
            };
            if fully_closed {
                if let Some(entry) = streams.remove(&id) {
                    entry.send_window.close();
                }
            }
        }
    }
    Ok(())
}

async fn run_writer<W>(write_half: W, mut frame_rx: mpsc::Receiver<Frame>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = BufWriter::new(write_half);

    let result: Result<(), TunnelError> = async {
        loop {
            tokio::select! {
                _ = shared.wait_closed() => return Ok(()),
                maybe = frame_rx.recv() => {
                    let Some(frame) = maybe else { return Ok(()) };
                    write_frame(&mut writer, &frame).await?;
                    // Drain whatever else is queued before paying for a flush
                    while let Ok(next) = frame_rx.try_recv() {
                        write_frame(&mut writer, &next).await?;
                    }
                    writer.flush().await?;
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        warn!("session writer failed: {}", e);
    }
    shared.teardown();
    let _ = writer.shutdown().await;
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    trace!(
        "sent frame type {:?} stream {} ({} bytes)",
        frame.frame_type,
        frame.stream_id,
        frame.payload.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn session_pair(
        server_policy: AdmissionPolicy,
        client_policy: AdmissionPolicy,
    ) -> (
        (Session, IncomingStreams),
        (Session, IncomingStreams),
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let client = Session::start(ar, aw, Side::Client, client_policy);
        let server = Session::start(br, bw, Side::Server, server_policy);
        (client, server)
    }

    fn allow(target: &str) -> AdmissionPolicy {
        AdmissionPolicy::new([target.to_string()])
    }

    #[tokio::test]
    async fn test_open_and_transfer() {
        let ((client, _ci), (_server, mut si)) =
            session_pair(allow("127.0.0.1:3000"), AdmissionPolicy::deny_all());

        let mut out = client.open("127.0.0.1:3000").await.unwrap();
        assert_eq!(out.id(), 1);

        let mut inc = si.next().await.unwrap();
        assert_eq!(inc.target(), "127.0.0.1:3000");

        out.write(b"hello").await.unwrap();
        assert_eq!(&inc.read().await.unwrap().unwrap()[..], b"hello");

        inc.write(b"world").await.unwrap();
        assert_eq!(&out.read().await.unwrap().unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn test_stream_ids_are_unique_per_side() {
        let ((client, _ci), (server, _si)) =
            session_pair(allow("t:1"), allow("t:1"));

        let a = client.open("t:1").await.unwrap();
        let b = client.open("t:1").await.unwrap();
        let c = server.open("t:1").await.unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 3);
        assert_eq!(c.id(), 2);
    }

    #[tokio::test]
    async fn test_half_close_propagates_eof() {
        let ((client, _ci), (_server, mut si)) =
            session_pair(allow("echo:1"), AdmissionPolicy::deny_all());

        let mut out = client.open("echo:1").await.unwrap();
        let mut inc = si.next().await.unwrap();

        out.write(b"last words").await.unwrap();
        out.close().await;

        assert_eq!(&inc.read().await.unwrap().unwrap()[..], b"last words");
        assert!(inc.read().await.unwrap().is_none());

        // The other direction still flows after the half-close
        inc.write(b"reply").await.unwrap();
        assert_eq!(&out.read().await.unwrap().unwrap()[..], b"reply");
        inc.close().await;
        assert!(out.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_open_rejected() {
        let ((client, _ci), (_server, _si)) =
            session_pair(AdmissionPolicy::deny_all(), AdmissionPolicy::deny_all());

        let mut stream = client.open("10.0.0.1:80").await.unwrap();
        match stream.read().await {
            Err(TunnelError::ForwardRejected(_)) => {}
            other => panic!("expected ForwardRejected, got {:?}", other.map(|b| b.map(|b| b.len()))),
        }
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_session_close_unblocks_streams() {
        let ((client, _ci), (server, mut si)) =
            session_pair(allow("echo:1"), AdmissionPolicy::deny_all());

        let mut out = client.open("echo:1").await.unwrap();
        let _inc = si.next().await.unwrap();

        server.close();

        match out.read().await {
            Err(TunnelError::SessionClosed) => {}
            other => panic!("expected SessionClosed, got {:?}", other.map(|b| b.map(|b| b.len()))),
        }
        client.closed().await;
        assert!(matches!(
            out.write(b"x").await,
            Err(TunnelError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_blocks_on_window_exhaustion() {
        let ((client, _ci), (_server, mut si)) =
            session_pair(allow("sink:1"), AdmissionPolicy::deny_all());

        let mut out = client.open("sink:1").await.unwrap();
        let mut inc = si.next().await.unwrap();

        // Fill the whole advertised window while the consumer is idle
        let payload = vec![0xAB; DEFAULT_WINDOW_SIZE as usize];
        out.write(&payload).await.unwrap();

        // One more byte must suspend until the consumer drains
        let blocked = timeout(Duration::from_millis(200), out.write(b"x")).await;
        assert!(blocked.is_err(), "write exceeded the advertised window");

        // Draining half the window triggers an update and unblocks the writer
        let mut drained = 0usize;
        while drained < DEFAULT_WINDOW_SIZE as usize / 2 {
            drained += inc.read().await.unwrap().unwrap().len();
        }
        timeout(Duration::from_secs(2), out.write(b"x"))
            .await
            .expect("window update never arrived")
            .unwrap();
    }
}
