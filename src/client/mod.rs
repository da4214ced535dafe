//! Tunnel client
//!
//! Connects out to the server, authenticates, activates the configured
//! forwarding specs and supervises the session. On transport loss the
//! client walks `Disconnected -> Connecting -> Connected` again with
//! exponential backoff; local listeners survive reconnects, and
//! connections accepted while disconnected are rejected rather than
//! queued.

use crate::forward::{self, ForwardSpec};
use crate::protocol::{
    self, HandshakeError, HandshakeRequest, HandshakeResponse, ProtocolError, PROTOCOL_VERSION,
};
use crate::tunnel::{AdmissionPolicy, IncomingStreams, Session, Side};
use crate::Error;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

/// First reconnect delay after a transport loss
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on the reconnect delay
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Client-side TLS setup
pub enum ClientTls {
    Disabled,
    Enabled {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl ClientTls {
    /// Trust the CA bundle at `ca_path` and verify the server as
    /// `server_name`.
    pub fn from_ca_file(ca_path: &str, server_name: &str) -> crate::Result<Self> {
        let file = std::fs::File::open(ca_path)
            .map_err(|e| Error::Config(format!("Failed to open CA file {}: {}", ca_path, e)))?;
        let mut reader = std::io::BufReader::new(file);

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert
                .map_err(|e| Error::Config(format!("Failed to parse CA file {}: {}", ca_path, e)))?;
            roots
                .add(cert)
                .map_err(|e| Error::Config(format!("Rejected CA certificate: {}", e)))?;
        }
        if roots.is_empty() {
            return Err(Error::Config(format!("No certificates found in {}", ca_path)));
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Config(format!("Invalid TLS server name '{}': {}", server_name, e)))?;

        Ok(ClientTls::Enabled {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// Tunnel client: configuration plus the reconnect supervisor
pub struct TunnelClient {
    server_addr: String,
    username: String,
    secret: String,
    specs: Vec<ForwardSpec>,
    tls: ClientTls,
}

impl TunnelClient {
    pub fn new(
        server_addr: String,
        username: String,
        secret: String,
        specs: Vec<ForwardSpec>,
        tls: ClientTls,
    ) -> Self {
        Self {
            server_addr,
            username,
            secret,
            specs,
            tls,
        }
    }

    /// Run until a handshake-level rejection. Transport losses reconnect
    /// with exponential backoff; `AuthFailed` and `VersionMismatch` are
    /// terminal.
    pub async fn run(self) -> crate::Result<()> {
        let (session_tx, _) = watch::channel(None::<Session>);
        let mut listeners_started = false;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            info!("connecting to {}", self.server_addr);
            match self.connect_once().await {
                Ok((session, mut incoming, accepted)) => {
                    info!(
                        "session established, {} forwarding spec(s) active",
                        accepted.len()
                    );
                    backoff = INITIAL_BACKOFF;

                    // Listeners are bound once and survive reconnects
                    if !listeners_started {
                        self.start_listeners(&accepted, &session_tx).await?;
                        listeners_started = true;
                    }
                    session_tx.send_replace(Some(session.clone()));

                    // Reverse forwards: server-initiated streams dial a
                    // local target
                    tokio::spawn(async move {
                        while let Some(stream) = incoming.next().await {
                            tokio::spawn(forward::serve_stream(stream));
                        }
                    });

                    session.closed().await;
                    session_tx.send_replace(None);
                    warn!("connection to server lost");
                }
                Err(e) if is_handshake_rejection(&e) => {
                    error!("server rejected handshake: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("connection attempt failed: {}", e);
                }
            }

            info!("reconnecting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Dial, optionally wrap in TLS, and perform the handshake
    pub async fn connect_once(
        &self,
    ) -> crate::Result<(Session, IncomingStreams, Vec<ForwardSpec>)> {
        let tcp = TcpStream::connect(&self.server_addr).await?;
        tcp.set_nodelay(true)?;

        match &self.tls {
            ClientTls::Disabled => {
                let (read_half, write_half) = tcp.into_split();
                self.establish(read_half, write_half).await
            }
            ClientTls::Enabled {
                connector,
                server_name,
            } => {
                let tls = connector.connect(server_name.clone(), tcp).await?;
                let (read_half, write_half) = tokio::io::split(tls);
                self.establish(read_half, write_half).await
            }
        }
    }

    async fn establish<R, W>(
        &self,
        mut read_half: R,
        mut write_half: W,
    ) -> crate::Result<(Session, IncomingStreams, Vec<ForwardSpec>)>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let request = HandshakeRequest {
            version: PROTOCOL_VERSION,
            username: self.username.clone(),
            secret: self.secret.clone(),
            specs: self.specs.iter().map(|s| s.to_string()).collect(),
        };
        protocol::write_message(&mut write_half, &request).await?;

        let response: HandshakeResponse = protocol::read_message(&mut read_half).await?;
        if !response.accepted {
            let error = response
                .error
                .unwrap_or(HandshakeError::Other("no reason given".to_string()));
            return Err(Error::Protocol(error.into_protocol_error()));
        }

        let mut accepted = Vec::new();
        for (spec, decision) in self.specs.iter().zip(&response.specs) {
            if decision.accepted {
                debug!("spec {} accepted", spec);
                accepted.push(spec.clone());
            } else {
                warn!(
                    "server rejected spec {}: {}",
                    spec,
                    decision.reason.as_deref().unwrap_or("no reason given")
                );
            }
        }
        if accepted.is_empty() {
            warn!("no forwarding specs were accepted");
        }

        // The server may only open streams toward our accepted reverse
        // targets
        let reverse_targets = accepted
            .iter()
            .filter(|s| s.reverse)
            .map(|s| s.target());
        let (session, incoming) = Session::start(
            read_half,
            write_half,
            Side::Client,
            AdmissionPolicy::new(reverse_targets),
        );
        Ok((session, incoming, accepted))
    }

    async fn start_listeners(
        &self,
        accepted: &[ForwardSpec],
        session_tx: &watch::Sender<Option<Session>>,
    ) -> crate::Result<()> {
        for spec in accepted.iter().filter(|s| !s.reverse) {
            let listener = TcpListener::bind(spec.bind_addr()).await.map_err(|e| {
                error!("failed to bind {}: {}", spec.bind_addr(), e);
                Error::Io(e)
            })?;
            info!("listening on {} for {}", spec.bind_addr(), spec.target());
            tokio::spawn(run_local_listener(
                listener,
                spec.target(),
                session_tx.subscribe(),
            ));
        }
        Ok(())
    }
}

fn is_handshake_rejection(error: &Error) -> bool {
    matches!(
        error,
        Error::Protocol(
            ProtocolError::AuthFailed
                | ProtocolError::VersionMismatch { .. }
                | ProtocolError::Rejected(_)
        )
    )
}

/// Accept loop for one forward-out rule. Looks up the current session at
/// accept time; while disconnected, connections are rejected immediately
/// instead of queued.
async fn run_local_listener(
    listener: TcpListener,
    target: String,
    session_rx: watch::Receiver<Option<Session>>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let session = session_rx.borrow().clone();
                match session {
                    Some(session) if !session.is_closed() => {
                        let _ = socket.set_nodelay(true);
                        let target = target.clone();
                        tokio::spawn(async move {
                            match session.open(&target).await {
                                Ok(stream) => {
                                    debug!("forwarding {} to {}", peer, target);
                                    forward::pipe(stream, socket).await;
                                }
                                Err(e) => {
                                    warn!("failed to open stream for {}: {}", peer, e);
                                }
                            }
                        });
                    }
                    _ => {
                        info!("tunnel unavailable, rejecting connection from {}", peer);
                    }
                }
            }
            Err(e) => warn!("accept error for {}: {}", target, e),
        }
    }
}
