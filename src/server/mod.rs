//! Tunnel server
//!
//! Accepts client connections, performs the handshake against the
//! credential store, then serves one session per connection: dialing
//! targets for client-initiated streams and binding listeners for
//! accepted reverse rules. A failed session produces a log line and
//! never affects the others.

use crate::auth::CredentialStore;
use crate::forward::{self, ForwardSpec};
use crate::protocol::{
    self, HandshakeError, HandshakeRequest, HandshakeResponse, ProtocolError, SpecDecision,
    HANDSHAKE_TIMEOUT, PROTOCOL_VERSION,
};
use crate::tunnel::{AdmissionPolicy, Session, Side};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Tunnel server: the credential store plus the accept loop
pub struct TunnelServer {
    store: Arc<CredentialStore>,
    max_connections: usize,
}

impl TunnelServer {
    pub fn new(store: CredentialStore, max_connections: usize) -> Self {
        Self {
            store: Arc::new(store),
            max_connections,
        }
    }

    /// Accept and serve client connections until the listener fails
    /// permanently.
    pub async fn serve(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> crate::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            debug!("new connection from {}", peer);
            let store = Arc::clone(&self.store);
            let tls = tls.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(socket, peer, store, tls).await {
                    warn!("session with {} failed: {}", peer, e);
                }
            });
        }

        Ok(())
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    store: Arc<CredentialStore>,
    tls: Option<TlsAcceptor>,
) -> crate::Result<()> {
    socket.set_nodelay(true)?;

    match tls {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(socket).await?;
            debug!("TLS handshake complete with {}", peer);
            let (read_half, write_half) = tokio::io::split(tls_stream);
            handle_session(read_half, write_half, peer, store).await
        }
        None => {
            let (read_half, write_half) = socket.into_split();
            handle_session(read_half, write_half, peer, store).await
        }
    }
}

/// Handshake and serve one session, generic over the transport halves
async fn handle_session<R, W>(
    mut read_half: R,
    mut write_half: W,
    peer: SocketAddr,
    store: Arc<CredentialStore>,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let request: HandshakeRequest =
        match timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut read_half)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProtocolError::Timeout.into()),
        };

    if request.version != PROTOCOL_VERSION {
        warn!(
            "{}: protocol version mismatch (ours {}, theirs {})",
            peer, PROTOCOL_VERSION, request.version
        );
        let error = HandshakeError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: request.version,
        };
        protocol::write_message(&mut write_half, &HandshakeResponse::rejected(error)).await?;
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: request.version,
        }
        .into());
    }

    if !store.validate(&request.username, &request.secret) {
        warn!("{}: authentication failed for user '{}'", peer, request.username);
        protocol::write_message(
            &mut write_half,
            &HandshakeResponse::rejected(HandshakeError::AuthFailed),
        )
        .await?;
        return Err(ProtocolError::AuthFailed.into());
    }

    // Evaluate each requested spec on its own; a bad spec is reported
    // back without failing the session
    let mut decisions = Vec::with_capacity(request.specs.len());
    let mut accepted_out: Vec<ForwardSpec> = Vec::new();
    let mut reverse_listeners: Vec<(TcpListener, ForwardSpec)> = Vec::new();

    for raw in &request.specs {
        match raw.parse::<ForwardSpec>() {
            Ok(spec) => {
                if !store.authorize(&request.username, &spec) {
                    decisions.push(rejected(raw, "not permitted for this user"));
                } else if spec.reverse {
                    match TcpListener::bind(spec.bind_addr()).await {
                        Ok(listener) => {
                            decisions.push(accepted(raw));
                            reverse_listeners.push((listener, spec));
                        }
                        Err(e) => {
                            decisions.push(rejected(
                                raw,
                                &format!("bind {} failed: {}", spec.bind_addr(), e),
                            ));
                        }
                    }
                } else {
                    decisions.push(accepted(raw));
                    accepted_out.push(spec);
                }
            }
            Err(e) => decisions.push(rejected(raw, &e.to_string())),
        }
    }

    let accepted_count = decisions.iter().filter(|d| d.accepted).count();
    protocol::write_message(
        &mut write_half,
        &HandshakeResponse {
            accepted: true,
            error: None,
            specs: decisions,
        },
    )
    .await?;
    info!(
        "{} authenticated as '{}', {}/{} spec(s) accepted",
        peer,
        request.username,
        accepted_count,
        request.specs.len()
    );

    // The client may only open streams toward targets of its accepted
    // forward-out rules
    let out_targets = accepted_out.iter().map(|s| s.target());
    let (session, mut incoming) = Session::start(
        read_half,
        write_half,
        Side::Server,
        AdmissionPolicy::new(out_targets),
    );

    for (listener, spec) in reverse_listeners {
        info!(
            "{}: reverse listener on {} for {}",
            peer,
            spec.bind_addr(),
            spec.target()
        );
        tokio::spawn(forward::run_listener(
            listener,
            session.clone(),
            spec.target(),
        ));
    }

    while let Some(stream) = incoming.next().await {
        tokio::spawn(forward::serve_stream(stream));
    }

    info!("session with {} ended", peer);
    Ok(())
}

fn accepted(spec: &str) -> SpecDecision {
    SpecDecision {
        spec: spec.to_string(),
        accepted: true,
        reason: None,
    }
}

fn rejected(spec: &str, reason: &str) -> SpecDecision {
    SpecDecision {
        spec: spec.to_string(),
        accepted: false,
        reason: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_message;

    const STORE: &str = "alice:wonderland\nbob:builder:127.0.0.1:3000\n";

    fn peer() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    async fn drive_handshake(request: HandshakeRequest) -> (crate::Result<()>, HandshakeResponse) {
        let store = Arc::new(CredentialStore::parse(STORE).unwrap());
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);

        let session =
            tokio::spawn(async move { handle_session(server_read, server_write, peer(), store).await });

        let (mut client_read, mut client_write) = tokio::io::split(client_io);
        protocol::write_message(&mut client_write, &request).await.unwrap();
        let response: HandshakeResponse = read_message(&mut client_read).await.unwrap();

        // Dropping the client transport ends the session for accepted
        // handshakes
        drop(client_read);
        drop(client_write);

        (session.await.unwrap(), response)
    }

    fn request(username: &str, secret: &str, specs: &[&str]) -> HandshakeRequest {
        HandshakeRequest {
            version: PROTOCOL_VERSION,
            username: username.to_string(),
            secret: secret.to_string(),
            specs: specs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_handshake_accepts_valid_credential() {
        let (result, response) = drive_handshake(request("alice", "wonderland", &["2001:3000"])).await;
        assert!(result.is_ok());
        assert!(response.accepted);
        assert!(response.specs[0].accepted);
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_credential() {
        let (result, response) = drive_handshake(request("alice", "wrong", &["2001:3000"])).await;
        assert!(matches!(
            result,
            Err(crate::Error::Protocol(ProtocolError::AuthFailed))
        ));
        assert!(!response.accepted);
        assert!(matches!(response.error, Some(HandshakeError::AuthFailed)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_version_mismatch() {
        let mut bad = request("alice", "wonderland", &[]);
        bad.version = PROTOCOL_VERSION + 1;
        let (result, response) = drive_handshake(bad).await;
        assert!(matches!(
            result,
            Err(crate::Error::Protocol(ProtocolError::VersionMismatch { .. }))
        ));
        assert!(matches!(
            response.error,
            Some(HandshakeError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_unpermitted_spec_rejected_individually() {
        let (result, response) = drive_handshake(request(
            "bob",
            "builder",
            &["2001:127.0.0.1:3000", "2002:10.0.0.1:9999", "nonsense"],
        ))
        .await;
        assert!(result.is_ok());
        assert!(response.accepted);
        assert!(response.specs[0].accepted);
        assert!(!response.specs[1].accepted);
        assert!(!response.specs[2].accepted);
        assert!(response.specs[2].reason.is_some());
    }
}
