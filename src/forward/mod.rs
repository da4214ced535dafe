//! Forwarding engine
//!
//! Maps configured forwarding specs to actions: a forward-out rule binds
//! a local listener and opens a stream per accepted connection; a reverse
//! rule (marked `R:`) is bound on the server, with the client dialing the
//! target. Byte copying between a real socket and a stream is symmetric
//! and propagates half-close in both directions.

use crate::tunnel::{
    CloseReason, Session, Stream, StreamReader, StreamWriter, MAX_PAYLOAD_SIZE,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Default bind host when a spec omits one
const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Error raised for an unparseable forwarding spec
#[derive(Debug, Error)]
#[error("Invalid forwarding spec '{spec}': {reason}")]
pub struct SpecParseError {
    pub spec: String,
    pub reason: String,
}

/// One forwarding rule: where to listen and where accepted connections go.
///
/// Textual forms, with loopback defaults filled in:
/// - `bind-host:bind-port:target-host:target-port`
/// - `bind-port:target-host:target-port`
/// - `bind-port:target-port` (target host defaults to loopback)
///
/// A leading `R:` marks the rule reversed: the server binds the listener
/// and the client dials the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub reverse: bool,
    pub bind_host: String,
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardSpec {
    /// Listener address for this rule
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    /// Target address accepted connections are forwarded to
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

impl FromStr for ForwardSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| SpecParseError {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (reverse, rest) = match s.strip_prefix("R:") {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let parse_port = |part: &str| {
            part.parse::<u16>()
                .map_err(|_| err(&format!("'{}' is not a port number", part)))
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let (bind_host, bind_port, target_host, target_port) = match parts.as_slice() {
            [bind_port, target_port] => (
                DEFAULT_BIND_HOST.to_string(),
                parse_port(bind_port)?,
                DEFAULT_BIND_HOST.to_string(),
                parse_port(target_port)?,
            ),
            [bind_port, target_host, target_port] => (
                DEFAULT_BIND_HOST.to_string(),
                parse_port(bind_port)?,
                target_host.to_string(),
                parse_port(target_port)?,
            ),
            [bind_host, bind_port, target_host, target_port] => (
                bind_host.to_string(),
                parse_port(bind_port)?,
                target_host.to_string(),
                parse_port(target_port)?,
            ),
            _ => return Err(err("expected 2 to 4 colon-separated fields")),
        };

        if target_host.is_empty() || bind_host.is_empty() {
            return Err(err("empty host"));
        }

        Ok(ForwardSpec {
            reverse,
            bind_host,
            bind_port,
            target_host,
            target_port,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            write!(f, "R:")?;
        }
        write!(
            f,
            "{}:{}:{}:{}",
            self.bind_host, self.bind_port, self.target_host, self.target_port
        )
    }
}

/// Copy bytes between a stream and a real socket until both directions
/// are done. EOF on the socket closes the stream's outbound half; stream
/// EOF shuts down the socket's write half.
pub async fn pipe<S>(stream: Stream, socket: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = stream.id();
    let (sock_read, sock_write) = tokio::io::split(socket);
    let (tun_read, tun_write) = stream.split();

    let inbound = tokio::spawn(socket_to_stream(sock_read, tun_write));
    let outbound = tokio::spawn(stream_to_socket(tun_read, sock_write));

    let _ = tokio::join!(inbound, outbound);
    debug!("stream {} finished", id);
}

async fn socket_to_stream<R>(mut sock_read: tokio::io::ReadHalf<R>, mut tun_write: StreamWriter)
where
    R: AsyncRead,
{
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
    loop {
        match sock_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tun_write.write(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(_) => break,
        }
    }
    tun_write.close().await;
}

async fn stream_to_socket<W>(mut tun_read: StreamReader, mut sock_write: tokio::io::WriteHalf<W>)
where
    W: AsyncWrite,
{
    loop {
        match tun_read.read().await {
            Ok(Some(data)) => {
                if sock_write.write_all(&data).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = sock_write.shutdown().await;
                return;
            }
            Err(_) => {
                let _ = sock_write.shutdown().await;
                return;
            }
        }
    }
}

/// Serve one remotely-initiated stream: dial its target and relay bytes.
/// A dial failure closes only this stream, carrying the reason back to
/// the peer.
pub async fn serve_stream(stream: Stream) {
    let id = stream.id();
    let target = stream.target().to_string();

    match TcpStream::connect(&target).await {
        Ok(socket) => {
            let _ = socket.set_nodelay(true);
            debug!("stream {} connected to {}", id, target);
            pipe(stream, socket).await;
        }
        Err(e) => {
            warn!("stream {}: dial {} failed: {}", id, target, e);
            stream
                .reject(CloseReason::DialFailed(format!("{}: {}", target, e)))
                .await;
        }
    }
}

/// Accept connections for one rule and open a stream per connection,
/// until the session ends. Accept errors are logged and do not affect
/// forwards already running.
pub async fn run_listener(listener: TcpListener, session: Session, target: String) {
    loop {
        tokio::select! {
            _ = session.closed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let _ = socket.set_nodelay(true);
                        let session = session.clone();
                        let target = target.clone();
                        tokio::spawn(async move {
                            match session.open(&target).await {
                                Ok(stream) => {
                                    debug!("forwarding {} to {}", peer, target);
                                    pipe(stream, socket).await;
                                }
                                Err(e) => {
                                    warn!("failed to open stream for {}: {}", peer, e);
                                }
                            }
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
        }
    }
    info!("listener for {} stopped", target);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_spec() {
        let spec: ForwardSpec = "0.0.0.0:2001:example.com:3000".parse().unwrap();
        assert!(!spec.reverse);
        assert_eq!(spec.bind_addr(), "0.0.0.0:2001");
        assert_eq!(spec.target(), "example.com:3000");
    }

    #[test]
    fn test_parse_short_specs() {
        let spec: ForwardSpec = "2001:3000".parse().unwrap();
        assert_eq!(spec.bind_addr(), "127.0.0.1:2001");
        assert_eq!(spec.target(), "127.0.0.1:3000");

        let spec: ForwardSpec = "2001:files.internal:3000".parse().unwrap();
        assert_eq!(spec.bind_addr(), "127.0.0.1:2001");
        assert_eq!(spec.target(), "files.internal:3000");
    }

    #[test]
    fn test_parse_reverse_spec() {
        let spec: ForwardSpec = "R:9000:127.0.0.1:22".parse().unwrap();
        assert!(spec.reverse);
        assert_eq!(spec.bind_addr(), "127.0.0.1:9000");
        assert_eq!(spec.target(), "127.0.0.1:22");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ForwardSpec>().is_err());
        assert!("2001".parse::<ForwardSpec>().is_err());
        assert!("2001:notaport".parse::<ForwardSpec>().is_err());
        assert!("a:b:c:d:e".parse::<ForwardSpec>().is_err());
        assert!(":2001::3000".parse::<ForwardSpec>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["R:9000:127.0.0.1:22", "0.0.0.0:80:10.1.2.3:8080"] {
            let spec: ForwardSpec = raw.parse().unwrap();
            assert_eq!(spec.to_string(), raw);
            assert_eq!(spec.to_string().parse::<ForwardSpec>().unwrap(), spec);
        }
    }
}
