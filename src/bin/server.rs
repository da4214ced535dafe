//! Gimlet Server
//!
//! Accepts tunnel clients on a single listen port:
//! - Validates credentials against a file-backed store
//! - Activates the forwarding specs each client is permitted
//! - Dials targets for client streams, binds listeners for reverse rules

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use gimlet::{
    auth::CredentialStore,
    config::{Config, ServerConfig},
    server::TunnelServer,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Gimlet Server - multiplexed TCP tunneling
#[derive(Parser, Debug)]
#[command(name = "gimlet-server")]
#[command(about = "Gimlet Server - multiplexed TCP tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen port, keeping the configured host
    #[arg(short, long)]
    port: Option<u16>,

    /// Credential store file (username:secret[:allowed,...] per line)
    #[arg(short, long)]
    auth_file: Option<String>,

    /// TLS private key path (PEM); requires --cert
    #[arg(long)]
    key: Option<String>,

    /// TLS certificate path (PEM); requires --key
    #[arg(long)]
    cert: Option<String>,

    /// Maximum concurrent client connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    // Load configuration, flags override file values
    let mut server_config = match &args.config {
        Some(path) => Config::load(path)
            .context("Failed to load configuration")?
            .server
            .ok_or_else(|| anyhow!("No [server] section in config file"))?,
        None => ServerConfig::default(),
    };

    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(port) = args.port {
        let host = server_config
            .listen
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        server_config.listen = format!("{}:{}", host, port);
    }
    if args.auth_file.is_some() {
        server_config.auth_file = args.auth_file;
    }
    if args.key.is_some() {
        server_config.tls_key = args.key;
    }
    if args.cert.is_some() {
        server_config.tls_cert = args.cert;
    }
    if let Some(max) = args.max_connections {
        server_config.max_connections = max;
    }

    // Load the credential store
    let store = match &server_config.auth_file {
        Some(path) => {
            let store = CredentialStore::load(path)
                .with_context(|| format!("Failed to load credential store {}", path))?;
            info!("Loaded {} credential(s) from {}", store.len(), path);
            store
        }
        None => {
            warn!("No credential store configured - all clients will be rejected");
            CredentialStore::empty()
        }
    };

    // Build TLS acceptor if cert/key are configured
    let tls_acceptor = match (&server_config.tls_cert, &server_config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path).context("Failed to load TLS certificate")?;
            let key = load_private_key(key_path).context("Failed to load TLS private key")?;

            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("Failed to build TLS server config")?;

            info!("TLS enabled with cert: {}", cert_path);
            Some(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config)))
        }
        (None, None) => {
            info!("TLS disabled (no --cert/--key configured)");
            None
        }
        _ => {
            return Err(anyhow!("--cert and --key must be given together"));
        }
    };

    info!("Gimlet Server v{}", gimlet::VERSION);
    info!("Listening on {}", server_config.listen);

    let listener = TcpListener::bind(&server_config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", server_config.listen))?;

    let server = TunnelServer::new(store, server_config.max_connections);

    tokio::select! {
        result = server.serve(listener, tls_acceptor) => {
            result.context("Server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Load TLS certificate chain from PEM file
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).with_context(|| format!("Failed to open cert file: {}", path))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse PEM certificates")?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).with_context(|| format!("Failed to open key file: {}", path))?,
    );
    rustls_pemfile::private_key(&mut file)
        .context("Failed to parse PEM private key")?
        .ok_or_else(|| anyhow!("No private key found in {}", path))
}
