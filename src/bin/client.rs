//! Gimlet Client
//!
//! Maintains one outbound tunnel connection to the server:
//! - Authenticates and activates the requested forwarding specs
//! - Binds a local listener per forward-out spec
//! - Reconnects with backoff when the transport drops

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use gimlet::{
    client::{ClientTls, TunnelClient},
    config::{ClientConfig, Config},
    forward::ForwardSpec,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Gimlet Client - multiplexed TCP tunneling
#[derive(Parser, Debug)]
#[command(name = "gimlet-client")]
#[command(about = "Gimlet Client - multiplexed TCP tunneling")]
#[command(version)]
struct Args {
    /// Server address, e.g. tunnel.example.com:8022
    server: Option<String>,

    /// Forwarding specs: [R:][bind-host:]bind-port:[target-host:]target-port
    specs: Vec<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Credential as user:secret (overrides config)
    #[arg(long)]
    auth: Option<String>,

    /// CA bundle to trust for TLS; TLS stays disabled without it
    #[arg(long)]
    tls_ca: Option<String>,

    /// Server name for TLS verification (defaults to the server host)
    #[arg(long)]
    tls_sni: Option<String>,

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

    // Load configuration, flags and positionals override file values
    let mut client_config = match &args.config {
        Some(path) => Config::load(path)
            .context("Failed to load configuration")?
            .client
            .ok_or_else(|| anyhow!("No [client] section in config file"))?,
        None => ClientConfig::default(),
    };

    if let Some(server) = args.server {
        client_config.server = server;
    } else if args.config.is_none() {
        return Err(anyhow!("No server address given (argument or config file)"));
    }

    if let Some(auth) = &args.auth {
        let (username, secret) = auth
            .split_once(':')
            .ok_or_else(|| anyhow!("--auth must be user:secret"))?;
        client_config.username = username.to_string();
        client_config.secret = secret.to_string();
    }
    if client_config.username.is_empty() {
        warn!("No credential configured; the server will reject the handshake");
    }

    let raw_specs = if args.specs.is_empty() {
        client_config.specs.clone()
    } else {
        args.specs
    };
    if raw_specs.is_empty() {
        return Err(anyhow!("No forwarding specs given"));
    }
    let specs = raw_specs
        .iter()
        .map(|raw| raw.parse::<ForwardSpec>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Invalid forwarding spec")?;

    // Optional TLS wrapping
    let tls_ca = args.tls_ca.or(client_config.tls_ca.clone());
    let tls = match tls_ca {
        Some(ca_path) => {
            let server_host = client_config
                .server
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| client_config.server.clone());
            let sni = args
                .tls_sni
                .or(client_config.tls_sni.clone())
                .unwrap_or(server_host);
            info!("TLS enabled, verifying server as {}", sni);
            ClientTls::from_ca_file(&ca_path, &sni).context("Failed to set up TLS")?
        }
        None => ClientTls::Disabled,
    };

    info!("Gimlet Client v{}", gimlet::VERSION);
    info!("Server: {}", client_config.server);
    for spec in &specs {
        info!("Spec: {}", spec);
    }

    let client = TunnelClient::new(
        client_config.server,
        client_config.username,
        client_config.secret,
        specs,
        tls,
    );

    tokio::select! {
        result = client.run() => {
            result.context("Tunnel failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
