//! Burrow server binary

use anyhow::{Context, Result};
use burrow_server::{admin, Server};
use burrow_store::ClientStore;
use burrow_transport_quic::{QuicConfig, QuicListener};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Burrow tunnel server - accepts agent connections and exposes the admin API
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Burrow tunnel server")]
#[command(version)]
struct Args {
    /// Address the agent plane listens on
    #[arg(long, env = "BURROW_AGENT_ADDR", default_value = "0.0.0.0:5555")]
    agent_addr: SocketAddr,

    /// Address the admin API listens on; keep this localhost-scoped or
    /// firewalled, it carries no credentials
    #[arg(long, env = "BURROW_ADMIN_ADDR", default_value = "127.0.0.1:1337")]
    admin_addr: SocketAddr,

    /// TLS certificate for the agent plane (self-signed pair generated
    /// under ~/.burrow when omitted)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key for the agent plane
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Registered-client store path
    #[arg(long, env = "BURROW_STORE")]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_store_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".burrow").join("clients.json"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level)
                .with_context(|| format!("invalid log level: {}", args.log_level))?,
        )
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let store_path = match args.store {
        Some(path) => path,
        None => default_store_path()?,
    };
    let store = Arc::new(ClientStore::load(&store_path).context("failed to load client store")?);

    let quic_config = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => QuicConfig::server_from_files(cert, key),
        _ => QuicConfig::server_self_signed().context("failed to prepare self-signed cert")?,
    };

    let listener = QuicListener::new(args.agent_addr, Arc::new(quic_config))
        .context("failed to bind agent listener")?;

    let server = Server::new(store);

    info!(agent_addr = %args.agent_addr, admin_addr = %args.admin_addr, "burrow server starting");

    let agent_plane = tokio::spawn(server.clone().run_agent_service(listener));
    let admin_plane = tokio::spawn(admin::serve_admin(server, args.admin_addr));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
        result = agent_plane => {
            result.context("agent plane task failed")?;
        }
        result = admin_plane => {
            result.context("admin plane task failed")??;
        }
    }

    Ok(())
}
