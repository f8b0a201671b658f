//! Burrow agent binary

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig, SessionEnd};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Burrow tunnel agent - connects out to the server and carries tunnels
#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(about = "Burrow tunnel agent")]
#[command(version)]
struct Args {
    /// Server address (host:port)
    #[arg(long, env = "BURROW_SERVER")]
    server: String,

    /// Pre-shared bearer token for this agent
    #[arg(long, env = "BURROW_TOKEN")]
    token: String,

    /// Skip certificate verification (self-signed server deployments)
    #[arg(long)]
    insecure: bool,

    /// Seconds to wait between reconnect attempts
    #[arg(long, default_value = "5")]
    retry_period: u64,

    /// Give up after this many failed attempts (0 = retry forever)
    #[arg(long, default_value = "0")]
    retry_count: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
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

    let agent = Agent::new(AgentConfig {
        server_addr: args.server.clone(),
        token: args.token.clone(),
        insecure: args.insecure,
    });

    info!(server = %args.server, "burrow agent starting");

    let mut failures = 0u32;
    loop {
        match agent.run().await {
            Ok(SessionEnd::Disconnected) => {
                info!("disconnected by server, exiting");
                return Ok(());
            }
            Err(e) => {
                failures += 1;
                error!(error = %e, attempt = failures, "session ended");

                if args.retry_count != 0 && failures >= args.retry_count {
                    anyhow::bail!("giving up after {} attempts", failures);
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(args.retry_period)).await;
    }
}
