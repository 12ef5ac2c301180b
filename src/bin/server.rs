//! Switchyard relay server
//!
//! Accepts tunnel endpoints from non-loopback origins and interactive
//! operator sessions from loopback, and splices them on demand.

use anyhow::{Context, Result};
use clap::Parser;
use switchyard::{Config, Server};

/// Switchyard - rendezvous relay for ad-hoc reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "switchyard-server")]
#[command(about = "Switchyard - rendezvous relay for ad-hoc reverse tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    let filter = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = Server::bind(&config.server)
        .await
        .context("Failed to bind to address")?;
    server.run().await.context("Server terminated")?;

    Ok(())
}
