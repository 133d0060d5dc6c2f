//! Rendezvous relay daemon
//!
//! WebSocket relay that lets a host and its clients exchange binary frames
//! through a short session code.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (port 8080, 4-letter codes, 60s idle TTL)
//! relayd
//!
//! # Config file plus overrides
//! relayd --config /etc/relay/config.toml --port 9000 --join-order fifo
//!
//! # Print the effective configuration and exit
//! relayd --print-config
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relay_core::{Config, JoinOrder};
use relay_server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "relayd")]
#[command(about = "Rendezvous relay for hosts and clients behind NAT")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "RELAY_BIND")]
    bind: Option<IpAddr>,

    /// Path prefix for all routes (e.g. /relay)
    #[arg(long, env = "RELAY_ROUTE_PREFIX")]
    route_prefix: Option<String>,

    /// Letters per session code
    #[arg(long, env = "RELAY_CODE_LENGTH")]
    code_length: Option<usize>,

    /// Idle seconds before a session is closed
    #[arg(long, env = "RELAY_TTL")]
    ttl: Option<u64>,

    /// Seconds between sweeps for expired sessions
    #[arg(long, env = "RELAY_SWEEP_INTERVAL")]
    sweep_interval: Option<u64>,

    /// Which waiting client gets the next id (lifo or fifo)
    #[arg(long, env = "RELAY_JOIN_ORDER")]
    join_order: Option<JoinOrder>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn into_config(self) -> Result<(Config, bool), Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(prefix) = self.route_prefix {
            config.server.route_prefix = prefix;
        }
        if let Some(length) = self.code_length {
            config.session.code_length = length;
        }
        if let Some(ttl) = self.ttl {
            config.session.ttl_secs = ttl;
        }
        if let Some(interval) = self.sweep_interval {
            config.session.sweep_interval_secs = interval;
        }
        if let Some(order) = self.join_order {
            config.session.join_order = order;
        }

        config.validate()?;
        Ok((config, self.print_config))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let (config, print_config) = Args::parse().into_config()?;

    if print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting relay server");
    info!(
        "Sessions: {}-letter codes, {}s idle TTL, sweep every {}s, {:?} join order",
        config.session.code_length,
        config.session.ttl_secs,
        config.session.sweep_interval_secs,
        config.session.join_order
    );

    let server = RelayServer::new(config).start().await?;
    info!("Listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await;

    Ok(())
}
