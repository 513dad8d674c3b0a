//! git-gateway
//!
//! A Git-aware gateway that sits in front of a GitLab-style backend.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ http::server ──▶ routing::Dispatcher
//!                                   │
//!                  ┌────────────────┼─────────────────────┐
//!                  ▼                ▼                     ▼
//!            api::Gate         api::Gate            proxy::ReverseProxy ──▶ Backend
//!                  │                │
//!                  ▼                ▼
//!         git (info/refs,     archive (cache,
//!          upload/receive)     git archive)
//!                  │
//!       ┌──────────┴──────────┐
//!       ▼                     ▼
//!   local git            remote RPC server
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use git_gateway::config::{load_config_with, ConfigOverrides};
use git_gateway::lifecycle::signals::spawn_signal_handler;
use git_gateway::observability::{logging, metrics};
use git_gateway::{GatewayServer, Shutdown};

#[derive(Parser)]
#[command(name = "git-gateway")]
#[command(about = "Git-aware gateway for a GitLab-style backend", long_about = None)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the backend URL from the configuration.
    #[arg(short, long)]
    backend: Option<String>,

    /// Report raw backend errors in 502 responses.
    #[arg(long)]
    development: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        bind_address: cli.listen,
        backend_url: cli.backend,
        development_mode: cli.development,
    };
    let config = load_config_with(cli.config.as_deref(), &overrides)?;

    logging::init_logging(&config.observability);
    tracing::info!(version = %config.version, "git-gateway starting");

    tracing::info!(
        bind_address = %config.listener.bind_address,
        backend = %config.backend.url,
        archive_cache = %config.archive.cache_root.display(),
        geo_enabled = config.geo.enabled,
        development_mode = config.development_mode,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_handler(shutdown.clone());

    let server = GatewayServer::new(config)?;
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
