//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// The monolith that authorizes requests and receives proxied traffic.
    pub backend: BackendConfig,

    /// Git subprocess settings.
    pub git: GitConfig,

    /// Archive cache settings.
    pub archive: ArchiveConfig,

    /// Geo secondary proxy discovery.
    pub geo: GeoConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Report raw transport errors in 502 bodies.
    pub development_mode: bool,

    /// Version stamped on every request sent to the backend.
    pub version: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            backend: BackendConfig::default(),
            git: GitConfig::default(),
            archive: ArchiveConfig::default(),
            geo: GeoConfig::default(),
            observability: ObservabilityConfig::default(),
            development_mode: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8181").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8181".to_string(),
        }
    }
}

/// Backend (monolith) connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend base URL. Its path is the relative URL root served by the gateway.
    pub url: String,

    /// Unix socket to dial instead of the URL's host.
    pub socket: Option<PathBuf>,

    /// Backend for the websocket cable route (defaults to `url`).
    pub cable_url: Option<String>,

    /// Unix socket for the cable backend (defaults to `socket`).
    pub cable_socket: Option<PathBuf>,

    /// How long to wait for response headers from the backend.
    pub proxy_headers_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            socket: None,
            cable_url: None,
            cable_socket: None,
            proxy_headers_timeout_secs: 300,
        }
    }
}

impl BackendConfig {
    pub fn parsed_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.url)
    }

    pub fn parsed_cable_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(self.cable_url.as_deref().unwrap_or(&self.url))
    }

    pub fn cable_socket(&self) -> Option<PathBuf> {
        self.cable_socket.clone().or_else(|| self.socket.clone())
    }

    pub fn headers_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_headers_timeout_secs)
    }
}

/// Local git binaries used when no RPC server is configured.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitConfig {
    /// The git executable.
    pub binary: PathBuf,

    /// Compressor for `tar.gz` archives.
    pub gzip_binary: PathBuf,

    /// Compressor for `tar.bz2` archives.
    pub bzip2_binary: PathBuf,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            gzip_binary: PathBuf::from("gzip"),
            bzip2_binary: PathBuf::from("bzip2"),
        }
    }
}

/// Archive cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding published archives.
    pub cache_root: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/tmp/git-gateway/archives"),
        }
    }
}

/// Geo proxy discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Poll the backend for a Geo primary to forward to.
    pub enabled: bool,

    /// Polling interval in seconds.
    pub poll_interval_secs: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 10,
        }
    }
}

impl GeoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9229".to_string(),
        }
    }
}
