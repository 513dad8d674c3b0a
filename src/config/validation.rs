//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, intervals > 0)
//! - Check backend URLs are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration for values the gateway cannot run with.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not a socket address", config.listener.bind_address),
        ));
    }

    check_url(&mut errors, "backend.url", &config.backend.url);
    if let Some(cable) = &config.backend.cable_url {
        check_url(&mut errors, "backend.cable_url", cable);
    }

    if config.backend.proxy_headers_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "backend.proxy_headers_timeout_secs",
            "must be greater than zero",
        ));
    }

    if config.geo.enabled && config.geo.poll_interval_secs == 0 {
        errors.push(ValidationError::new("geo.poll_interval_secs", "must be greater than zero"));
    }

    if config.git.binary.as_os_str().is_empty() {
        errors.push(ValidationError::new("git.binary", "must not be empty"));
    }

    if !config.archive.cache_root.is_absolute() {
        errors.push(ValidationError::new(
            "archive.cache_root",
            format!("{} is not an absolute path", config.archive.cache_root.display()),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(errors: &mut Vec<ValidationError>, field: &'static str, raw: &str) {
    match url::Url::parse(raw) {
        // Backends are reached over plain HTTP (TCP or a Unix socket).
        Ok(url) if url.scheme() == "http" => {}
        Ok(url) => errors.push(ValidationError::new(
            field,
            format!("unsupported scheme {:?}", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new(field, e.to_string())),
    }
}
