//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize, apply command-line overrides)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the route table is compiled from it
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_config_with, parse_config, ConfigError, ConfigOverrides};
pub use schema::{
    ArchiveConfig, BackendConfig, GatewayConfig, GeoConfig, GitConfig, ListenerConfig,
    ObservabilityConfig,
};
