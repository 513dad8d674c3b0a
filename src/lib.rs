//! Git-aware gateway in front of a GitLab-style backend.
//!
//! Requests are matched against a fixed route table. Git smart-HTTP and
//! archive downloads are authorized by the backend and then served by the
//! gateway itself (local git or a remote RPC server); everything else is
//! reverse-proxied.

pub mod api;
pub mod archive;
pub mod config;
pub mod geo;
pub mod git;
pub mod http;
pub mod io;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod routing;

pub use config::GatewayConfig;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
