//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (axum, middleware)
//!     → request.rs (request id assigned or kept)
//!     → routing::Dispatcher
//!     → response.rs (error responses, cache headers)
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{GatewayServer, ServerError};
