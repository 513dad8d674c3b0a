//! Backend API subsystem.
//!
//! # Data Flow
//! ```text
//! Protected route
//!     → gate.rs (suffix check)
//!     → client.rs (GET to the backend, same path, forwarded headers)
//!     → authorization.rs (decode JSON record)
//!     → AuthorizedHandler::call(req, Authorized)
//! ```

pub mod authorization;
pub mod client;
pub mod gate;

pub use authorization::{Authorization, GitalyServer, RepositoryLocator};
pub use client::{ApiClient, AuthorizeError, GeoProxyData};
pub use gate::{Authorized, AuthorizedHandler, Gate};
