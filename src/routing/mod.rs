//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request
//!     → prefix.rs (clean path, enforce and strip the URL prefix)
//!     → router.rs (Geo table first, then main table)
//!     → matcher.rs (path regex, method, upgrade header)
//!     → Handler::call
//!
//! Route compilation (at startup, and per Geo change):
//!     routes.rs → RouteTable (immutable)
//! ```
//!
//! # Design Decisions
//! - Route set compiled in, not configurable
//! - Tables are immutable snapshots; replacement is an atomic swap
//! - First match wins

pub mod matcher;
pub mod prefix;
pub mod router;
pub mod routes;

pub use prefix::UrlPrefix;
pub use router::{Dispatcher, Handler, HandlerFn, Route, RouteTable};
pub use routes::{RouteContext, RouteError};
