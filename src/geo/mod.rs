//! Geo secondary support.
//!
//! # Data Flow
//! ```text
//! every poll_interval:
//!     GET <backend>/api/v4/geo/proxy
//!     → changed? → RouteContext::geo_table → Dispatcher::replace_geo_routes
//! ```

pub mod poller;

pub use poller::{GeoError, GeoPoller};
