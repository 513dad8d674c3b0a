//! Backend forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! Route handler
//!     → reverse.rs (copy request, stamp headers)
//!     → transport.rs (TCP or Unix socket round trip, header timeout)
//!     → backend response streamed back
//!     ↳ on connection failure: synthesized 502 "GitLab is not responding"
//! ```
//!
//! # Design Decisions
//! - Transports never return errors to callers; failures become 502s
//! - One transport per target, shared through `TransportCache`
//! - No retries: clients retry at a higher layer

pub mod reverse;
pub mod transport;

pub use reverse::ReverseProxy;
pub use transport::{BackendTarget, BackendTransport, TransportCache, TransportError, NOT_RESPONDING};
