//! Git smart-HTTP bridge.
//!
//! # Data Flow
//! ```text
//! Authorized request
//!     → backend.rs (local subprocess or remote RPC, from the record)
//!     → info_refs.rs: pktline preamble + advertisement stream
//!     → exchange.rs: body → backend, backend → response (session.rs)
//!
//! Remote RPC:
//!     rpc.rs (SmartHttpClient trait) ← gitaly.rs (tonic client + pool)
//! ```

pub mod backend;
pub mod command;
pub mod exchange;
pub mod gitaly;
pub mod info_refs;
pub mod pktline;
pub mod rpc;
pub mod session;
pub mod verb;

pub use backend::{BackendSelector, PackBackend};
pub use command::GitCommand;
pub use exchange::ExchangeHandler;
pub use gitaly::GitalyPool;
pub use info_refs::InfoRefsHandler;
pub use rpc::{BridgeError, SmartHttpClient};
pub use verb::Verb;
