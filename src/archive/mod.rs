//! Repository archive downloads with an on-disk cache.
//!
//! # Data Flow
//! ```text
//! Authorized request
//!     → format.rs (path suffix → format)
//!     → cache.rs (key → file path)
//!     → hit:  tower-http ServeFile
//!     → miss: git archive [| gzip | bzip2] → tee(temp file, response) → hard link
//! ```

pub mod cache;
pub mod format;
pub mod handler;

pub use cache::CacheKey;
pub use format::ArchiveFormat;
pub use handler::{ArchiveError, ArchiveHandler};
