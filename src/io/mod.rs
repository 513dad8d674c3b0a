//! I/O helpers shared by the archive and transfer paths.

pub mod bounded;

pub use bounded::{BoundedReadError, BoundedReader, LimitExceeded, ReadAt};
