//! Content-addressed archive paths and atomic publishing.
//!
//! # Design Decisions
//! - A cache file's name is derived from everything that determines its
//!   bytes, so an existing file is always valid for its key
//! - Temp files live next to their final path; publishing is a hard link,
//!   which is atomic and fails if another request already published
//! - No cross-request locking: concurrent misses each regenerate and the
//!   first successful link wins

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::archive::format::ArchiveFormat;

/// Identifies one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub repository: String,
    pub commit: String,
    pub prefix: String,
    pub format: ArchiveFormat,
}

impl CacheKey {
    /// Final file name: the commit keeps names readable, the digest keeps
    /// them unique across repositories, prefixes and formats.
    pub fn file_name(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.repository, &self.commit, &self.prefix] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.format.extension().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}.{}", self.commit, &digest[..16], self.format.extension())
    }

    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(self.file_name())
    }
}

/// Outcome of publishing a filled temp file.
#[derive(Debug, PartialEq, Eq)]
pub enum Published {
    Linked,
    AlreadyPresent,
}

/// Create the cache directory and a temp file beside `final_path`.
pub fn create_temp(final_path: &Path) -> io::Result<NamedTempFile> {
    let dir = final_path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"))?;
    std::fs::create_dir_all(dir)?;

    let name = final_path
        .file_name()
        .map(|n| format!("{}.", n.to_string_lossy()))
        .unwrap_or_default();
    tempfile::Builder::new().prefix(&name).tempfile_in(dir)
}

/// Hard-link `temp` into place. The temp file is removed when dropped by
/// the caller, whatever the outcome.
pub fn publish(temp: &NamedTempFile, final_path: &Path) -> io::Result<Published> {
    match std::fs::hard_link(temp.path(), final_path) {
        Ok(()) => Ok(Published::Linked),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Published::AlreadyPresent),
        Err(e) => Err(e),
    }
}
