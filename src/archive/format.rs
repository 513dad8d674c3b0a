//! Archive formats selected by the request path.

/// How an archive is produced and labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

/// Compression applied after `git archive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Gzip,
    Bzip2,
}

impl ArchiveFormat {
    /// Parse the last path segment. `archive` alone means `tar.gz`.
    pub fn from_path(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next().unwrap_or(path);
        match name {
            "archive.zip" => Some(Self::Zip),
            "archive.tar" => Some(Self::Tar),
            "archive" | "archive.tar.gz" => Some(Self::TarGz),
            "archive.tar.bz2" => Some(Self::TarBz2),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::Tar => "application/x-tar",
            Self::TarGz => "application/x-gzip",
            Self::TarBz2 => "application/x-bzip2",
        }
    }

    /// Value for `git archive --format`.
    pub fn git_format(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar | Self::TarGz | Self::TarBz2 => "tar",
        }
    }

    pub fn compressor(self) -> Option<Compressor> {
        match self {
            Self::Zip | Self::Tar => None,
            Self::TarGz => Some(Compressor::Gzip),
            Self::TarBz2 => Some(Compressor::Bzip2),
        }
    }
}
