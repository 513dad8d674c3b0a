//! The permission record returned by the authorization endpoint.
//!
//! Field names follow the backend's JSON. Unknown fields are ignored and
//! missing ones take their default, so older and newer backends both decode.
//! The record itself must be a JSON object; serde's derived visitor would
//! also take an array positionally, which the backend never sends.

use std::path::PathBuf;

use serde::{de, Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Address of a remote Git RPC server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct GitalyServer {
    pub address: String,
    pub token: String,
}

impl GitalyServer {
    pub fn is_configured(&self) -> bool {
        !self.address.is_empty()
    }
}

/// Repository locator understood by the RPC server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RepositoryLocator {
    pub storage_name: String,
    pub relative_path: String,
    pub git_object_directory: String,
    pub git_alternate_object_directories: Vec<String>,
    pub gl_repository: String,
    pub gl_project_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(remote = "Self", default)]
pub struct Authorization {
    #[serde(rename = "GL_ID")]
    pub gl_id: String,

    #[serde(rename = "GL_USERNAME")]
    pub gl_username: String,

    #[serde(rename = "GL_REPOSITORY")]
    pub gl_repository: String,

    /// On-disk repository used by local git subprocesses.
    #[serde(rename = "RepoPath")]
    pub repo_path: String,

    #[serde(rename = "GitalyServer")]
    pub gitaly_server: GitalyServer,

    #[serde(rename = "Repository")]
    pub repository: RepositoryLocator,

    #[serde(rename = "GitConfigOptions")]
    pub git_config_options: Vec<String>,

    #[serde(rename = "ShowAllRefs")]
    pub show_all_refs: bool,

    /// Overrides the configured archive cache root.
    #[serde(rename = "ArchivePath")]
    pub archive_path: Option<PathBuf>,

    #[serde(rename = "ArchivePrefix")]
    pub archive_prefix: String,

    #[serde(rename = "CommitId")]
    pub commit_id: String,

    #[serde(rename = "LfsOid")]
    pub lfs_oid: String,

    #[serde(rename = "LfsSize")]
    pub lfs_size: i64,
}

impl<'de> Deserialize<'de> for Authorization {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Map::<String, Value>::deserialize(deserializer)?;
        Authorization::deserialize(Value::Object(fields)).map_err(de::Error::custom)
    }
}
