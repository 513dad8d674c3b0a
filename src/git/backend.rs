//! Where a smart-HTTP request is served from.

use std::sync::Arc;

use axum::{body::Body, http::Request};

use crate::api::Authorization;
use crate::git::command::GitCommand;
use crate::git::gitaly::GitalyPool;
use crate::git::rpc::{BridgeError, SmartHttpClient};

/// Header Git clients use to request protocol v2.
const GIT_PROTOCOL_HEADER: &str = "git-protocol";

/// Chosen once per request from the authorization record.
pub enum PackBackend {
    LocalProcess(GitCommand),
    RemoteStream(Arc<dyn SmartHttpClient>),
}

impl std::fmt::Debug for PackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalProcess(command) => f.debug_tuple("LocalProcess").field(command).finish(),
            Self::RemoteStream(_) => f.write_str("RemoteStream"),
        }
    }
}

pub struct BackendSelector {
    git: GitCommand,
    gitaly: Arc<GitalyPool>,
}

impl BackendSelector {
    pub fn new(git: GitCommand, gitaly: Arc<GitalyPool>) -> Self {
        Self { git, gitaly }
    }

    /// A remote RPC server wins over the local repository path.
    pub fn select(&self, auth: &Authorization) -> Result<PackBackend, BridgeError> {
        if auth.gitaly_server.is_configured() {
            return Ok(PackBackend::RemoteStream(self.gitaly.client(&auth.gitaly_server)?));
        }
        if auth.repo_path.is_empty() {
            return Err(BridgeError::NoRepository);
        }
        Ok(PackBackend::LocalProcess(self.git.clone()))
    }
}

/// The `Git-Protocol` request header, if the client sent one.
pub fn git_protocol(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(GIT_PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GitalyServer;

    fn selector() -> BackendSelector {
        BackendSelector::new(GitCommand::new("git"), Arc::new(GitalyPool::new()))
    }

    #[test]
    fn test_local_when_no_server() {
        let auth = Authorization {
            repo_path: "/repos/p.git".into(),
            ..Default::default()
        };
        assert!(matches!(selector().select(&auth).unwrap(), PackBackend::LocalProcess(_)));
    }

    #[tokio::test]
    async fn test_remote_when_server_configured() {
        let auth = Authorization {
            repo_path: "/repos/p.git".into(),
            gitaly_server: GitalyServer {
                address: "tcp://127.0.0.1:9999".into(),
                token: String::new(),
            },
            ..Default::default()
        };
        assert!(matches!(selector().select(&auth).unwrap(), PackBackend::RemoteStream(_)));
    }

    #[test]
    fn test_nothing_to_serve_from() {
        assert!(selector().select(&Authorization::default()).is_err());
    }

    #[test]
    fn test_git_protocol_header() {
        let req = Request::get("/").header("Git-Protocol", "version=2").body(Body::empty()).unwrap();
        assert_eq!(git_protocol(&req).as_deref(), Some("version=2"));
        assert_eq!(git_protocol(&Request::new(Body::empty())), None);
    }
}
