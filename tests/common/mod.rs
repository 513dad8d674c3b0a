//! Shared fixtures for the integration tests.
//!
//! Every test gets its own mock backend, fake git binary, and gateway, all
//! on ephemeral ports, so tests can run in parallel.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use git_gateway::{GatewayConfig, GatewayServer, Shutdown};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

/// Output of `fake-git ... --advertise-refs`.
pub const ADVERTISEMENT: &str = "003f0123456789abcdef0123456789abcdef01234567 refs/heads/main\n0000";

/// Counters the mock backend keeps.
#[derive(Default)]
pub struct BackendStats {
    pub authorizations: AtomicUsize,
    pub proxied: AtomicUsize,
}

pub struct TestEnv {
    pub gateway: SocketAddr,
    pub backend: SocketAddr,
    pub stats: Arc<BackendStats>,
    pub dir: TempDir,
    shutdown: Arc<Shutdown>,
}

impl TestEnv {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start the fixtures; `tweak` adjusts the gateway config before launch.
    pub async fn start_with(tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let git = write_fake_git(dir.path());
        let stats = Arc::new(BackendStats::default());
        let backend = start_backend(stats.clone(), dir.path().join("repo.git")).await;

        let mut config = GatewayConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        config.backend.url = format!("http://{backend}/");
        config.git.binary = git;
        config.git.gzip_binary = write_fake_gzip(dir.path());
        config.archive.cache_root = dir.path().join("cache");
        config.geo.enabled = false;
        tweak(&mut config);

        let gateway = start_gateway(config, Arc::new(Shutdown::new())).await;
        Self {
            gateway: gateway.0,
            backend,
            stats,
            dir,
            shutdown: gateway.1,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.gateway, path)
    }

    /// Invocations of the fake git binary, one line of arguments each.
    pub fn git_calls(&self) -> Vec<String> {
        self.calls("git-calls")
    }

    /// Invocations of the fake compressor.
    pub fn gzip_calls(&self) -> Vec<String> {
        self.calls("gzip-calls")
    }

    /// Entries in the archive cache directory, temp files included.
    pub fn cache_entries(&self) -> Vec<String> {
        std::fs::read_dir(self.dir.path().join("cache"))
            .map(|entries| {
                entries
                    .map(|entry| entry.unwrap().file_name().into_string().unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn calls(&self, log: &str) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join(log))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_gateway(config: GatewayConfig, shutdown: Arc<Shutdown>) -> (SocketAddr, Arc<Shutdown>) {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(config).unwrap();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        server.run(listener, stop).await.unwrap();
    });
    (addr, shutdown)
}

/// A compressor stand-in: logs its arguments and prefixes its input.
fn write_fake_gzip(dir: &Path) -> PathBuf {
    let calls = dir.join("gzip-calls");
    let script = dir.join("fake-gzip");
    let body = format!(
        "#!/bin/sh\necho \"$@\" >> '{calls}'\nprintf 'gzip:'\nexec cat\n",
        calls = calls.display(),
    );
    write_executable(&script, &body);
    script
}

fn write_executable(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// A shell script standing in for git. It logs its arguments, prints a
/// fixed ref advertisement, echoes stdin for RPC exchanges, and prints a
/// deterministic payload for `archive`. The commit id selects special
/// archive behavior: `broken` fails midway, `endless` never stops, `slow`
/// waits a second first.
fn write_fake_git(dir: &Path) -> PathBuf {
    let calls = dir.join("git-calls");
    let script = dir.join("fake-git");
    let body = format!(
        r#"#!/bin/sh
echo "$@" >> '{calls}'
for arg in "$@"; do
  if [ "$arg" = "--advertise-refs" ]; then
    printf '%s' '{advertisement}'
    exit 0
  fi
done
case "$1" in
  upload-pack|receive-pack) exec cat ;;
esac
if [ "$2" = "archive" ]; then
  case "$5" in
    broken) printf 'partial'; exit 1 ;;
    endless) exec yes archive ;;
    slow) sleep 1 ;;
  esac
  printf 'archive %s %s %s\n' "$3" "$4" "$5"
  exit 0
fi
exit 1
"#,
        calls = calls.display(),
        advertisement = ADVERTISEMENT,
    );
    write_executable(&script, &body);
    script
}

/// The backend: answers authorization call-outs for a few known paths and
/// echoes everything else.
async fn start_backend(stats: Arc<BackendStats>, repo: PathBuf) -> SocketAddr {
    let app = Router::new().fallback(move |req: Request<Body>| {
        let stats = stats.clone();
        let repo = repo.clone();
        async move { backend_response(&stats, &repo, req) }
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Only the reverse proxy stamps this header; authorization call-outs
/// never carry it.
const PROXY_START_HEADER: &str = "gitlab-workhorse-proxy-start";

fn backend_response(stats: &BackendStats, repo: &Path, req: Request<Body>) -> Response {
    if req.headers().contains_key(PROXY_START_HEADER) {
        return echo(stats, req);
    }

    let path = req.uri().path();
    let repo = repo.display().to_string();

    let authorization = match path {
        "/group/project.git/info/refs"
        | "/group/project.git/git-upload-pack"
        | "/group/project.git/git-receive-pack" => Some(json!({
            "GL_ID": "user-1",
            "GL_USERNAME": "alice",
            "GL_REPOSITORY": "project-1",
            "RepoPath": repo,
        })),
        "/group/anonymous.git/git-receive-pack" => Some(json!({ "RepoPath": repo })),
        _ if path.contains("/repository/archive") => {
            // The project name doubles as the commit for the special cases.
            let segments: Vec<&str> = path.split('/').collect();
            let project = segments
                .iter()
                .position(|s| *s == "repository")
                .and_then(|i| i.checked_sub(1))
                .map_or("", |i| segments[i]);
            let commit = if project == "project" { COMMIT } else { project };
            Some(json!({ "RepoPath": repo, "CommitId": commit }))
        }
        "/group/denied.git/info/refs" => {
            stats.authorizations.fetch_add(1, Ordering::SeqCst);
            return (StatusCode::FORBIDDEN, "denied").into_response();
        }
        "/group/garbled.git/info/refs" => {
            stats.authorizations.fetch_add(1, Ordering::SeqCst);
            return "not json".into_response();
        }
        "/api/v4/geo/proxy" => Some(json!({ "geo_proxy_url": "" })),
        _ => None,
    };

    stats.authorizations.fetch_add(1, Ordering::SeqCst);
    match authorization {
        Some(body) => Json(body).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown authorization path").into_response(),
    }
}

/// Answer a proxied request with its method, path and query.
fn echo(stats: &BackendStats, req: Request<Body>) -> Response {
    stats.proxied.fetch_add(1, Ordering::SeqCst);
    let version = req
        .headers()
        .get("gitlab-workhorse")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let target = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    (
        [("x-backend-saw-version", version)],
        format!("backend {} {}", req.method(), target),
    )
        .into_response()
}
