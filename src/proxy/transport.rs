//! Backend round trips that never fail.
//!
//! # Responsibilities
//! - Send an HTTP request to one backend, over TCP or a Unix socket
//! - Enforce the response-header timeout
//! - Turn every connection-level failure into a synthesized 502
//!
//! # Design Decisions
//! - One transport per target, shared across requests (see [`TransportCache`])
//! - TCP targets reuse hyper-util's pooled client; Unix sockets dial per request
//! - The request path and query are kept; scheme and authority come from the target

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, uri::PathAndQuery, HeaderValue, Request, Response, StatusCode, Uri},
    response::IntoResponse,
};
use dashmap::DashMap;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioIo},
};
use url::Url;

use crate::observability::metrics;

/// Body sent to clients when the backend cannot be reached.
pub const NOT_RESPONDING: &str = "GitLab is not responding";

/// Where a transport delivers requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    /// Scheme and authority of the backend; its path is ignored.
    pub url: Url,
    /// Dial this socket instead of `url`'s host.
    pub socket: Option<PathBuf>,
    /// Maximum wait for response headers.
    pub header_timeout: Duration,
}

impl BackendTarget {
    pub fn new(url: Url, socket: Option<PathBuf>, header_timeout: Duration) -> Self {
        Self {
            url,
            socket,
            header_timeout,
        }
    }

    /// `host[:port]` of the target, as sent in a forced Host header.
    pub fn authority(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => "localhost".to_string(),
        }
    }

    fn label(&self) -> String {
        match &self.socket {
            Some(path) => format!("unix:{}", path.display()),
            None => self.authority(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("dial unix {path}: {source}")]
    DialSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("{0}")]
    Http(#[from] hyper::Error),

    #[error("timeout awaiting response headers after {0:?}")]
    HeaderTimeout(Duration),

    #[error("invalid backend uri: {0}")]
    Uri(#[from] axum::http::Error),
}

enum Dialer {
    Tcp(Client<HttpConnector, Body>),
    Unix(PathBuf),
}

/// A round-tripper bound to one backend target.
pub struct BackendTransport {
    target: BackendTarget,
    dialer: Dialer,
    development_mode: bool,
}

impl std::fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTransport")
            .field("target", &self.target)
            .field("development_mode", &self.development_mode)
            .finish()
    }
}

impl BackendTransport {
    pub fn new(target: BackendTarget, development_mode: bool) -> Self {
        let dialer = match &target.socket {
            Some(path) => Dialer::Unix(path.clone()),
            None => {
                let mut connector = HttpConnector::new();
                connector.set_nodelay(true);
                Dialer::Tcp(Client::builder(TokioExecutor::new()).build(connector))
            }
        };
        Self {
            target,
            dialer,
            development_mode,
        }
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    /// Send `req` to the backend. Connection failures come back as a 502
    /// response rather than an error.
    pub async fn round_trip(&self, req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        match self.try_round_trip(req).await {
            Ok(response) => response,
            Err(err) => self.bad_gateway(&err, start),
        }
    }

    /// Like [`round_trip`](Self::round_trip) but reports the failure.
    pub async fn try_round_trip(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let timeout = self.target.header_timeout;
        match tokio::time::timeout(timeout, self.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::HeaderTimeout(timeout)),
        }
    }

    async fn send(&self, req: Request<Body>) -> Result<Response<Body>, TransportError> {
        let (mut parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        match &self.dialer {
            Dialer::Tcp(client) => {
                parts.uri = Uri::builder()
                    .scheme(self.target.url.scheme())
                    .authority(self.target.authority().as_str())
                    .path_and_query(path_and_query)
                    .build()?;
                let response = client.request(Request::from_parts(parts, body)).await?;
                Ok(response.map(Body::new))
            }
            Dialer::Unix(path) => {
                parts.uri = Uri::builder().path_and_query(path_and_query).build()?;
                if !parts.headers.contains_key(header::HOST) {
                    if let Ok(host) = HeaderValue::from_str(&self.target.authority()) {
                        parts.headers.insert(header::HOST, host);
                    }
                }
                send_unix(path, Request::from_parts(parts, body)).await
            }
        }
    }

    fn bad_gateway(&self, err: &TransportError, start: Instant) -> Response<Body> {
        let backend = self.target.label();
        tracing::error!(
            backend = %backend,
            error = %err,
            duration_ms = start.elapsed().as_millis() as u64,
            "Backend round trip failed"
        );
        metrics::record_backend_error(&backend);

        let message = if self.development_mode {
            err.to_string()
        } else {
            NOT_RESPONDING.to_string()
        };
        (
            StatusCode::BAD_GATEWAY,
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
            message,
        )
            .into_response()
    }
}

#[cfg(unix)]
async fn send_unix(path: &PathBuf, req: Request<Body>) -> Result<Response<Body>, TransportError> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::DialSocket {
            path: path.clone(),
            source,
        })?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            tracing::debug!(error = %e, "Backend socket connection closed with error");
        }
    });

    let response = sender.send_request(req).await?;
    Ok(response.map(Body::new))
}

#[cfg(not(unix))]
async fn send_unix(path: &PathBuf, _req: Request<Body>) -> Result<Response<Body>, TransportError> {
    Err(TransportError::DialSocket {
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "unix sockets unavailable"),
    })
}

/// Shares one transport per distinct target.
#[derive(Debug, Default)]
pub struct TransportCache {
    transports: DashMap<BackendTarget, Arc<BackendTransport>>,
    development_mode: bool,
}

impl TransportCache {
    pub fn new(development_mode: bool) -> Self {
        Self {
            transports: DashMap::new(),
            development_mode,
        }
    }

    pub fn get(&self, target: &BackendTarget) -> Arc<BackendTransport> {
        if let Some(existing) = self.transports.get(target) {
            return existing.clone();
        }
        self.transports
            .entry(target.clone())
            .or_insert_with(|| Arc::new(BackendTransport::new(target.clone(), self.development_mode)))
            .clone()
    }

    /// Forget a target. Requests already holding its transport finish on it.
    pub fn remove(&self, target: &BackendTarget) -> Option<Arc<BackendTransport>> {
        self.transports.remove(target).map(|(_, transport)| transport)
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> BackendTarget {
        BackendTarget::new(Url::parse(url).unwrap(), None, Duration::from_secs(2))
    }

    /// An address nothing listens on.
    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_refused_connection_becomes_502() {
        let transport = BackendTransport::new(target(&closed_port().await), false);
        let response = transport
            .round_trip(Request::get("/api/v4/projects").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], NOT_RESPONDING.as_bytes());
    }

    #[tokio::test]
    async fn test_development_mode_reports_error_text() {
        let transport = BackendTransport::new(target(&closed_port().await), true);
        let response = transport
            .round_trip(Request::get("/").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        assert_ne!(&body[..], NOT_RESPONDING.as_bytes());
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn test_missing_socket_becomes_502() {
        let dir = tempfile::tempdir().unwrap();
        let transport = BackendTransport::new(
            BackendTarget::new(
                Url::parse("http://localhost").unwrap(),
                Some(dir.path().join("missing.sock")),
                Duration::from_secs(1),
            ),
            false,
        );
        let response = transport
            .round_trip(Request::get("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_header_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let transport = BackendTransport::new(
            BackendTarget::new(
                Url::parse(&format!("http://{addr}")).unwrap(),
                None,
                Duration::from_millis(100),
            ),
            false,
        );
        let err = transport
            .try_round_trip(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::HeaderTimeout(_)));
    }

    #[test]
    fn test_cache_reuses_transport_per_target() {
        let cache = TransportCache::new(false);
        let a = cache.get(&target("http://rails:8080"));
        let b = cache.get(&target("http://rails:8080"));
        let c = cache.get(&target("http://geo:8080"));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_removed_target_gets_a_fresh_transport() {
        let cache = TransportCache::new(false);
        let old = cache.get(&target("http://geo:8080"));

        assert!(cache.remove(&target("http://geo:8080")).is_some());
        assert!(cache.remove(&target("http://geo:8080")).is_none());
        assert!(cache.is_empty());

        let fresh = cache.get(&target("http://geo:8080"));
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[test]
    fn test_authority() {
        assert_eq!(target("http://rails:8080/gitlab").authority(), "rails:8080");
        assert_eq!(target("https://gitlab.example.com").authority(), "gitlab.example.com");
    }
}
