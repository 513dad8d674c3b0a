//! Reverse proxy on top of a [`BackendTransport`].
//!
//! # Responsibilities
//! - Copy the inbound request into a fresh backend request
//! - Strip hop-by-hop headers, stamp the gateway version
//! - Apply optional static header overrides and a forced Host header
//! - Stream the backend response back untouched
//! - Splice upgraded connections (websocket cable) after a 101

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode},
};
use futures_util::future::BoxFuture;
use hyper_util::rt::TokioIo;

use crate::http::response::VERSION_HEADER;
use crate::proxy::transport::BackendTransport;
use crate::routing::router::Handler;

/// Headers meaningful only for a single connection.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Header carrying the time the gateway started forwarding, in nanoseconds.
const PROXY_START_HEADER: &str = "gitlab-workhorse-proxy-start";

pub struct ReverseProxy {
    transport: Arc<BackendTransport>,
    version: HeaderValue,
    custom_headers: HeaderMap,
    force_target_host: bool,
}

impl ReverseProxy {
    pub fn new(transport: Arc<BackendTransport>, version: &str) -> Self {
        Self {
            transport,
            version: HeaderValue::from_str(version)
                .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
            custom_headers: HeaderMap::new(),
            force_target_host: false,
        }
    }

    /// Headers set on every forwarded request, replacing client values.
    pub fn with_custom_headers(mut self, headers: HeaderMap) -> Self {
        self.custom_headers = headers;
        self
    }

    /// Send the backend's own authority as Host instead of the client's.
    pub fn with_forced_target_host(mut self) -> Self {
        self.force_target_host = true;
        self
    }

    pub async fn serve(&self, mut req: Request<Body>) -> Response<Body> {
        let upgrade = is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));

        let outbound = self.outbound_request(req);
        let mut response = self.transport.round_trip(outbound).await;

        if let Some(client_upgrade) = upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let backend_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(async move {
                    splice_upgraded(client_upgrade, backend_upgrade).await;
                });
                return response;
            }
        }

        strip_hop_by_hop(response.headers_mut(), false);
        response
    }

    /// Build the backend request. Headers are copied into a new map so the
    /// caller's view of the request is never altered.
    fn outbound_request(&self, req: Request<Body>) -> Request<Body> {
        let (parts, body) = req.into_parts();
        let upgrade = is_upgrade_request(&parts.headers);

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers, upgrade);

        headers.insert(HeaderName::from_static(VERSION_HEADER), self.version.clone());
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        headers.insert(HeaderName::from_static(PROXY_START_HEADER), HeaderValue::from(started as u64));

        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut headers, peer);
        }

        for (name, value) in &self.custom_headers {
            headers.insert(name.clone(), value.clone());
        }

        if self.force_target_host {
            if let Ok(host) = HeaderValue::from_str(&self.transport.target().authority()) {
                headers.insert(header::HOST, host);
            }
        }

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = parts.uri;
        *outbound.headers_mut() = headers;
        outbound
    }
}

impl Handler for ReverseProxy {
    fn call(&self, req: Request<Body>) -> BoxFuture<'_, Response<Body>> {
        Box::pin(self.serve(req))
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    // Headers named in Connection are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        if keep_upgrade && (*name == header::CONNECTION || *name == header::UPGRADE) {
            continue;
        }
        headers.remove(name);
    }

    if keep_upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    } else {
        headers.remove(header::UPGRADE);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: &SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
}

async fn splice_upgraded(client: hyper::upgrade::OnUpgrade, backend: hyper::upgrade::OnUpgrade) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "Upgrade handshake failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((up, down)) => tracing::debug!(bytes_up = up, bytes_down = down, "Upgraded connection closed"),
        Err(e) => tracing::debug!(error = %e, "Upgraded connection ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::transport::{BackendTarget, NOT_RESPONDING};
    use axum::Router;
    use std::time::Duration;
    use url::Url;

    /// Backend that echoes selected request headers back as response headers.
    async fn start_echo_backend() -> SocketAddr {
        let app = Router::new().fallback(|req: Request<Body>| async move {
            let mut response = Response::new(Body::from(req.uri().to_string()));
            for name in ["gitlab-workhorse", "host", "x-geo", "connection", "x-forwarded-for", "keep-alive"] {
                if let Some(value) = req.headers().get(name) {
                    response
                        .headers_mut()
                        .insert(HeaderName::from_bytes(format!("echo-{name}").as_bytes()).unwrap(), value.clone());
                }
            }
            response
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn transport_for(addr: &str) -> Arc<BackendTransport> {
        Arc::new(BackendTransport::new(
            BackendTarget::new(Url::parse(addr).unwrap(), None, Duration::from_secs(5)),
            false,
        ))
    }

    #[tokio::test]
    async fn test_stamps_version_and_strips_hop_headers() {
        let addr = start_echo_backend().await;
        let proxy = ReverseProxy::new(transport_for(&format!("http://{addr}")), "1.2.3");

        let req = Request::get("/group/project?tab=1")
            .header("host", "gitlab.example.com")
            .header("keep-alive", "timeout=5")
            .body(Body::empty())
            .unwrap();
        let response = proxy.serve(req).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["echo-gitlab-workhorse"], "1.2.3");
        assert_eq!(response.headers()["echo-host"], "gitlab.example.com");
        assert!(response.headers().get("echo-keep-alive").is_none());
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"/group/project?tab=1");
    }

    #[tokio::test]
    async fn test_custom_headers_and_forced_host() {
        let addr = start_echo_backend().await;
        let mut custom = HeaderMap::new();
        custom.insert("x-geo", HeaderValue::from_static("1"));
        let proxy = ReverseProxy::new(transport_for(&format!("http://{addr}")), "1.2.3")
            .with_custom_headers(custom)
            .with_forced_target_host();

        let req = Request::get("/")
            .header("host", "secondary.example.com")
            .header("x-geo", "forged")
            .body(Body::empty())
            .unwrap();
        let response = proxy.serve(req).await;

        assert_eq!(response.headers()["echo-x-geo"], "1");
        assert_eq!(response.headers()["echo-host"], addr.to_string().as_str());
    }

    #[tokio::test]
    async fn test_forwarded_for_appends_peer() {
        let addr = start_echo_backend().await;
        let proxy = ReverseProxy::new(transport_for(&format!("http://{addr}")), "1.2.3");

        let mut req = Request::get("/")
            .header("x-forwarded-for", "10.0.0.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("192.168.1.7:5000".parse::<SocketAddr>().unwrap()));
        let response = proxy.serve(req).await;

        assert_eq!(response.headers()["echo-x-forwarded-for"], "10.0.0.1, 192.168.1.7");
    }

    #[tokio::test]
    async fn test_backend_down_is_502() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = ReverseProxy::new(transport_for(&format!("http://{addr}")), "1.2.3");
        let response = proxy.serve(Request::get("/").body(Body::empty()).unwrap()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], NOT_RESPONDING.as_bytes());
    }

    #[test]
    fn test_strip_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-private"));
        headers.insert("x-private", HeaderValue::from_static("secret"));
        headers.insert("x-public", HeaderValue::from_static("ok"));

        strip_hop_by_hop(&mut headers, false);
        assert!(headers.get("x-private").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(headers["x-public"], "ok");
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&headers));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade_request(&headers));

        strip_hop_by_hop(&mut headers, true);
        assert_eq!(headers[header::UPGRADE], "websocket");
        assert_eq!(headers[header::CONNECTION], "upgrade");
    }
}
