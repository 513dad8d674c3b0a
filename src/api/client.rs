//! Side-channel requests to the backend API.
//!
//! # Responsibilities
//! - Ask the backend whether a request may proceed (pre-authorization)
//! - Fetch the Geo proxy settings document
//!
//! # Design Decisions
//! - Calls go through the shared [`BackendTransport`], so an unreachable
//!   backend is seen as a 502 response, not a transport error
//! - Only a 200 with a decodable JSON body counts as success

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
};
use serde::Deserialize;

use crate::api::authorization::Authorization;
use crate::http::request::X_REQUEST_ID;
use crate::http::response::VERSION_HEADER;
use crate::proxy::transport::BackendTransport;
use crate::routing::prefix::UrlPrefix;

/// Largest API response body the gateway will buffer.
const MAX_API_RESPONSE: usize = 1 << 20;

/// Client request headers never forwarded to the authorization endpoint.
const FORWARD_DENYLIST: [HeaderName; 10] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::EXPECT,
];

/// Path of the Geo settings document, relative to the URL prefix.
const GEO_PROXY_PATH: &str = "api/v4/geo/proxy";

#[derive(Debug, thiserror::Error)]
pub enum AuthorizeError {
    #[error("building API request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("API responded with status {0}")]
    Status(StatusCode),

    #[error("reading API response: {0}")]
    Body(#[from] axum::Error),

    #[error("decoding API response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Geo settings published by the backend. An empty URL means this node is
/// not a Geo secondary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GeoProxyData {
    pub geo_proxy_url: String,
    pub geo_proxy_extra_data: String,
}

impl GeoProxyData {
    pub fn is_proxying(&self) -> bool {
        !self.geo_proxy_url.is_empty()
    }
}

pub struct ApiClient {
    transport: Arc<BackendTransport>,
    prefix: UrlPrefix,
    version: HeaderValue,
}

impl ApiClient {
    pub fn new(transport: Arc<BackendTransport>, prefix: UrlPrefix, version: &str) -> Self {
        Self {
            transport,
            prefix,
            version: HeaderValue::from_str(version)
                .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
        }
    }

    /// Ask the backend to authorize `req`. The authorization request reuses
    /// the client's path and query and most of its headers.
    ///
    /// Everything needed is copied out of `req` before returning, so the
    /// future borrows only the client.
    pub fn preauthorize(
        &self,
        req: &Request<Body>,
    ) -> impl Future<Output = Result<Authorization, AuthorizeError>> + Send + '_ {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut headers = req.headers().clone();
        for name in &FORWARD_DENYLIST {
            headers.remove(name);
        }

        let api_request = self.build_request(path_and_query, headers);
        async move { self.fetch_json(api_request?).await }
    }

    pub async fn geo_proxy_data(&self) -> Result<GeoProxyData, AuthorizeError> {
        let path = format!("{}{}", self.prefix.as_str(), GEO_PROXY_PATH);
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let api_request = self.build_request(&path, headers)?;
        self.fetch_json(api_request).await
    }

    fn build_request(&self, path_and_query: &str, mut headers: HeaderMap) -> Result<Request<Body>, AuthorizeError> {
        headers.insert(HeaderName::from_static(VERSION_HEADER), self.version.clone());

        let mut api_request = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .body(Body::empty())?;
        *api_request.headers_mut() = headers;
        Ok(api_request)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, api_request: Request<Body>) -> Result<T, AuthorizeError> {
        let request_id = api_request
            .headers()
            .get(&X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let path = api_request.uri().path().to_string();

        let response = self.transport.round_trip(api_request).await;
        let status = response.status();
        if status != StatusCode::OK {
            tracing::warn!(request_id = %request_id, path = %path, status = status.as_u16(), "API request refused");
            return Err(AuthorizeError::Status(status));
        }

        let body = axum::body::to_bytes(response.into_body(), MAX_API_RESPONSE).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
