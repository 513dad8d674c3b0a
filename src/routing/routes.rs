//! The compiled-in route set.
//!
//! # Main table (first match wins)
//! ```text
//! GET  /<ns>/<project>.git/info/refs            gate → advertisement
//! POST /<ns>/<project>.git/git-upload-pack      gate → exchange
//! POST /<ns>/<project>.git/git-receive-pack     gate → exchange
//! GET  /<ns>/<project>/repository/archive*      gate → archive cache
//! *    /-/cable (Upgrade: websocket)            cable proxy
//! *    anything else                            main proxy
//! ```
//!
//! # Geo table (secondary nodes only)
//! Git reads and health checks stay local; the cable and everything else go
//! to the primary with the Geo proxy headers and the primary's Host.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::api::{ApiClient, Gate, GeoProxyData};
use crate::archive::ArchiveHandler;
use crate::config::GatewayConfig;
use crate::git::{BackendSelector, ExchangeHandler, GitCommand, GitalyPool, InfoRefsHandler, Verb};
use crate::proxy::{BackendTarget, ReverseProxy, TransportCache};
use crate::routing::prefix::UrlPrefix;
use crate::routing::router::{Handler, Route, RouteTable};

/// `/<namespace>/<project>.git`
const PROJECT_GIT: &str = r"^/[^/]+/[^/]+\.git";

const GEO_PROXY_HEADER: &str = "gitlab-workhorse-geo-proxy";
const GEO_PROXY_EXTRA_DATA_HEADER: &str = "gitlab-workhorse-geo-proxy-extra-data";

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid route pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid header value for {0}")]
    Header(&'static str),

    #[error("unsupported backend scheme {0:?}, only http is supported")]
    Scheme(String),
}

/// Accept only URLs the transport can dial.
fn http_only(url: url::Url) -> Result<url::Url, RouteError> {
    if url.scheme() != "http" {
        return Err(RouteError::Scheme(url.scheme().to_string()));
    }
    Ok(url)
}

/// Everything route handlers are built from.
pub struct RouteContext {
    prefix: UrlPrefix,
    version: String,
    header_timeout: Duration,
    transports: Arc<TransportCache>,
    /// Main and cable targets; these outlive any Geo table.
    pinned: [BackendTarget; 2],
    api: Arc<ApiClient>,
    backends: Arc<BackendSelector>,
    archive: Arc<ArchiveHandler>,
    main_proxy: Arc<ReverseProxy>,
    cable_proxy: Arc<ReverseProxy>,
}

impl RouteContext {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, RouteError> {
        let backend_url = http_only(config.backend.parsed_url()?)?;
        let cable_url = http_only(config.backend.parsed_cable_url()?)?;
        let header_timeout = config.backend.headers_timeout();
        let transports = Arc::new(TransportCache::new(config.development_mode));

        let main_target = BackendTarget::new(backend_url.clone(), config.backend.socket.clone(), header_timeout);
        let cable_target = BackendTarget::new(cable_url, config.backend.cable_socket(), header_timeout);
        let main_transport = transports.get(&main_target);
        let cable_transport = transports.get(&cable_target);

        let prefix = UrlPrefix::from_backend(&backend_url);
        let api = Arc::new(ApiClient::new(main_transport.clone(), prefix.clone(), &config.version));
        let backends = Arc::new(BackendSelector::new(
            GitCommand::new(&config.git.binary),
            Arc::new(GitalyPool::new()),
        ));
        let archive = Arc::new(ArchiveHandler::new(
            config.archive.cache_root.clone(),
            config.git.clone(),
            prefix.clone(),
        ));

        Ok(Self {
            prefix,
            version: config.version.clone(),
            header_timeout,
            transports,
            pinned: [main_target, cable_target],
            main_proxy: Arc::new(ReverseProxy::new(main_transport, &config.version)),
            cable_proxy: Arc::new(ReverseProxy::new(cable_transport, &config.version)),
            api,
            backends,
            archive,
        })
    }

    pub fn prefix(&self) -> &UrlPrefix {
        &self.prefix
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn transports(&self) -> &Arc<TransportCache> {
        &self.transports
    }

    fn gated(&self, suffix: &'static str, inner: Arc<dyn crate::api::AuthorizedHandler>) -> Arc<dyn Handler> {
        Arc::new(Gate::new(self.api.clone(), suffix, inner))
    }

    fn info_refs_route(&self) -> Result<Route, RouteError> {
        let handler = Arc::new(InfoRefsHandler::new(self.backends.clone()));
        Ok(Route::builder("git_info_refs")
            .method(Method::GET)
            .path(&format!(r"{PROJECT_GIT}/info/refs\z"))?
            .handler(self.gated("/info/refs", handler)))
    }

    fn exchange_route(&self, name: &'static str, verb: Verb, suffix: &'static str) -> Result<Route, RouteError> {
        let handler = Arc::new(ExchangeHandler::new(verb, self.backends.clone()));
        Ok(Route::builder(name)
            .method(Method::POST)
            .path(&format!(r"{PROJECT_GIT}{suffix}\z"))?
            .handler(self.gated(suffix, handler)))
    }

    fn archive_route(&self) -> Result<Route, RouteError> {
        Ok(Route::builder("repository_archive")
            .method(Method::GET)
            .path(r"^/[^/]+/[^/]+/repository/archive")?
            .handler(self.gated("", self.archive.clone())))
    }

    fn cable_route(&self, proxy: Arc<ReverseProxy>) -> Result<Route, RouteError> {
        Ok(Route::builder("cable")
            .path(r"^/-/cable\z")?
            .upgrade("websocket")
            .handler(proxy))
    }

    /// The main route table.
    pub fn main_table(&self) -> Result<RouteTable, RouteError> {
        Ok(RouteTable::new(vec![
            self.info_refs_route()?,
            self.exchange_route("git_upload_pack", Verb::UploadPack, "/git-upload-pack")?,
            self.exchange_route("git_receive_pack", Verb::ReceivePack, "/git-receive-pack")?,
            self.archive_route()?,
            self.cable_route(self.cable_proxy.clone())?,
            Route::builder("default").handler(self.main_proxy.clone()),
        ]))
    }

    /// The Geo override table, or `None` when this node does not proxy.
    pub fn geo_table(&self, data: &GeoProxyData) -> Result<Option<RouteTable>, RouteError> {
        if !data.is_proxying() {
            return Ok(None);
        }

        let transport = self.transports.get(&self.geo_target(data)?);

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(GEO_PROXY_HEADER), HeaderValue::from_static("1"));
        if !data.geo_proxy_extra_data.is_empty() {
            let extra = HeaderValue::from_str(&data.geo_proxy_extra_data)
                .map_err(|_| RouteError::Header(GEO_PROXY_EXTRA_DATA_HEADER))?;
            headers.insert(HeaderName::from_static(GEO_PROXY_EXTRA_DATA_HEADER), extra);
        }
        let geo_proxy = Arc::new(
            ReverseProxy::new(transport, &self.version)
                .with_custom_headers(headers)
                .with_forced_target_host(),
        );

        Ok(Some(RouteTable::new(vec![
            self.info_refs_route()?,
            self.exchange_route("git_upload_pack", Verb::UploadPack, "/git-upload-pack")?,
            Route::builder("health")
                .path(r"^/-/(readiness|liveness|health)\z")?
                .handler(self.main_proxy.clone()),
            self.cable_route(geo_proxy.clone())?,
            Route::builder("geo_proxy").handler(geo_proxy),
        ])))
    }

    fn geo_target(&self, data: &GeoProxyData) -> Result<BackendTarget, RouteError> {
        let geo_url = http_only(url::Url::parse(&data.geo_proxy_url)?)?;
        Ok(BackendTarget::new(geo_url, None, self.header_timeout))
    }

    /// Drop the transport of a Geo table that is being replaced by `next`.
    pub fn release_geo(&self, previous: &GeoProxyData, next: &GeoProxyData) {
        if !previous.is_proxying() {
            return;
        }
        let Ok(old) = self.geo_target(previous) else {
            return;
        };
        let still_used = next.is_proxying() && self.geo_target(next).is_ok_and(|new| new == old);
        if still_used || self.pinned.contains(&old) {
            return;
        }
        if self.transports.remove(&old).is_some() {
            tracing::debug!(geo_proxy_url = %previous.geo_proxy_url, "Released Geo backend transport");
        }
    }
}
