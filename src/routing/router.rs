//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes in order
//! - Reject wildcard requests and CONNECT, enforce the URL prefix
//! - Consult the Geo override table, then the main table
//! - Invoke the first matching route's handler
//!
//! # Design Decisions
//! - Tables are immutable after construction; the Geo table is replaced
//!   wholesale through an atomic pointer swap, readers never block
//! - O(n) ordered scan, first match wins
//! - Explicit 403 when nothing matches (Git HTTP protocol convention)

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
};
use futures_util::future::BoxFuture;

use crate::http::request::RequestIdExt;
use crate::http::response::http_error;
use crate::observability::metrics;
use crate::routing::matcher::{
    AndMatcher, Matcher, MethodMatcher, PathRegexMatcher, UpgradeMatcher,
};
use crate::routing::prefix::{clean_path, UrlPrefix};

/// Request headers clients may never send through to a handler.
const REQUEST_HEADER_DENYLIST: [&str; 1] = ["gitlab-workhorse-multipart-fields"];

/// Something that turns a request into a response.
pub trait Handler: Send + Sync {
    fn call(&self, req: Request<Body>) -> BoxFuture<'_, Response>;
}

/// Adapts a closure returning a boxed future into a [`Handler`].
pub struct HandlerFn<F>(pub F);

impl<F> Handler for HandlerFn<F>
where
    F: Fn(Request<Body>) -> BoxFuture<'static, Response> + Send + Sync,
{
    fn call(&self, req: Request<Body>) -> BoxFuture<'_, Response> {
        (self.0)(req)
    }
}

/// One entry of a route table.
#[derive(Clone)]
pub struct Route {
    name: &'static str,
    matcher: Arc<AndMatcher>,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .finish()
    }
}

impl Route {
    pub fn builder(name: &'static str) -> RouteBuilder {
        RouteBuilder {
            name,
            matcher: AndMatcher::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn is_match(&self, path: &str, req: &Request<Body>) -> bool {
        self.matcher.matches(path, req)
    }
}

/// Collects the conditions of a route before it is frozen.
pub struct RouteBuilder {
    name: &'static str,
    matcher: AndMatcher,
}

impl RouteBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.matcher.push(MethodMatcher::new(method));
        self
    }

    pub fn path(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.matcher.push(PathRegexMatcher::new(pattern)?);
        Ok(self)
    }

    pub fn upgrade(mut self, protocol: &str) -> Self {
        self.matcher.push(UpgradeMatcher::new(protocol));
        self
    }

    pub fn handler(self, handler: Arc<dyn Handler>) -> Route {
        Route {
            name: self.name,
            matcher: Arc::new(self.matcher),
            handler,
        }
    }
}

/// An ordered, immutable list of routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// First route accepting the request.
    pub fn find(&self, path: &str, req: &Request<Body>) -> Option<&Route> {
        self.routes.iter().find(|route| route.is_match(path, req))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Entry point for every request.
pub struct Dispatcher {
    prefix: UrlPrefix,
    routes: RouteTable,
    geo_routes: ArcSwapOption<RouteTable>,
}

impl Dispatcher {
    pub fn new(prefix: UrlPrefix, routes: RouteTable) -> Self {
        Self {
            prefix,
            routes,
            geo_routes: ArcSwapOption::const_empty(),
        }
    }

    /// Install a new Geo override table, or remove it with `None`.
    pub fn replace_geo_routes(&self, table: Option<RouteTable>) {
        self.geo_routes.store(table.map(Arc::new));
    }

    pub fn has_geo_routes(&self) -> bool {
        self.geo_routes.load().is_some()
    }

    pub async fn dispatch(&self, mut req: Request<Body>) -> Response {
        let start = Instant::now();

        if req.uri() == "*" {
            return http_error(StatusCode::BAD_REQUEST, "*", "Connection upgrade not allowed");
        }
        if req.method() == Method::CONNECT {
            return http_error(StatusCode::BAD_REQUEST, req.uri().path(), "CONNECT not allowed");
        }

        let uri_path = clean_path(req.uri().path());
        if !self.prefix.matches(&uri_path) {
            return http_error(StatusCode::NOT_FOUND, &uri_path, format!("Not found {uri_path:?}"));
        }
        let cleaned = self.prefix.strip(&uri_path);

        let geo_routes = self.geo_routes.load_full();
        let route = geo_routes
            .as_deref()
            .and_then(|table| table.find(&cleaned, &req))
            .or_else(|| self.routes.find(&cleaned, &req))
            .cloned();

        let Some(route) = route else {
            return http_error(StatusCode::FORBIDDEN, &uri_path, "Forbidden");
        };

        for name in REQUEST_HEADER_DENYLIST {
            req.headers_mut().remove(name);
        }

        tracing::debug!(
            request_id = %req.request_id(),
            method = %req.method(),
            path = %cleaned,
            route = route.name(),
            geo = geo_routes.is_some(),
            "Dispatching request"
        );

        let response = route.handler().call(req).await;
        metrics::record_request(route.name(), response.status().as_u16(), start);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    fn tagged(tag: &'static str) -> Arc<dyn Handler> {
        Arc::new(HandlerFn(move |req: Request<Body>| -> BoxFuture<'static, Response> {
            let multipart = req.headers().contains_key("gitlab-workhorse-multipart-fields");
            Box::pin(async move {
                let body = if multipart { format!("{tag}+multipart") } else { tag.to_string() };
                body.into_response()
            })
        }))
    }

    fn table() -> RouteTable {
        RouteTable::new(vec![
            Route::builder("info_refs")
                .method(Method::GET)
                .path(r"^/[^/]+/[^/]+\.git/info/refs\z")
                .unwrap()
                .handler(tagged("info_refs")),
            Route::builder("cable")
                .path(r"^/-/cable\z")
                .unwrap()
                .upgrade("websocket")
                .handler(tagged("cable")),
        ])
    }

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let dispatcher = Dispatcher::new(UrlPrefix::new("/"), table());
        let response = dispatcher.dispatch(get("/group/project.git/info/refs")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "info_refs");
    }

    #[tokio::test]
    async fn test_no_match_is_forbidden() {
        let dispatcher = Dispatcher::new(UrlPrefix::new("/"), table());

        let wrong_method = Request::post("/group/project.git/info/refs").body(Body::empty()).unwrap();
        assert_eq!(dispatcher.dispatch(wrong_method).await.status(), StatusCode::FORBIDDEN);

        // Cable route needs the websocket upgrade header.
        assert_eq!(dispatcher.dispatch(get("/-/cable")).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_outside_prefix_is_not_found() {
        let dispatcher = Dispatcher::new(UrlPrefix::new("/gitlab"), table());

        let response = dispatcher.dispatch(get("/other/project.git/info/refs")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = dispatcher.dispatch(get("/gitlab/group/project.git/info/refs")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dot_segments_are_cleaned() {
        let dispatcher = Dispatcher::new(UrlPrefix::new("/gitlab"), table());
        let response = dispatcher
            .dispatch(get("/gitlab/x/../group/./project.git/info/refs"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejects_connect_and_wildcard() {
        let dispatcher = Dispatcher::new(UrlPrefix::new("/"), table());

        let connect = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(Body::empty())
            .unwrap();
        assert_eq!(dispatcher.dispatch(connect).await.status(), StatusCode::BAD_REQUEST);

        let wildcard = Request::builder()
            .method(Method::OPTIONS)
            .uri("*")
            .body(Body::empty())
            .unwrap();
        assert_eq!(dispatcher.dispatch(wildcard).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_geo_table_consulted_first() {
        let dispatcher = Dispatcher::new(UrlPrefix::new("/"), table());
        let geo = RouteTable::new(vec![Route::builder("geo_proxy").handler(tagged("geo"))]);

        dispatcher.replace_geo_routes(Some(geo));
        assert!(dispatcher.has_geo_routes());
        let response = dispatcher.dispatch(get("/group/project.git/info/refs")).await;
        assert_eq!(body_of(response).await, "geo");

        // Removing the table falls through to the main routes again.
        dispatcher.replace_geo_routes(None);
        let response = dispatcher.dispatch(get("/group/project.git/info/refs")).await;
        assert_eq!(body_of(response).await, "info_refs");
    }

    #[tokio::test]
    async fn test_denylisted_headers_are_removed() {
        let dispatcher = Dispatcher::new(UrlPrefix::new("/"), table());
        let req = Request::get("/group/project.git/info/refs")
            .header("Gitlab-Workhorse-Multipart-Fields", "forged")
            .body(Body::empty())
            .unwrap();
        assert_eq!(body_of(dispatcher.dispatch(req).await).await, "info_refs");
    }
}
