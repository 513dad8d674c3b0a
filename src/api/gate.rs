//! Authorization gate in front of privileged handlers.
//!
//! # Responsibilities
//! - Check the request path ends with the expected suffix (404 otherwise)
//! - Ask the backend for an [`Authorization`] record
//! - Invoke the protected handler exactly once on success, never on failure
//!
//! # Design Decisions
//! - Protected handlers implement [`AuthorizedHandler`], whose entry point
//!   requires an [`Authorized`] token. Only this module can mint one, so a
//!   protected handler cannot be reached without passing the gate
//! - Every failure of the authorization call is a 500; the backend's own
//!   status is logged, not relayed

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use futures_util::future::BoxFuture;

use crate::api::authorization::Authorization;
use crate::api::client::ApiClient;
use crate::http::request::RequestIdExt;
use crate::http::response::http_error;
use crate::routing::router::Handler;

/// Proof that a request passed the gate, carrying the decoded record.
#[derive(Debug, Clone)]
pub struct Authorized(Arc<Authorization>);

impl Authorized {
    /// A shared handle on the record, for work outliving the request.
    pub fn shared(&self) -> Arc<Authorization> {
        self.0.clone()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(auth: Authorization) -> Self {
        Self(Arc::new(auth))
    }
}

impl Deref for Authorized {
    type Target = Authorization;

    fn deref(&self) -> &Authorization {
        &self.0
    }
}

/// A handler that may only run after authorization.
pub trait AuthorizedHandler: Send + Sync {
    fn call(&self, req: Request<Body>, auth: Authorized) -> BoxFuture<'_, Response>;
}

/// Wraps an [`AuthorizedHandler`] so it can sit in a route table.
pub struct Gate {
    api: Arc<ApiClient>,
    suffix: &'static str,
    inner: Arc<dyn AuthorizedHandler>,
}

impl Gate {
    /// `suffix` may be empty to accept any path.
    pub fn new(api: Arc<ApiClient>, suffix: &'static str, inner: Arc<dyn AuthorizedHandler>) -> Self {
        Self { api, suffix, inner }
    }

    /// Run the authorization check, yielding either the token or the
    /// response to send instead.
    ///
    /// The request is only read up front; the returned future holds owned
    /// copies of its path and id, so it stays `Send` while the backend call
    /// is pending.
    pub fn authorize(
        &self,
        req: &Request<Body>,
    ) -> impl Future<Output = Result<Authorized, Response>> + Send + '_ {
        let path = req.uri().path().to_string();
        let request_id = req.request_id().to_string();
        let pending = path.ends_with(self.suffix).then(|| self.api.preauthorize(req));

        async move {
            let Some(pending) = pending else {
                return Err(http_error(StatusCode::NOT_FOUND, &path, format!("Not found {path:?}")));
            };

            match pending.await {
                Ok(auth) => {
                    tracing::debug!(
                        request_id = %request_id,
                        path = %path,
                        gl_id = %auth.gl_id,
                        "Request authorized"
                    );
                    Ok(Authorized(Arc::new(auth)))
                }
                Err(e) => {
                    tracing::error!(request_id = %request_id, path = %path, error = %e, "Pre-authorization failed");
                    Err(http_error(StatusCode::INTERNAL_SERVER_ERROR, &path, "Internal server error"))
                }
            }
        }
    }
}

impl Handler for Gate {
    fn call(&self, req: Request<Body>) -> BoxFuture<'_, Response> {
        let outcome = self.authorize(&req);
        Box::pin(async move {
            match outcome.await {
                Ok(auth) => self.inner.call(req, auth).await,
                Err(response) => response,
            }
        })
    }
}
