//! `GET <repo>.git/info/refs?service=<verb>`: the reference advertisement.
//!
//! # Design Decisions
//! - The response is the packet-line `# service=` announcement, a flush
//!   packet, then the backend's advertisement bytes untouched
//! - Failures before headers are a 500; later ones truncate the body

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::Response,
};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

use crate::api::{Authorized, AuthorizedHandler};
use crate::git::backend::{git_protocol, BackendSelector, PackBackend};
use crate::git::command::reap;
use crate::git::pktline;
use crate::git::rpc::{BridgeError, ByteStream, RpcHeader};
use crate::git::session::{body_channel, conclude, forward_output};
use crate::git::verb::Verb;
use crate::http::response::{internal_error, request_error, set_no_cache};

pub struct InfoRefsHandler {
    backends: Arc<BackendSelector>,
}

impl InfoRefsHandler {
    pub fn new(backends: Arc<BackendSelector>) -> Self {
        Self { backends }
    }
}

impl AuthorizedHandler for InfoRefsHandler {
    fn call(&self, req: Request<Body>, auth: Authorized) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            let Some(verb) = requested_verb(&req) else {
                return request_error(&req, StatusCode::NOT_FOUND, "Not found");
            };
            match self.backends.select(&auth) {
                Ok(backend) => advertise(req, auth, verb, backend).await,
                Err(e) => internal_error(req.uri().path(), e),
            }
        })
    }
}

/// The verb named by the `service` query parameter.
fn requested_verb(req: &Request<Body>) -> Option<Verb> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "service")
        .and_then(|(_, value)| Verb::from_service(&value))
}

/// Serve the advertisement for `verb` from `backend`.
pub async fn advertise(req: Request<Body>, auth: Authorized, verb: Verb, backend: PackBackend) -> Response {
    let path = req.uri().path().to_string();
    let rpc_header = RpcHeader {
        verb,
        auth: auth.shared(),
        git_protocol: git_protocol(&req),
    };

    let preamble = match pktline::service_preamble(verb.service()) {
        Ok(preamble) => preamble,
        Err(e) => return internal_error(&path, e),
    };

    let (output, child): (ByteStream, _) = match backend {
        PackBackend::LocalProcess(git) => {
            let mut child = match git.spawn_advertisement(verb, &auth, rpc_header.git_protocol.as_deref()) {
                Ok(child) => child,
                Err(e) => return internal_error(&path, format!("spawning git {}: {e}", verb.subcommand())),
            };
            let Some(stdout) = child.stdout.take() else {
                return internal_error(&path, "git stdout not captured");
            };
            (ReaderStream::new(stdout).map_err(BridgeError::Io).boxed(), Some(child))
        }
        PackBackend::RemoteStream(client) => match client.info_refs(rpc_header).await {
            Ok(stream) => (stream, None),
            Err(e) => return internal_error(&path, e),
        },
    };

    let (body_tx, body) = body_channel(Some(preamble));
    tokio::spawn(async move {
        let result = forward_output(output, body_tx.clone()).await;
        if let Some(mut child) = child {
            if result.is_err() {
                let _ = child.start_kill();
            }
            reap(child, "info-refs").await;
        }
        conclude(body_tx, result, "info-refs").await;
    });

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(verb.advertisement_content_type()),
    );
    set_no_cache(&mut response);
    response
}
