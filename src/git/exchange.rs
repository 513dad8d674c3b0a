//! `POST <repo>.git/git-upload-pack` and `git-receive-pack`: the pack exchange.
//!
//! # Responsibilities
//! - Copy the client body into the backend (subprocess stdin or RPC stream)
//! - Copy backend output into the client response
//! - Finish only once both directions have drained
//!
//! # Design Decisions
//! - Response headers go out before any backend byte is known to exist;
//!   later failures are logged and truncate the body
//! - For RPC backends the send direction starts before the call, so a
//!   server that waits for input before answering cannot deadlock us
//! - Two tasks per exchange (send and recv); the response body itself waits
//!   for both and reaps the child
//! - Pushes without a user identity are refused before headers

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;

use crate::api::{Authorized, AuthorizedHandler};
use crate::git::backend::{git_protocol, BackendSelector, PackBackend};
use crate::git::command::reap;
use crate::git::rpc::{BridgeError, RpcHeader};
use crate::git::session::{body_pipe, conclude, driven_body, forward_output, StreamingSession};
use crate::git::verb::Verb;
use crate::http::response::{internal_error, request_error, set_no_cache};
use crate::observability::metrics;

/// Request chunks buffered toward an RPC stream.
const INPUT_CHANNEL_CAPACITY: usize = 16;

pub struct ExchangeHandler {
    verb: Verb,
    backends: Arc<BackendSelector>,
}

impl ExchangeHandler {
    pub fn new(verb: Verb, backends: Arc<BackendSelector>) -> Self {
        Self { verb, backends }
    }
}

impl AuthorizedHandler for ExchangeHandler {
    fn call(&self, req: Request<Body>, auth: Authorized) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            if self.verb.requires_identity() && auth.gl_id.is_empty() {
                return request_error(&req, StatusCode::BAD_REQUEST, "Missing GL_ID");
            }
            match self.backends.select(&auth) {
                Ok(backend) => exchange(req, auth, self.verb, backend).await,
                Err(e) => internal_error(req.uri().path(), e),
            }
        })
    }
}

/// Run the pack exchange for `verb` against `backend`.
pub async fn exchange(req: Request<Body>, auth: Authorized, verb: Verb, backend: PackBackend) -> Response {
    let path = req.uri().path().to_string();
    let rpc_header = RpcHeader {
        verb,
        auth: auth.shared(),
        git_protocol: git_protocol(&req),
    };
    let request_body = req.into_body();
    let mut session = StreamingSession::new();

    let (output, child) = match backend {
        PackBackend::LocalProcess(git) => {
            let mut child = match git.spawn_exchange(verb, &auth, rpc_header.git_protocol.as_deref()) {
                Ok(child) => child,
                Err(e) => return internal_error(&path, format!("spawning git {}: {e}", verb.subcommand())),
            };
            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return internal_error(&path, "git stdio not captured");
            };
            session.spawn("send", copy_body_to_stdin(request_body, stdin));
            (ReaderStream::new(stdout).map_err(BridgeError::Io).boxed(), Some(child))
        }
        PackBackend::RemoteStream(client) => {
            let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
            session.spawn("send", copy_body_to_channel(request_body, input_tx));
            match client.exchange(rpc_header, ReceiverStream::new(input_rx).boxed()).await {
                Ok(stream) => (stream, None),
                // Dropping the session aborts the send direction.
                Err(e) => return internal_error(&path, e),
            }
        }
    };

    let (body_tx, body_rx) = body_pipe();
    session.spawn("recv", forward_output(output, body_tx.clone()));

    // Serving the body drives the session; a vanished client drops it.
    let body = driven_body(body_rx, async move {
        let result = session.finish().await;
        if let Some(mut child) = child {
            if result.is_err() {
                let _ = child.start_kill();
            }
            reap(child, verb.service()).await;
        }
        conclude(body_tx, result, verb.service()).await;
    });

    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(verb.result_content_type()),
    );
    set_no_cache(&mut response);
    response
}

async fn copy_body_to_stdin(body: Body, mut stdin: ChildStdin) -> Result<(), BridgeError> {
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(BridgeError::RequestBody)?;
        metrics::record_git_bytes("upload", chunk.len() as u64);
        stdin.write_all(&chunk).await?;
    }
    // Closing stdin is the end-of-input signal.
    stdin.shutdown().await?;
    Ok(())
}

async fn copy_body_to_channel(body: Body, input: mpsc::Sender<Bytes>) -> Result<(), BridgeError> {
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(BridgeError::RequestBody)?;
        metrics::record_git_bytes("upload", chunk.len() as u64);
        input.send(chunk).await.map_err(|_| BridgeError::InputClosed)?;
    }
    // Dropping the sender closes the send side of the call.
    Ok(())
}
