//! Two-direction streaming session.
//!
//! # Responsibilities
//! - Run the send and receive directions as independent tasks
//! - Wait for both before declaring the session finished
//! - Report the first real error; cancel the other direction when one fails
//!
//! # Design Decisions
//! - End of stream is success, never an error
//! - Dropping the session aborts any task still running, which in turn drops
//!   the child process or RPC stream it owns
//! - A [`driven_body`] runs its supervisor inside the response body, so the
//!   session lives exactly as long as the client is being served

use std::future::Future;

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::git::rpc::{BridgeError, ByteStream};
use crate::observability::metrics;

/// Chunks in flight between a backend and the client body.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Sending half of a streaming response body. An `Err` truncates the body.
pub type BodySender = mpsc::Sender<Result<Bytes, BridgeError>>;

pub type BodyReceiver = mpsc::Receiver<Result<Bytes, BridgeError>>;

/// Both ends of the channel behind a streaming response body.
pub fn body_pipe() -> (BodySender, BodyReceiver) {
    mpsc::channel(BODY_CHANNEL_CAPACITY)
}

/// A response body fed from a channel, plus the sender feeding it.
pub fn body_channel(preamble: Option<Bytes>) -> (BodySender, Body) {
    let (tx, rx) = body_pipe();
    let stream = futures_util::stream::iter(preamble.map(Ok)).chain(ReceiverStream::new(rx));
    (tx, Body::from_stream(stream))
}

/// A response body that polls `driver` alongside the channel it reads.
///
/// The body ends once `driver` has completed and every sender is gone.
/// Dropping the body drops `driver` with it.
pub fn driven_body<F>(rx: BodyReceiver, driver: F) -> Body
where
    F: Future<Output = ()> + Send + 'static,
{
    let driver = futures_util::stream::once(driver)
        .filter_map(|()| std::future::ready(None::<Result<Bytes, BridgeError>>));
    Body::from_stream(futures_util::stream::select(ReceiverStream::new(rx), driver))
}

/// Copy backend output into the client body until either side ends.
pub async fn forward_output(mut output: ByteStream, body: BodySender) -> Result<(), BridgeError> {
    loop {
        let next = tokio::select! {
            next = output.next() => next,
            _ = body.closed() => return Err(BridgeError::ClientGone),
        };
        match next {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(chunk)) => {
                metrics::record_git_bytes("download", chunk.len() as u64);
                body.send(Ok(chunk)).await.map_err(|_| BridgeError::ClientGone)?;
            }
        }
    }
}

/// Close a streaming body, truncating it if the session failed.
pub async fn conclude(body: BodySender, result: Result<(), BridgeError>, what: &'static str) {
    match result {
        Ok(()) => tracing::debug!(operation = what, "Stream completed"),
        Err(BridgeError::ClientGone) => tracing::info!(operation = what, "Client disconnected mid-stream"),
        Err(e) => {
            tracing::error!(operation = what, error = %e, "Stream failed after response headers");
            let _ = body.send(Err(e)).await;
        }
    }
}

pub struct StreamingSession {
    tasks: JoinSet<(&'static str, Result<(), BridgeError>)>,
    cancel: CancellationToken,
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSession {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start one direction. It stops early if the session is cancelled.
    pub fn spawn<F>(&mut self, direction: &'static str, work: F)
    where
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let result = tokio::select! {
                result = work => result,
                _ = cancel.cancelled() => Err(BridgeError::Cancelled(direction)),
            };
            (direction, result)
        });
    }

    /// Wait for every direction. Returns the first error, if any.
    pub async fn finish(mut self) -> Result<(), BridgeError> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let error = match joined {
                Ok((direction, Ok(()))) => {
                    tracing::trace!(direction, "Stream direction finished");
                    continue;
                }
                Ok((_, Err(e))) => e,
                Err(e) if e.is_panic() => BridgeError::Panicked("stream"),
                Err(_) => BridgeError::Cancelled("stream"),
            };

            if first_error.is_none() {
                self.cancel.cancel();
                first_error = Some(error);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
