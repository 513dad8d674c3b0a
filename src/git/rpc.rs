//! Remote smart-HTTP RPC abstraction.
//!
//! The bridge only talks to [`SmartHttpClient`]; the gRPC implementation
//! lives in `gitaly.rs` and tests substitute in-memory fakes.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::api::Authorization;
use crate::git::verb::Verb;

/// Output of one direction of a streaming call.
pub type ByteStream = BoxStream<'static, Result<Bytes, BridgeError>>;

/// Payload chunks sent after the metadata message.
pub type InputStream = BoxStream<'static, Bytes>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("rpc: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("invalid rpc address {0:?}")]
    Address(String),

    #[error("authorization names neither a repository path nor an RPC server")]
    NoRepository,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("reading request body: {0}")]
    RequestBody(#[source] axum::Error),

    #[error("rpc input stream closed early")]
    InputClosed,

    #[error("client went away")]
    ClientGone,

    #[error("{0} cancelled")]
    Cancelled(&'static str),

    #[error("{0} task panicked")]
    Panicked(&'static str),
}

/// Routing and identity metadata carried by the first message of a call.
#[derive(Debug, Clone)]
pub struct RpcHeader {
    pub verb: Verb,
    pub auth: std::sync::Arc<Authorization>,
    pub git_protocol: Option<String>,
}

pub trait SmartHttpClient: Send + Sync {
    /// Server-streaming advertisement for `header.verb`.
    fn info_refs(&self, header: RpcHeader) -> BoxFuture<'_, Result<ByteStream, BridgeError>>;

    /// Bidirectional exchange. `input` is drained into the call after the
    /// metadata message; its end closes the send side.
    fn exchange(&self, header: RpcHeader, input: InputStream) -> BoxFuture<'_, Result<ByteStream, BridgeError>>;
}
