//! gRPC client for `gitaly.SmartHTTPService`.
//!
//! # Responsibilities
//! - Declare the protobuf messages the smart-HTTP methods exchange
//! - Connect lazily to `tcp://` and `unix:` addresses
//! - Cache one client per server address and token
//!
//! # Design Decisions
//! - Messages are declared by hand with `prost` derives; only the fields
//!   the gateway sends or reads are present
//! - Calls go through `tonic::client::Grpc` directly, without generated stubs

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::uri::PathAndQuery;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use hyper_util::rt::TokioIo;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};

use crate::api::{Authorization, GitalyServer};
use crate::git::rpc::{BridgeError, ByteStream, InputStream, RpcHeader, SmartHttpClient};
use crate::git::verb::Verb;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Repository {
    #[prost(string, tag = "2")]
    pub storage_name: String,
    #[prost(string, tag = "3")]
    pub relative_path: String,
    #[prost(string, tag = "4")]
    pub git_object_directory: String,
    #[prost(string, repeated, tag = "5")]
    pub git_alternate_object_directories: Vec<String>,
    #[prost(string, tag = "6")]
    pub gl_repository: String,
    #[prost(string, tag = "8")]
    pub gl_project_path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRefsRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(string, repeated, tag = "2")]
    pub extra_args: Vec<String>,
    #[prost(string, tag = "3")]
    pub git_protocol: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRefsResponse {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostUploadPackRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
    #[prost(string, repeated, tag = "3")]
    pub git_config_options: Vec<String>,
    #[prost(string, tag = "4")]
    pub git_protocol: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostUploadPackResponse {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostReceivePackRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
    #[prost(string, tag = "3")]
    pub gl_id: String,
    #[prost(string, tag = "4")]
    pub gl_repository: String,
    #[prost(string, tag = "5")]
    pub gl_username: String,
    #[prost(string, tag = "6")]
    pub git_protocol: String,
    #[prost(string, repeated, tag = "7")]
    pub git_config_options: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostReceivePackResponse {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

const INFO_REFS_UPLOAD_PACK: &str = "/gitaly.SmartHTTPService/InfoRefsUploadPack";
const INFO_REFS_RECEIVE_PACK: &str = "/gitaly.SmartHTTPService/InfoRefsReceivePack";
const POST_UPLOAD_PACK: &str = "/gitaly.SmartHTTPService/PostUploadPack";
const POST_RECEIVE_PACK: &str = "/gitaly.SmartHTTPService/PostReceivePack";

fn repository_message(auth: &Authorization) -> Repository {
    let locator = &auth.repository;
    Repository {
        storage_name: locator.storage_name.clone(),
        relative_path: locator.relative_path.clone(),
        git_object_directory: locator.git_object_directory.clone(),
        git_alternate_object_directories: locator.git_alternate_object_directories.clone(),
        gl_repository: locator.gl_repository.clone(),
        gl_project_path: locator.gl_project_path.clone(),
    }
}

/// Turn a configured address into an endpoint URI and optional socket path.
fn parse_address(address: &str) -> Result<(String, Option<PathBuf>), BridgeError> {
    if let Some(rest) = address.strip_prefix("tcp://") {
        return Ok((format!("http://{rest}"), None));
    }
    if let Some(path) = address.strip_prefix("unix://").or_else(|| address.strip_prefix("unix:")) {
        if path.is_empty() {
            return Err(BridgeError::Address(address.to_string()));
        }
        // The authority is ignored when dialing through the connector.
        return Ok(("http://localhost".to_string(), Some(PathBuf::from(path))));
    }
    if address.starts_with("http://") {
        return Ok((address.to_string(), None));
    }
    Err(BridgeError::Address(address.to_string()))
}

pub struct GitalyClient {
    channel: Channel,
    token: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl GitalyClient {
    pub fn connect_lazy(server: &GitalyServer) -> Result<Self, BridgeError> {
        let (uri, socket) = parse_address(&server.address)?;
        let endpoint = Endpoint::from_shared(uri).map_err(|_| BridgeError::Address(server.address.clone()))?;

        let channel = match socket {
            None => endpoint.connect_lazy(),
            Some(path) => endpoint.connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            })),
        };

        let token = if server.token.is_empty() {
            None
        } else {
            Some(
                format!("Bearer {}", server.token)
                    .parse()
                    .map_err(|_| BridgeError::Address(server.address.clone()))?,
            )
        };

        Ok(Self { channel, token })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        request
    }

    async fn ready(&self) -> Result<tonic::client::Grpc<Channel>, BridgeError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| BridgeError::Rpc(tonic::Status::unavailable(e.to_string())))?;
        Ok(grpc)
    }
}

impl SmartHttpClient for GitalyClient {
    fn info_refs(&self, header: RpcHeader) -> BoxFuture<'_, Result<ByteStream, BridgeError>> {
        Box::pin(async move {
            let message = InfoRefsRequest {
                repository: Some(repository_message(&header.auth)),
                extra_args: if header.auth.show_all_refs {
                    vec!["--show-all-refs".to_string()]
                } else {
                    Vec::new()
                },
                git_protocol: header.git_protocol.clone().unwrap_or_default(),
            };
            let method = match header.verb {
                Verb::UploadPack => INFO_REFS_UPLOAD_PACK,
                Verb::ReceivePack => INFO_REFS_RECEIVE_PACK,
            };

            let mut grpc = self.ready().await?;
            let codec: ProstCodec<InfoRefsRequest, InfoRefsResponse> = ProstCodec::default();
            let response = grpc
                .server_streaming(self.request(message), PathAndQuery::from_static(method), codec)
                .await?;

            let stream = response
                .into_inner()
                .map_ok(|message| message.data)
                .map_err(BridgeError::from);
            Ok(stream.boxed())
        })
    }

    fn exchange(&self, header: RpcHeader, input: InputStream) -> BoxFuture<'_, Result<ByteStream, BridgeError>> {
        Box::pin(async move {
            let auth = &header.auth;
            let git_protocol = header.git_protocol.clone().unwrap_or_default();
            let mut grpc = self.ready().await?;

            match header.verb {
                Verb::UploadPack => {
                    let first = PostUploadPackRequest {
                        repository: Some(repository_message(auth)),
                        data: Bytes::new(),
                        git_config_options: auth.git_config_options.clone(),
                        git_protocol,
                    };
                    let rest = input.map(|data| PostUploadPackRequest {
                        data,
                        ..Default::default()
                    });
                    let outbound = futures_util::stream::once(async move { first }).chain(rest);

                    let codec: ProstCodec<PostUploadPackRequest, PostUploadPackResponse> = ProstCodec::default();
                    let response = grpc
                        .streaming(self.request(outbound), PathAndQuery::from_static(POST_UPLOAD_PACK), codec)
                        .await?;
                    Ok(response
                        .into_inner()
                        .map_ok(|message| message.data)
                        .map_err(BridgeError::from)
                        .boxed())
                }
                Verb::ReceivePack => {
                    let first = PostReceivePackRequest {
                        repository: Some(repository_message(auth)),
                        data: Bytes::new(),
                        gl_id: auth.gl_id.clone(),
                        gl_repository: auth.gl_repository.clone(),
                        gl_username: auth.gl_username.clone(),
                        git_protocol,
                        git_config_options: auth.git_config_options.clone(),
                    };
                    let rest = input.map(|data| PostReceivePackRequest {
                        data,
                        ..Default::default()
                    });
                    let outbound = futures_util::stream::once(async move { first }).chain(rest);

                    let codec: ProstCodec<PostReceivePackRequest, PostReceivePackResponse> = ProstCodec::default();
                    let response = grpc
                        .streaming(self.request(outbound), PathAndQuery::from_static(POST_RECEIVE_PACK), codec)
                        .await?;
                    Ok(response
                        .into_inner()
                        .map_ok(|message| message.data)
                        .map_err(BridgeError::from)
                        .boxed())
                }
            }
        })
    }
}

/// One lazily connected client per (address, token).
///
/// A new token for a known address replaces the client holding the old one.
#[derive(Default)]
pub struct GitalyPool {
    clients: DashMap<GitalyServer, Arc<GitalyClient>>,
}

impl GitalyPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, server: &GitalyServer) -> Result<Arc<dyn SmartHttpClient>, BridgeError> {
        if let Some(existing) = self.clients.get(server) {
            return Ok(existing.clone());
        }
        let client = Arc::new(GitalyClient::connect_lazy(server)?);
        self.clients
            .retain(|known, _| known.address != server.address || known.token == server.token);
        let client = self.clients.entry(server.clone()).or_insert(client).clone();
        tracing::debug!(address = %server.address, pool_size = self.clients.len(), "Gitaly client created");
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
