//! `GET <namespace>/<project>/repository/archive[.<ext>]`.
//!
//! # Responsibilities
//! - Serve a cached archive straight from disk (ranges and conditionals
//!   handled by tower-http's file service)
//! - On a miss, run `git archive` (plus compressor), tee the output into a
//!   temp file and the response, then publish the temp file
//!
//! # Design Decisions
//! - Every byte reaches the temp file before it is sent to the client
//! - The body ends only after the processes exited cleanly and the publish
//!   step ran; any earlier failure truncates the body instead
//! - A client that goes away aborts generation; nothing is published

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::api::{Authorized, AuthorizedHandler};
use crate::archive::cache::{create_temp, publish, CacheKey, Published};
use crate::archive::format::{ArchiveFormat, Compressor};
use crate::config::GitConfig;
use crate::http::response::{internal_error, request_error};
use crate::observability::metrics;
use crate::routing::prefix::{clean_path, UrlPrefix};

const BODY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} exited with {status}")]
    CommandFailed { command: &'static str, status: ExitStatus },

    #[error("client went away")]
    ClientGone,
}

type BodySender = mpsc::Sender<Result<Bytes, ArchiveError>>;

pub struct ArchiveHandler {
    cache_root: PathBuf,
    git: GitConfig,
    /// Stripped before the project name is read from the path.
    url_prefix: UrlPrefix,
}

impl ArchiveHandler {
    pub fn new(cache_root: PathBuf, git: GitConfig, url_prefix: UrlPrefix) -> Self {
        Self {
            cache_root,
            git,
            url_prefix,
        }
    }

    fn spawn_pipeline(&self, key: &CacheKey, repo_path: &str) -> std::io::Result<(ChildStdout, Vec<(&'static str, Child)>)> {
        let mut git = Command::new(&self.git.binary)
            .arg(format!("--git-dir={repo_path}"))
            .arg("archive")
            .arg(format!("--format={}", key.format.git_format()))
            .arg(format!("--prefix={}/", key.prefix))
            .arg(&key.commit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let git_stdout = take_stdout(&mut git)?;

        let Some(compressor) = key.format.compressor() else {
            return Ok((git_stdout, vec![("git archive", git)]));
        };

        let (binary, name) = match compressor {
            Compressor::Gzip => (&self.git.gzip_binary, "gzip"),
            Compressor::Bzip2 => (&self.git.bzip2_binary, "bzip2"),
        };
        let mut command = Command::new(binary);
        command.arg("-c");
        if compressor == Compressor::Gzip {
            // No name or timestamp, so output is reproducible.
            command.arg("-n");
        }
        let stdin: Stdio = git_stdout.try_into()?;
        let mut compress = command
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = take_stdout(&mut compress)?;

        Ok((stdout, vec![("git archive", git), (name, compress)]))
    }
}

impl AuthorizedHandler for ArchiveHandler {
    fn call(&self, req: Request<Body>, auth: Authorized) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            let path = req.uri().path().to_string();
            let Some(format) = ArchiveFormat::from_path(&path) else {
                return request_error(&req, StatusCode::INTERNAL_SERVER_ERROR, "Invalid archive format");
            };
            if auth.commit_id.is_empty() {
                return internal_error(&path, "authorization record has no CommitId");
            }
            if auth.repo_path.is_empty() {
                return internal_error(&path, "authorization record has no RepoPath");
            }

            let prefix = if auth.archive_prefix.is_empty() {
                default_prefix(&self.url_prefix.strip(&clean_path(&path)), &auth.commit_id)
            } else {
                auth.archive_prefix.clone()
            };
            let key = CacheKey {
                repository: auth.repo_path.clone(),
                commit: auth.commit_id.clone(),
                prefix,
                format,
            };
            let root = auth.archive_path.clone().unwrap_or_else(|| self.cache_root.clone());
            let final_path = key.path_in(&root);
            let download_name = format!("{}.{}", base_name(&key.prefix), format.extension());

            let cached = tokio::fs::metadata(&final_path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if cached {
                metrics::record_archive_cache("hit");
                tracing::debug!(path = %final_path.display(), "Serving cached archive");
                return serve_cached(req, &final_path, format, &download_name).await;
            }

            metrics::record_archive_cache("miss");
            let temp = match create_temp(&final_path) {
                Ok(temp) => temp,
                Err(e) => return internal_error(&path, format!("creating archive temp file: {e}")),
            };
            let file = match temp.reopen() {
                Ok(file) => tokio::fs::File::from_std(file),
                Err(e) => return internal_error(&path, format!("opening archive temp file: {e}")),
            };
            let (stdout, children) = match self.spawn_pipeline(&key, &auth.repo_path) {
                Ok(pipeline) => pipeline,
                Err(e) => return internal_error(&path, format!("starting archive pipeline: {e}")),
            };

            tracing::info!(
                commit = %key.commit,
                format = format.extension(),
                path = %final_path.display(),
                "Generating archive"
            );

            let (body_tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                let result = fill(stdout, file, &temp, &final_path, children, &body_tx).await;
                match result {
                    Ok(()) => {}
                    Err(ArchiveError::ClientGone) => tracing::info!(path = %final_path.display(), "Client left during archive generation"),
                    Err(e) => {
                        tracing::error!(path = %final_path.display(), error = %e, "Archive generation failed");
                        let _ = body_tx.send(Err(e)).await;
                    }
                }
                // Temp file removed here, before the body ends.
                drop(temp);
            });

            let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
            set_archive_headers(&mut response, format, &download_name);
            response
        })
    }
}

/// Tee `stdout` into `file` and `body`, then wait for the pipeline and
/// publish the result.
async fn fill(
    stdout: ChildStdout,
    mut file: tokio::fs::File,
    temp: &NamedTempFile,
    final_path: &Path,
    mut children: Vec<(&'static str, Child)>,
    body: &BodySender,
) -> Result<(), ArchiveError> {
    let mut chunks = ReaderStream::new(stdout);
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        body.send(Ok(chunk)).await.map_err(|_| ArchiveError::ClientGone)?;
    }
    file.flush().await?;
    file.sync_all().await?;

    for (command, child) in children.iter_mut() {
        let status = child.wait().await?;
        if !status.success() {
            return Err(ArchiveError::CommandFailed { command: *command, status });
        }
    }

    match publish(temp, final_path) {
        Ok(Published::Linked) => tracing::info!(path = %final_path.display(), "Archive cached"),
        Ok(Published::AlreadyPresent) => {
            tracing::debug!(path = %final_path.display(), "Archive already cached by a concurrent request")
        }
        Err(e) => {
            metrics::record_archive_cache("publish_failed");
            tracing::warn!(path = %final_path.display(), error = %e, "Failed to publish archive");
        }
    }
    Ok(())
}

async fn serve_cached(req: Request<Body>, path: &Path, format: ArchiveFormat, download_name: &str) -> Response {
    let response = match ServeFile::new(path).oneshot(req).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };
    let mut response = response;
    if response.status().is_success() {
        set_archive_headers(&mut response, format, download_name);
    }
    response
}

fn set_archive_headers(response: &mut Response, format: ArchiveFormat, download_name: &str) {
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
    headers.insert("content-transfer-encoding", HeaderValue::from_static("binary"));
    let disposition = format!("attachment; filename=\"{}\"", download_name.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// `<project>-<commit>`, the project taken from `/<namespace>/<project>/...`.
/// `path` must already have the URL prefix removed.
fn default_prefix(path: &str, commit: &str) -> String {
    let project = path.split('/').filter(|s| !s.is_empty()).nth(1).unwrap_or("archive");
    format!("{project}-{commit}")
}

fn base_name(prefix: &str) -> &str {
    prefix.trim_end_matches('/').rsplit('/').next().unwrap_or(prefix)
}

fn take_stdout(child: &mut Child) -> std::io::Result<ChildStdout> {
    child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout not captured"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefix() {
        assert_eq!(default_prefix("/group/project/repository/archive.zip", "abc123"), "project-abc123");

        let prefix = UrlPrefix::new("/gitlab");
        let stripped = prefix.strip("/gitlab/group/project/repository/archive.zip");
        assert_eq!(default_prefix(&stripped, "abc123"), "project-abc123");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("project-abc123"), "project-abc123");
        assert_eq!(base_name("nested/project-abc123/"), "project-abc123");
    }

    #[test]
    fn test_archive_headers() {
        let mut response = Response::new(Body::empty());
        set_archive_headers(&mut response, ArchiveFormat::TarBz2, "project-abc123.tar.bz2");
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "application/x-bzip2");
        assert_eq!(headers[header::CACHE_CONTROL], "private");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"project-abc123.tar.bz2\""
        );
    }
}
