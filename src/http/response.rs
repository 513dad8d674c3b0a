//! Response helpers shared by every handler.
//!
//! # Design Decisions
//! - Errors are plain text; the status code carries the meaning
//! - Every error response is logged with the request path
//! - Nothing here is used once a streaming body has started: failures past
//!   that point are logged and truncate the body instead

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};

/// Header the backend uses to learn which gateway version forwarded a request.
pub const VERSION_HEADER: &str = "gitlab-workhorse";

/// Build a plain-text error response and log it.
pub fn http_error(status: StatusCode, path: &str, message: impl Into<String>) -> Response {
    let message = message.into();
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), path = %path, error = %message, "Request failed");
    } else {
        tracing::info!(status = status.as_u16(), path = %path, reason = %message, "Request rejected");
    }
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
        format!("{message}\n"),
    )
        .into_response()
}

/// Same as [`http_error`] but pulls the path from the request.
pub fn request_error(req: &Request<Body>, status: StatusCode, message: impl Into<String>) -> Response {
    http_error(status, req.uri().path(), message)
}

/// A 500 whose body does not leak internal details; the cause is logged.
pub fn internal_error(path: &str, cause: impl std::fmt::Display) -> Response {
    tracing::error!(path = %path, error = %cause, "Internal error");
    http_error(StatusCode::INTERNAL_SERVER_ERROR, path, "Internal server error")
}

/// Stop clients and intermediaries from caching a response.
pub fn set_no_cache(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
    );
}
