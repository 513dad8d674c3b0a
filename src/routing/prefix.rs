//! Relative URL root handling.
//!
//! The backend may be mounted under a path such as `/gitlab/`. Requests
//! outside that prefix are not ours; requests inside have it stripped before
//! route matching.

/// Normalize a request path: collapse `.`/`..`/empty segments, force a leading
/// slash, and keep a trailing slash if the input had one.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    cleaned.push('/');
    cleaned.push_str(&segments.join("/"));
    if path.ends_with('/') && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

/// A URL prefix, always ending in `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPrefix(String);

impl UrlPrefix {
    pub fn new(prefix: &str) -> Self {
        let mut prefix = clean_path(prefix);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self(prefix)
    }

    /// The prefix taken from the backend URL's path.
    pub fn from_backend(url: &url::Url) -> Self {
        Self::new(url.path())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `path` lies under the prefix (`/gitlab` matches `/gitlab/`).
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.0) || format!("{path}/").starts_with(&self.0)
    }

    /// Remove the prefix and re-clean, so the result starts with `/`.
    pub fn strip(&self, path: &str) -> String {
        let trimmed = path.strip_prefix(self.0.as_str()).unwrap_or(path);
        clean_path(trimmed)
    }
}
