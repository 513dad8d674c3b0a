//! Route matching logic.
//!
//! # Responsibilities
//! - Match the cleaned path (regex or prefix)
//! - Match the HTTP method
//! - Match the `Upgrade` header (websocket routes)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Paths are matched after prefix stripping and cleaning, never raw
//! - Header matching is case-insensitive (RFC 9110)
//! - Path matching is case-sensitive
//! - Empty condition = always matches (wildcard)

use axum::body::Body;
use axum::http::{header, Method, Request};
use regex::Regex;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition. `path` is the
    /// cleaned path with the URL prefix removed.
    fn matches(&self, path: &str, req: &Request<Body>) -> bool;
}

/// Matches the cleaned path against a regular expression.
#[derive(Debug, Clone)]
pub struct PathRegexMatcher {
    pattern: Regex,
}

impl PathRegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl Matcher for PathRegexMatcher {
    fn matches(&self, path: &str, _req: &Request<Body>) -> bool {
        self.pattern.is_match(path)
    }
}

/// Matches the cleaned path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, path: &str, _req: &Request<Body>) -> bool {
        path.starts_with(&self.prefix)
    }
}

/// Matches the request method.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    method: Method,
}

impl MethodMatcher {
    pub fn new(method: Method) -> Self {
        Self { method }
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, _path: &str, req: &Request<Body>) -> bool {
        req.method() == self.method
    }
}

/// Matches the `Upgrade` header, e.g. `websocket`.
#[derive(Debug, Clone)]
pub struct UpgradeMatcher {
    protocol: String,
}

impl UpgradeMatcher {
    /// The protocol is normalized to lowercase for case-insensitive matching.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into().to_lowercase(),
        }
    }
}

impl Matcher for UpgradeMatcher {
    fn matches(&self, _path: &str, req: &Request<Body>) -> bool {
        req.headers()
            .get(header::UPGRADE)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_lowercase() == self.protocol)
            .unwrap_or(false)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }

    pub fn push(&mut self, matcher: impl Matcher + 'static) {
        self.matchers.push(Box::new(matcher));
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, path: &str, req: &Request<Body>) -> bool {
        // All matchers must pass (AND)
        self.matchers.iter().all(|m| m.matches(path, req))
    }
}
