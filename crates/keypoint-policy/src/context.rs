//! Per-request context shared by the validator, rules and policies.
//!
//! The transport layer builds a [`RequestContext`] from whatever it parsed
//! (HTTP, WebSocket upgrade, gRPC metadata). The validator attaches the
//! resolved [`Keypoint`]; from then on `keypoint` is either `None` or a fully
//! validated record.

use std::collections::HashMap;

use keypoint_store::{Keypoint, ScopeRegistry};

/// Case-insensitive header map. Names are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.inner
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// The request shape the authorization core consumes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request method as received (e.g. `GET`).
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Decoded query parameters; the last value wins for repeated keys.
    pub query: HashMap<String, String>,
    pub headers: Headers,
    /// Remote address as a string.
    pub ip: String,
    /// Transport scheme (`http`, `https`, `ws`, `grpc`, ...).
    pub protocol: String,
    /// The validated keypoint, once attached.
    pub keypoint: Option<Keypoint>,
}

impl RequestContext {
    /// Build a context from a method and a path that may carry a query string.
    pub fn new(method: impl Into<String>, url: impl AsRef<str>) -> Self {
        let url = url.as_ref();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (url, HashMap::new()),
        };

        Self {
            method: method.into(),
            path: path.to_string(),
            query,
            headers: Headers::new(),
            ip: String::new(),
            protocol: "http".to_string(),
            keypoint: None,
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_keypoint(mut self, keypoint: Keypoint) -> Self {
        self.keypoint = Some(keypoint);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// The `Origin` header, if any.
    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    pub fn keypoint(&self) -> Option<&Keypoint> {
        self.keypoint.as_ref()
    }

    pub fn attach_keypoint(&mut self, keypoint: Keypoint) {
        self.keypoint = Some(keypoint);
    }

    /// Whether the attached keypoint satisfies `required`.
    ///
    /// Checks the keypoint's own grants (including wildcard patterns) and
    /// then the registry's inheritance graph. Always `false` without a
    /// keypoint.
    pub fn has_scope(&self, registry: &ScopeRegistry, required: &str) -> bool {
        self.keypoint.as_ref().is_some_and(|kp| {
            kp.has_scope(required) || registry.has_scope(&kp.scopes, required)
        })
    }

    /// Key used for per-caller bookkeeping: the keypoint id, else the IP.
    pub fn caller_key(&self) -> &str {
        self.keypoint
            .as_ref()
            .map(|kp| kp.key_id.as_str())
            .unwrap_or(self.ip.as_str())
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let ctx = RequestContext::new("GET", "/").with_header("X-Keypoint-Id", "k1");
        assert_eq!(ctx.header("x-keypoint-id"), Some("k1"));
        assert_eq!(ctx.header("X-KEYPOINT-ID"), Some("k1"));
        assert!(ctx.headers.contains("x-KeyPoint-id"));
    }

    #[test]
    fn query_string_is_split_and_decoded() {
        let ctx = RequestContext::new("GET", "/v1/items?keypointId=k%201&limit=5");
        assert_eq!(ctx.path, "/v1/items");
        assert_eq!(ctx.query_param("keypointId"), Some("k 1"));
        assert_eq!(ctx.query_param("limit"), Some("5"));
    }

    #[test]
    fn headers_from_iter() {
        let headers: Headers = [("Origin", "https://a.example"), ("ACCEPT", "*/*")]
            .into_iter()
            .collect();
        assert_eq!(headers.get("origin"), Some("https://a.example"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn scope_checks_need_a_keypoint() {
        let registry = ScopeRegistry::with_defaults();
        let ctx = RequestContext::new("GET", "/");
        assert!(!ctx.has_scope(&registry, "read"));

        let ctx = ctx.with_keypoint(Keypoint::new("k1", "s1").with_scopes(["admin"]));
        assert!(ctx.has_scope(&registry, "write"));
    }

    #[test]
    fn pattern_grants_count() {
        let registry = ScopeRegistry::new();
        let ctx = RequestContext::new("GET", "/")
            .with_keypoint(Keypoint::new("k1", "s1").with_scopes(["files:*"]));
        assert!(ctx.has_scope(&registry, "files:read"));
        assert!(!ctx.has_scope(&registry, "users:read"));
    }

    #[test]
    fn caller_key_prefers_keypoint() {
        let ctx = RequestContext::new("GET", "/").with_ip("10.0.0.1");
        assert_eq!(ctx.caller_key(), "10.0.0.1");
        let ctx = ctx.with_keypoint(Keypoint::new("k1", "s1"));
        assert_eq!(ctx.caller_key(), "k1");
    }
}
