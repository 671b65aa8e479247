//! Header and body redaction.
//!
//! Redaction happens before a record leaves the process. Headers are matched
//! by name; bodies are parsed as JSON and redacted structurally with
//! [`JsonPath`] expressions, so a field name that merely appears inside a
//! string value is never touched.
//!
//! Body redaction is fail-open: empty input, an empty path list, a payload
//! that is not JSON, or paths that do not resolve all leave the bytes exactly
//! as they were.

use crate::json_path::{JsonPath, PathError};
use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

/// Marker written in place of every redacted value.
pub const REDACTED: &str = "[CLIENT_REDACTED]";

/// Header names that are always redacted, whatever the configuration says.
pub const ALWAYS_REDACTED_HEADERS: [&str; 2] = ["cookies", "authorization"];

/// What to hide from emitted records.
///
/// Built once from configuration and shared read-only across requests.
#[derive(Debug, Clone, Default)]
pub struct RedactionSpec {
    headers: HashSet<String>,
    request_paths: Vec<JsonPath>,
    response_paths: Vec<JsonPath>,
    rejected: Vec<PathError>,
}

impl RedactionSpec {
    /// Create a spec that only redacts the built-in headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a spec from raw header names and path expressions.
    ///
    /// Paths that fail to parse are dropped and kept in
    /// [`rejected_paths`](Self::rejected_paths); the remaining paths still
    /// apply.
    pub fn from_lists<H, P, Q>(headers: H, request_paths: P, response_paths: Q) -> Self
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
        Q: IntoIterator,
        Q::Item: AsRef<str>,
    {
        let mut rejected = Vec::new();
        Self {
            headers: headers
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            request_paths: compile_paths(request_paths, &mut rejected),
            response_paths: compile_paths(response_paths, &mut rejected),
            rejected,
        }
    }

    /// Add a header name to redact.
    pub fn header(mut self, name: impl AsRef<str>) -> Self {
        self.headers.insert(name.as_ref().to_ascii_lowercase());
        self
    }

    /// Add a request body path. Invalid paths are not applied.
    pub fn request_path(mut self, path: impl AsRef<str>) -> Self {
        let paths = compile_paths([path], &mut self.rejected);
        self.request_paths.extend(paths);
        self
    }

    /// Add a response body path. Invalid paths are not applied.
    pub fn response_path(mut self, path: impl AsRef<str>) -> Self {
        let paths = compile_paths([path], &mut self.rejected);
        self.response_paths.extend(paths);
        self
    }

    /// Parse errors of the paths that were left out.
    pub fn rejected_paths(&self) -> &[PathError] {
        &self.rejected
    }

    /// Compiled request body paths, in configuration order.
    pub fn request_paths(&self) -> &[JsonPath] {
        &self.request_paths
    }

    /// Compiled response body paths, in configuration order.
    pub fn response_paths(&self) -> &[JsonPath] {
        &self.response_paths
    }

    /// Whether a header with this name is redacted.
    pub fn is_sensitive_header(&self, name: &str) -> bool {
        ALWAYS_REDACTED_HEADERS
            .iter()
            .any(|builtin| name.eq_ignore_ascii_case(builtin))
            || self.headers.contains(&name.to_ascii_lowercase())
    }

    /// Redact a single header value.
    pub fn redact_header<'a>(&self, name: &str, value: &'a str) -> Cow<'a, str> {
        if self.is_sensitive_header(name) {
            Cow::Borrowed(REDACTED)
        } else {
            Cow::Borrowed(value)
        }
    }

    /// Flatten and redact a header map.
    ///
    /// Names are lowercased, repeated headers are joined with `", "`, and
    /// values that are not valid UTF-8 are decoded lossily.
    pub fn redact_headers(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for name in headers.keys() {
            let joined = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()))
                .collect::<Vec<_>>()
                .join(", ");
            let value = self.redact_header(name.as_str(), &joined).into_owned();
            out.insert(name.as_str().to_string(), value);
        }
        out
    }

    /// Redact a request body with the request paths.
    pub fn redact_request_body(&self, body: &Bytes) -> Bytes {
        redact_body(body, &self.request_paths)
    }

    /// Redact a response body with the response paths.
    pub fn redact_response_body(&self, body: &Bytes) -> Bytes {
        redact_body(body, &self.response_paths)
    }
}

fn compile_paths<P>(paths: P, rejected: &mut Vec<PathError>) -> Vec<JsonPath>
where
    P: IntoIterator,
    P::Item: AsRef<str>,
{
    paths
        .into_iter()
        .filter(|raw| !raw.as_ref().trim().is_empty())
        .filter_map(|raw| match JsonPath::parse(raw.as_ref()) {
            Ok(path) => Some(path),
            Err(error) => {
                rejected.push(error);
                None
            }
        })
        .collect()
}

/// Replace every position matched by `paths` with [`REDACTED`].
///
/// Returns `body` unchanged when it is empty, when `paths` is empty, when it
/// is not valid JSON, or when no path matched.
pub fn redact_body(body: &Bytes, paths: &[JsonPath]) -> Bytes {
    if body.is_empty() || paths.is_empty() {
        return body.clone();
    }

    let mut document: Value = match serde_json::from_slice(body) {
        Ok(document) => document,
        Err(error) => {
            tracing::trace!(%error, "body is not JSON, leaving it unredacted");
            return body.clone();
        }
    };

    let marker = Value::String(REDACTED.to_string());
    let replaced: usize = paths
        .iter()
        .map(|path| path.replace_all(&mut document, &marker))
        .sum();
    if replaced == 0 {
        return body.clone();
    }

    match serde_json::to_vec(&document) {
        Ok(encoded) => Bytes::from(encoded),
        Err(error) => {
            tracing::trace!(%error, "redacted body could not be re-encoded");
            body.clone()
        }
    }
}
