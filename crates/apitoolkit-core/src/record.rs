//! The canonical telemetry record.
//!
//! This is the single contract between the pipeline and every emission sink.
//! Field names are the wire names of the queue format.

use crate::errors::ErrorRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Protocol version reported in every record. The pipeline does not observe
/// the transport version.
pub const PROTO_MAJOR: u8 = 1;
/// See [`PROTO_MAJOR`].
pub const PROTO_MINOR: u8 = 1;

/// Format a UTC instant as ISO-8601 with millisecond precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Which side of the integration produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdkType {
    /// An inbound request observed by the server layer.
    #[serde(rename = "RustTower")]
    Inbound,
    /// An outbound call observed by the client layer.
    #[serde(rename = "RustTowerOutgoing")]
    Outbound,
}

impl SdkType {
    /// Wire name of this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            SdkType::Inbound => "RustTower",
            SdkType::Outbound => "RustTowerOutgoing",
        }
    }
}

impl fmt::Display for SdkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed exchange, ready to emit.
///
/// Constructed once by the assembler and never mutated afterwards. Bodies are
/// base64 of the redacted bytes, empty when capture is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Assembly time, UTC, millisecond precision.
    pub timestamp: String,
    /// Correlation id of this exchange.
    pub msg_id: String,
    /// Empty when the exchange had no enclosing guarded call.
    pub parent_id: String,
    /// Project the record belongs to; empty for span output.
    pub project_id: String,
    /// Request method.
    pub method: String,
    /// Host the request was addressed to.
    pub host: String,
    /// `Referer` header, empty when absent.
    pub referer: String,
    /// Path plus `?query` when a query is present.
    pub raw_url: String,
    /// Matched route template, or the concrete path when nothing matched.
    pub url_path: String,
    /// Query parameters, repeated values joined with `", "`.
    pub query_params: BTreeMap<String, String>,
    /// Path parameters bound by the route.
    pub path_params: BTreeMap<String, String>,
    /// Nanoseconds.
    pub duration: u64,
    /// Response status.
    pub status_code: u16,
    /// Redacted request headers, lowercase names.
    pub request_headers: BTreeMap<String, String>,
    /// Redacted response headers, lowercase names.
    pub response_headers: BTreeMap<String, String>,
    /// Base64 of the redacted request body.
    pub request_body: String,
    /// Base64 of the redacted response body.
    pub response_body: String,
    /// Errors reported during the exchange.
    pub errors: Vec<ErrorRecord>,
    /// Which layer produced the record.
    pub sdk_type: SdkType,
    /// Configured service version.
    pub service_version: String,
    /// Configured service tags.
    pub tags: Vec<String>,
    /// Always [`PROTO_MAJOR`].
    pub proto_major: u8,
    /// Always [`PROTO_MINOR`].
    pub proto_minor: u8,
}

impl TelemetryRecord {
    /// Compact JSON encoding used on the queue.
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
