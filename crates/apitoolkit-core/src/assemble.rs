//! Assembly of canonical telemetry records.
//!
//! [`assemble`] is pure: it redacts, derives route parameters, flattens query
//! parameters and stamps the record, but never performs I/O.

use crate::config::ApitoolkitConfig;
use crate::errors::ErrorRecord;
use crate::record::{format_timestamp, SdkType, TelemetryRecord, PROTO_MAJOR, PROTO_MINOR};
use crate::redact::RedactionSpec;
use crate::route::path_params_from_template;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, HeaderMap, Method, Uri};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything observed about one guarded call, before redaction.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    /// Request method.
    pub method: Method,
    /// Authority the request was addressed to.
    pub host: String,
    /// Path plus `?query` when a query is present.
    pub raw_url: String,
    /// Concrete request path.
    pub path: String,
    /// Matched route template, if known.
    pub route: Option<String>,
    /// Path parameters supplied by the router, if any.
    pub path_params: Option<BTreeMap<String, String>>,
    /// Query parameters with every value kept.
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Request headers as received.
    pub request_headers: HeaderMap,
    /// Response headers as sent.
    pub response_headers: HeaderMap,
    /// Response status.
    pub status_code: u16,
    /// Time from dispatch to the response head.
    pub duration: Duration,
    /// Retained request bytes.
    pub request_body: Bytes,
    /// Retained response bytes.
    pub response_body: Bytes,
    /// Correlation id of this exchange.
    pub msg_id: String,
    /// Correlation id of the enclosing guarded call.
    pub parent_id: Option<String>,
    /// Which layer observed the exchange.
    pub sdk_type: SdkType,
}

impl CapturedExchange {
    /// Start an exchange from the request line and headers.
    pub fn new(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        msg_id: impl Into<String>,
        sdk_type: SdkType,
    ) -> Self {
        let path = uri.path().to_string();
        let raw_url = match uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.clone(),
        };
        let host = uri
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Self {
            method: method.clone(),
            host,
            raw_url,
            path,
            route: None,
            path_params: None,
            query_params: uri.query().map(parse_query).unwrap_or_default(),
            request_headers: headers.clone(),
            response_headers: HeaderMap::new(),
            status_code: 0,
            duration: Duration::ZERO,
            request_body: Bytes::new(),
            response_body: Bytes::new(),
            msg_id: msg_id.into(),
            parent_id: None,
            sdk_type,
        }
    }
}

/// Split a query string into name → values.
///
/// `+` is read as a space, as in form encoding. A name with no `=` gets an
/// empty value.
pub fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let decode = |raw: &str| {
        let spaced = raw.replace('+', " ");
        urlencoding::decode(&spaced)
            .map(|v| v.into_owned())
            .unwrap_or(spaced)
    };

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.entry(decode(name)).or_default().push(decode(value));
    }
    params
}

/// Static per-service values stamped on every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMeta {
    /// Name of the observed service.
    pub service_name: String,
    /// Version of the observed service.
    pub service_version: String,
    /// Free-form service tags.
    pub tags: Vec<String>,
    /// Project id obtained at registration; empty when not registered.
    pub project_id: String,
}

impl ServiceMeta {
    /// Take the service fields from configuration.
    pub fn from_config(config: &ApitoolkitConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
            tags: config.tags.clone(),
            project_id: String::new(),
        }
    }

    /// Set the project id.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }
}

/// Turn a captured exchange into its canonical record.
pub fn assemble(
    exchange: CapturedExchange,
    errors: Vec<ErrorRecord>,
    redaction: &RedactionSpec,
    meta: &ServiceMeta,
) -> TelemetryRecord {
    let path_params = match (exchange.path_params, &exchange.route) {
        (Some(params), _) => params,
        (None, Some(template)) => path_params_from_template(template, &exchange.path),
        (None, None) => BTreeMap::new(),
    };

    let query_params = exchange
        .query_params
        .into_iter()
        .map(|(name, values)| (name, values.join(", ")))
        .collect();

    let referer = exchange
        .request_headers
        .get(header::REFERER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();

    TelemetryRecord {
        timestamp: format_timestamp(chrono::Utc::now()),
        msg_id: exchange.msg_id,
        parent_id: exchange.parent_id.unwrap_or_default(),
        project_id: meta.project_id.clone(),
        method: exchange.method.as_str().to_string(),
        host: exchange.host,
        referer,
        raw_url: exchange.raw_url,
        url_path: exchange.route.unwrap_or(exchange.path),
        query_params,
        path_params,
        duration: u64::try_from(exchange.duration.as_nanos()).unwrap_or(u64::MAX),
        status_code: exchange.status_code,
        request_headers: redaction.redact_headers(&exchange.request_headers),
        response_headers: redaction.redact_headers(&exchange.response_headers),
        request_body: STANDARD.encode(redaction.redact_request_body(&exchange.request_body)),
        response_body: STANDARD.encode(redaction.redact_response_body(&exchange.response_body)),
        errors,
        sdk_type: exchange.sdk_type,
        service_version: meta.service_version.clone(),
        tags: meta.tags.clone(),
        proto_major: PROTO_MAJOR,
        proto_minor: PROTO_MINOR,
    }
}

/// [`assemble`] bound to a shared redaction spec and service metadata.
#[derive(Debug, Clone)]
pub struct EventAssembler {
    redaction: Arc<RedactionSpec>,
    meta: ServiceMeta,
}

impl EventAssembler {
    /// Create an assembler.
    pub fn new(redaction: RedactionSpec, meta: ServiceMeta) -> Self {
        Self {
            redaction: Arc::new(redaction),
            meta,
        }
    }

    /// Build an assembler from configuration.
    pub fn from_config(config: &ApitoolkitConfig) -> Self {
        Self::new(config.redaction_spec(), ServiceMeta::from_config(config))
    }

    /// Set the project id stamped on records.
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.meta.project_id = project_id.into();
        self
    }

    /// The redaction settings in use.
    pub fn redaction(&self) -> &RedactionSpec {
        &self.redaction
    }

    /// The service metadata in use.
    pub fn meta(&self) -> &ServiceMeta {
        &self.meta
    }

    /// Assemble one record.
    pub fn assemble(&self, exchange: CapturedExchange, errors: Vec<ErrorRecord>) -> TelemetryRecord {
        assemble(exchange, errors, &self.redaction, &self.meta)
    }
}
