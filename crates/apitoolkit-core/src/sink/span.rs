use super::EmissionSink;
use crate::error::{EmitError, EmitResult};
use crate::record::{SdkType, TelemetryRecord};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Name given to every exported span.
pub const SPAN_NAME: &str = "apitoolkit-http-span";

/// Attribute carrying the configured service name.
pub const SERVICE_NAME_ATTRIBUTE: &str = "service.name";

/// Value of a span attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Text attribute.
    String(String),
    /// Integer attribute.
    I64(i64),
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

/// What is known about a call when its span opens.
#[derive(Debug, Clone, Copy)]
pub struct SpanStart<'a> {
    /// Which layer observed the call.
    pub sdk_type: SdkType,
    /// Request method.
    pub method: &'a str,
    /// Path plus query.
    pub target: &'a str,
    /// Configured service name, possibly empty.
    pub service_name: &'a str,
    /// When the call started.
    pub started: SystemTime,
}

impl<'a> SpanStart<'a> {
    /// Reconstruct the start of an already-finished record.
    pub fn from_record(record: &'a TelemetryRecord) -> Self {
        Self {
            sdk_type: record.sdk_type,
            method: &record.method,
            target: &record.raw_url,
            service_name: "",
            started: SystemTime::now()
                .checked_sub(Duration::from_nanos(record.duration))
                .unwrap_or_else(SystemTime::now),
        }
    }
}

/// Keeps a span current until dropped.
pub struct SpanGuard {
    _entered: Option<Box<dyn Any>>,
}

impl SpanGuard {
    /// Hold `entered` until this guard is dropped.
    pub fn new<G: Any>(entered: G) -> Self {
        Self {
            _entered: Some(Box::new(entered)),
        }
    }

    /// A guard that holds nothing.
    pub fn none() -> Self {
        Self { _entered: None }
    }
}

impl std::fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanGuard")
            .field("entered", &self._entered.is_some())
            .finish()
    }
}

/// An open span that accepts attributes.
///
/// A handle is shared between the code that writes to it and the task that
/// runs inside it, so every method takes `&self`.
pub trait SpanHandle: Send + Sync {
    /// Set one attribute.
    fn set_attribute(&self, key: String, value: AttributeValue) -> Result<(), EmitError>;

    /// Attach an error to the span and mark it failed.
    fn record_exception(&self, error: &EmitError);

    /// End the span. Called exactly once.
    fn end(&self);

    /// Make this span the active one until the guard is dropped.
    fn enter(&self) -> SpanGuard {
        SpanGuard::none()
    }
}

/// Opens the span a call is written to.
pub type SpanFactory = Arc<dyn Fn(&SpanStart<'_>) -> Arc<dyn SpanHandle> + Send + Sync>;

/// A span opened when its call started. Ends when dropped.
pub struct OpenSpan {
    handle: Arc<dyn SpanHandle>,
    pub(super) route: Vec<usize>,
}

impl OpenSpan {
    /// Take ownership of an opened span.
    pub fn new(handle: Arc<dyn SpanHandle>) -> Self {
        Self {
            handle,
            route: Vec::new(),
        }
    }

    /// The span.
    pub fn handle(&self) -> &dyn SpanHandle {
        self.handle.as_ref()
    }

    /// A handle that can make this span current but never ends it.
    pub fn scope(&self) -> SpanScope {
        SpanScope {
            handle: self.handle.clone(),
        }
    }
}

impl Drop for OpenSpan {
    fn drop(&mut self) {
        self.handle.end();
    }
}

impl std::fmt::Debug for OpenSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSpan").finish_non_exhaustive()
    }
}

/// Enters an [`OpenSpan`] from the task running the call.
#[derive(Clone)]
pub struct SpanScope {
    handle: Arc<dyn SpanHandle>,
}

impl SpanScope {
    /// Make the span current until the guard is dropped.
    pub fn enter(&self) -> SpanGuard {
        self.handle.enter()
    }
}

impl std::fmt::Debug for SpanScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanScope").finish_non_exhaustive()
    }
}

fn json<T: Serialize>(value: &T) -> Result<AttributeValue, EmitError> {
    Ok(AttributeValue::String(serde_json::to_string(value)?))
}

/// The attributes a record is exported as.
///
/// Headers become one attribute each under `http.request.header.` and
/// `http.response.header.`.
pub fn span_attributes(
    record: &TelemetryRecord,
) -> Result<Vec<(String, AttributeValue)>, EmitError> {
    let mut attributes: Vec<(String, AttributeValue)> = vec![
        ("net.host.name".into(), record.host.as_str().into()),
        ("apitoolkit.msg_id".into(), record.msg_id.as_str().into()),
        ("apitoolkit.parent_id".into(), record.parent_id.as_str().into()),
        ("apitoolkit.sdk_type".into(), record.sdk_type.as_str().into()),
        ("apitoolkit.timestamp".into(), record.timestamp.as_str().into()),
        ("http.route".into(), record.url_path.as_str().into()),
        ("http.target".into(), record.raw_url.as_str().into()),
        ("http.request.method".into(), record.method.as_str().into()),
        (
            "http.response.status_code".into(),
            i64::from(record.status_code).into(),
        ),
        (
            "apitoolkit.duration_ns".into(),
            i64::try_from(record.duration).unwrap_or(i64::MAX).into(),
        ),
        ("http.request.referer".into(), record.referer.as_str().into()),
        ("http.request.query_params".into(), json(&record.query_params)?),
        ("http.request.path_params".into(), json(&record.path_params)?),
        ("http.request.body".into(), record.request_body.as_str().into()),
        ("http.response.body".into(), record.response_body.as_str().into()),
        ("apitoolkit.errors".into(), json(&record.errors)?),
        (
            "apitoolkit.service_version".into(),
            record.service_version.as_str().into(),
        ),
        ("apitoolkit.tags".into(), json(&record.tags)?),
    ];

    for (name, value) in &record.request_headers {
        attributes.push((format!("http.request.header.{name}"), value.as_str().into()));
    }
    for (name, value) in &record.response_headers {
        attributes.push((format!("http.response.header.{name}"), value.as_str().into()));
    }

    Ok(attributes)
}

/// Exports each call as one span.
///
/// Inside a [`Pipeline`](crate::Pipeline) the span opens when the call
/// starts and is current while the call runs, so spans the handler opens
/// nest under it. The record's attributes are written when the call
/// finishes. The span is ended on every path, including failures while
/// writing attributes, which are recorded on the span first.
#[derive(Clone)]
pub struct SpanExporter {
    factory: SpanFactory,
}

impl SpanExporter {
    /// Open spans with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&SpanStart<'_>) -> Arc<dyn SpanHandle> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl EmissionSink for SpanExporter {
    /// Export a record that was not opened through
    /// [`open_span`](EmissionSink::open_span). The span is backdated to the
    /// start of the call.
    fn emit(&self, record: &TelemetryRecord) -> EmitResult {
        let span = OpenSpan::new((self.factory)(&SpanStart::from_record(record)));
        self.emit_in_span(record, span)
    }

    fn open_span(&self, start: &SpanStart<'_>) -> Option<OpenSpan> {
        let span = OpenSpan::new((self.factory)(start));
        if !start.service_name.is_empty() {
            let name = AttributeValue::from(start.service_name);
            if let Err(error) = span.handle().set_attribute(SERVICE_NAME_ATTRIBUTE.into(), name) {
                span.handle().record_exception(&error);
            }
        }
        Some(span)
    }

    fn emit_in_span(&self, record: &TelemetryRecord, span: OpenSpan) -> EmitResult {
        let result = span_attributes(record).and_then(|attributes| {
            attributes
                .into_iter()
                .try_for_each(|(key, value)| span.handle().set_attribute(key, value))
        });

        if let Err(error) = &result {
            span.handle().record_exception(error);
        }
        result
    }
}

#[cfg(feature = "otel")]
mod otel {
    use super::*;
    use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
    use opentelemetry::{Context, KeyValue};

    /// A [`SpanHandle`] over an OpenTelemetry span.
    ///
    /// The span lives in its own [`Context`], which is what gets attached
    /// while the call runs.
    pub struct OtelSpan {
        cx: Context,
    }

    impl OtelSpan {
        /// Wrap an already-started span.
        pub fn new<S>(span: S) -> Self
        where
            S: opentelemetry::trace::Span + Send + Sync + 'static,
        {
            Self {
                cx: Context::current_with_span(span),
            }
        }

        /// The context carrying the span.
        pub fn context(&self) -> &Context {
            &self.cx
        }
    }

    impl SpanHandle for OtelSpan {
        fn set_attribute(&self, key: String, value: AttributeValue) -> Result<(), EmitError> {
            let attribute = match value {
                AttributeValue::String(s) => KeyValue::new(key, s),
                AttributeValue::I64(n) => KeyValue::new(key, n),
            };
            self.cx.span().set_attribute(attribute);
            Ok(())
        }

        fn record_exception(&self, error: &EmitError) {
            let span = self.cx.span();
            span.record_error(error);
            span.set_status(Status::error(error.to_string()));
        }

        fn end(&self) {
            self.cx.span().end();
        }

        fn enter(&self) -> SpanGuard {
            SpanGuard::new(self.cx.clone().attach())
        }
    }

    impl SpanExporter {
        /// Export spans through an OpenTelemetry tracer.
        ///
        /// Inbound calls become server spans and outbound calls client
        /// spans. A span's parent is whatever context is current when the
        /// call starts.
        pub fn from_tracer<T>(tracer: T) -> Self
        where
            T: Tracer + Send + Sync + 'static,
            T::Span: Send + Sync + 'static,
        {
            Self::new(move |start: &SpanStart<'_>| {
                let kind = match start.sdk_type {
                    SdkType::Inbound => SpanKind::Server,
                    SdkType::Outbound => SpanKind::Client,
                };
                let span = tracer
                    .span_builder(SPAN_NAME)
                    .with_kind(kind)
                    .with_start_time(start.started)
                    .start(&tracer);
                Arc::new(OtelSpan::new(span)) as Arc<dyn SpanHandle>
            })
        }
    }
}

#[cfg(feature = "otel")]
pub use otel::OtelSpan;
