//! Emission sinks.
//!
//! A sink receives each finished [`TelemetryRecord`]. The pipeline treats
//! every sink the same way: a returned error is logged when debug is on and
//! otherwise dropped, and never reaches the guarded call.
//!
//! Two sinks ship with the crate:
//!
//! - [`QueuePublisher`] serializes the record and publishes it to a topic
//!   without waiting for the acknowledgement.
//! - [`SpanExporter`] opens a span when the call starts, writes the record
//!   as attributes on it and ends it.

mod queue;
mod span;

pub use queue::{InMemoryTopic, QueuePublisher, TopicPublisher};
pub use span::{
    span_attributes, AttributeValue, OpenSpan, SpanExporter, SpanFactory, SpanGuard, SpanHandle,
    SpanScope, SpanStart, SERVICE_NAME_ATTRIBUTE, SPAN_NAME,
};

#[cfg(feature = "otel")]
pub use span::OtelSpan;

use crate::error::EmitResult;
use crate::record::TelemetryRecord;
use std::sync::Arc;

/// Destination for finished records.
pub trait EmissionSink: Send + Sync + 'static {
    /// Hand off one record. Must not block on network I/O.
    fn emit(&self, record: &TelemetryRecord) -> EmitResult;

    /// Open the span a call will be written to, as the call starts.
    ///
    /// Sinks that do not write spans keep the default and return `None`.
    fn open_span(&self, _start: &SpanStart<'_>) -> Option<OpenSpan> {
        None
    }

    /// Hand off a record together with the span opened for its call.
    fn emit_in_span(&self, record: &TelemetryRecord, span: OpenSpan) -> EmitResult {
        drop(span);
        self.emit(record)
    }
}

impl<T: EmissionSink + ?Sized> EmissionSink for Arc<T> {
    fn emit(&self, record: &TelemetryRecord) -> EmitResult {
        (**self).emit(record)
    }

    fn open_span(&self, start: &SpanStart<'_>) -> Option<OpenSpan> {
        (**self).open_span(start)
    }

    fn emit_in_span(&self, record: &TelemetryRecord, span: OpenSpan) -> EmitResult {
        (**self).emit_in_span(record, span)
    }
}

impl<T: EmissionSink + ?Sized> EmissionSink for Box<T> {
    fn emit(&self, record: &TelemetryRecord) -> EmitResult {
        (**self).emit(record)
    }

    fn open_span(&self, start: &SpanStart<'_>) -> Option<OpenSpan> {
        (**self).open_span(start)
    }

    fn emit_in_span(&self, record: &TelemetryRecord, span: OpenSpan) -> EmitResult {
        (**self).emit_in_span(record, span)
    }
}

/// A sink that discards everything. Used when provisioning failed and the
/// operator chose to keep running.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EmissionSink for NullSink {
    fn emit(&self, _record: &TelemetryRecord) -> EmitResult {
        Ok(())
    }
}

/// Callback invoked for each record.
pub type RecordCallback = Arc<dyn Fn(&TelemetryRecord) + Send + Sync>;

/// A sink that calls a closure.
///
/// ```ignore
/// let sink = CallbackSink::new(|record| {
///     if record.status_code >= 500 {
///         tracing::warn!(msg_id = %record.msg_id, "server error observed");
///     }
/// });
/// ```
#[derive(Clone)]
pub struct CallbackSink {
    callback: RecordCallback,
}

impl CallbackSink {
    /// Create a sink around `callback`.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&TelemetryRecord) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl EmissionSink for CallbackSink {
    fn emit(&self, record: &TelemetryRecord) -> EmitResult {
        (self.callback)(record);
        Ok(())
    }
}

/// A sink that forwards to several others.
///
/// Every sink sees every record; the first error is returned after all of
/// them ran. Only the first sink that opens spans gets one per call.
#[derive(Clone, Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn EmissionSink>>,
}

impl CompositeSink {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with_sink<S: EmissionSink>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EmissionSink for CompositeSink {
    fn emit(&self, record: &TelemetryRecord) -> EmitResult {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(error) = sink.emit(record) {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn open_span(&self, start: &SpanStart<'_>) -> Option<OpenSpan> {
        self.sinks.iter().enumerate().find_map(|(index, sink)| {
            let mut span = sink.open_span(start)?;
            span.route.push(index);
            Some(span)
        })
    }

    fn emit_in_span(&self, record: &TelemetryRecord, mut span: OpenSpan) -> EmitResult {
        let owner = span.route.pop();
        let mut span = Some(span);
        let mut first_error = None;
        for (index, sink) in self.sinks.iter().enumerate() {
            let owned = if owner == Some(index) { span.take() } else { None };
            let result = match owned {
                Some(span) => sink.emit_in_span(record, span),
                None => sink.emit(record),
            };
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::EmitError;
    use crate::record::{SdkType, PROTO_MAJOR, PROTO_MINOR};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn sample_record() -> TelemetryRecord {
        TelemetryRecord {
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            msg_id: "m-1".into(),
            parent_id: String::new(),
            project_id: "p".into(),
            method: "GET".into(),
            host: "example.com".into(),
            referer: String::new(),
            raw_url: "/users/1?x=y".into(),
            url_path: "/users/{id}".into(),
            query_params: [("x".to_string(), "y".to_string())].into(),
            path_params: [("id".to_string(), "1".to_string())].into(),
            duration: 1_500,
            status_code: 200,
            request_headers: [("accept".to_string(), "*/*".to_string())].into(),
            response_headers: [("content-type".to_string(), "text/plain".to_string())].into(),
            request_body: String::new(),
            response_body: "aGk=".into(),
            errors: Vec::new(),
            sdk_type: SdkType::Inbound,
            service_version: "1.0".into(),
            tags: vec!["t".into()],
            proto_major: PROTO_MAJOR,
            proto_minor: PROTO_MINOR,
        }
    }

    struct Failing;

    impl EmissionSink for Failing {
        fn emit(&self, _record: &TelemetryRecord) -> EmitResult {
            Err(EmitError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_callback_sink_sees_record() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = CallbackSink::new({
            let seen = seen.clone();
            move |r| seen.lock().unwrap().push(r.msg_id.clone())
        });

        sink.emit(&sample_record()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["m-1"]);
    }

    #[test]
    fn test_composite_runs_every_sink() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = {
            let count = count.clone();
            CallbackSink::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let sink = CompositeSink::new()
            .with_sink(Failing)
            .with_sink(counter)
            .with_sink(NullSink);

        let result = sink.emit(&sample_record());

        assert!(matches!(result, Err(EmitError::Unavailable(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_composite_routes_span_to_its_opener() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let spans = SpanExporter::new({
            let events = events.clone();
            move |_: &SpanStart<'_>| {
                events.lock().unwrap().push("open");
                Arc::new(EventSpan(events.clone())) as Arc<dyn SpanHandle>
            }
        });
        let sink = CompositeSink::new()
            .with_sink(NullSink)
            .with_sink(CompositeSink::new().with_sink(spans));
        let record = sample_record();

        let span = sink.open_span(&SpanStart::from_record(&record)).unwrap();
        events.lock().unwrap().push("call");
        sink.emit_in_span(&record, span).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&"open"));
        assert_eq!(events[1], "call");
        assert!(events[2..].contains(&"attribute"));
        assert_eq!(events.last(), Some(&"end"));
        assert_eq!(events.iter().filter(|e| **e == "open").count(), 1);
    }

    struct EventSpan(Arc<Mutex<Vec<&'static str>>>);

    impl SpanHandle for EventSpan {
        fn set_attribute(&self, _key: String, _value: AttributeValue) -> Result<(), EmitError> {
            self.0.lock().unwrap().push("attribute");
            Ok(())
        }

        fn record_exception(&self, _error: &EmitError) {
            self.0.lock().unwrap().push("exception");
        }

        fn end(&self) {
            self.0.lock().unwrap().push("end");
        }
    }
}
