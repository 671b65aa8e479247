use apitoolkit_core::capture::CaptureBody;
use apitoolkit_core::prelude::*;
use apitoolkit_core::{EmitError, EmitResult};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tower::{Layer, ServiceExt};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

/// Collects every event as (level, message).
#[derive(Clone, Default)]
struct EventCapture {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl EventCapture {
    fn at(&self, level: Level) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

struct FailingSink;

impl EmissionSink for FailingSink {
    fn emit(&self, _record: &TelemetryRecord) -> EmitResult {
        Err(EmitError::Unavailable("collector offline".to_string()))
    }
}

async fn run_once(pipeline: Pipeline) {
    let service = pipeline.inbound_layer().layer(tower::service_fn(
        |_req: Request<CaptureBody<Full<Bytes>>>| async {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("ok"))))
        },
    ));
    let response = service
        .oneshot(Request::new(Full::new(Bytes::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.into_body().collect().await.unwrap();
}

#[tokio::test]
async fn emit_failures_are_logged_in_debug_mode() {
    let capture = EventCapture::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    run_once(Pipeline::new(&ApitoolkitConfig::new().debug(true), FailingSink)).await;

    assert_eq!(capture.at(Level::ERROR), vec!["failed to emit telemetry record"]);
}

#[tokio::test]
async fn emit_failures_are_quiet_without_debug() {
    let capture = EventCapture::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    run_once(Pipeline::new(&ApitoolkitConfig::new(), FailingSink)).await;

    assert!(capture.at(Level::ERROR).is_empty());
    assert!(capture.at(Level::WARN).is_empty());
    assert_eq!(capture.at(Level::TRACE), vec!["failed to emit telemetry record"]);
}

#[test]
fn skipped_redaction_paths_warn_in_debug_mode() {
    let capture = EventCapture::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let config = ApitoolkitConfig::new()
        .debug(true)
        .redact_request_body(["$.ok", "$.[broken"]);
    assert!(config.validate().is_err());
    let spec = config.redaction_spec();

    assert_eq!(spec.request_paths().len(), 1);
    assert_eq!(capture.at(Level::WARN), vec!["skipping redaction path"]);
}

#[test]
fn skipped_redaction_paths_are_quiet_without_debug() {
    let capture = EventCapture::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let spec = ApitoolkitConfig::new()
        .redact_request_body(["$.ok", "$.[broken"])
        .redaction_spec();

    assert_eq!(spec.request_paths().len(), 1);
    assert!(capture.at(Level::WARN).is_empty());
    assert_eq!(capture.at(Level::TRACE), vec!["skipping redaction path"]);
}
