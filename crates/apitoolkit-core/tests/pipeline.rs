use apitoolkit_core::capture::CaptureBody;
use apitoolkit_core::pipeline::CANCELLED_STATUS;
use apitoolkit_core::prelude::*;
use apitoolkit_core::SdkType;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::{Layer, ServiceExt};

type Records = Arc<Mutex<Vec<TelemetryRecord>>>;
type Req = Request<CaptureBody<Full<Bytes>>>;

fn collecting_pipeline(config: ApitoolkitConfig) -> (Pipeline, Records) {
    let records: Records = Arc::new(Mutex::new(Vec::new()));
    let sink = CallbackSink::new({
        let records = records.clone();
        move |record| records.lock().unwrap().push(record.clone())
    });
    (Pipeline::new(&config, sink), records)
}

#[derive(Debug)]
struct Timeout;

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("query timed out after 5s")
    }
}

impl StdError for Timeout {}

#[derive(Debug)]
struct QueryFailed {
    source: Timeout,
}

impl fmt::Display for QueryFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("query failed")
    }
}

impl StdError for QueryFailed {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
struct HandlerError {
    source: QueryFailed,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("could not load orders")
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

#[tokio::test]
async fn failing_handler_emits_one_record_and_propagates() {
    let (pipeline, records) = collecting_pipeline(ApitoolkitConfig::new());
    let service = pipeline
        .inbound_layer()
        .layer(tower::service_fn(|_req: Req| async {
            Err::<Response<Full<Bytes>>, _>(HandlerError {
                source: QueryFailed { source: Timeout },
            })
        }));

    let err = service
        .oneshot(Request::get("/orders").body(Full::new(Bytes::new())).unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "could not load orders");
    let records = records.lock().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status_code, 500);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(record.errors[0].error_type, "HandlerError");
    assert_eq!(record.errors[0].root_error_type, "Timeout");
    assert_eq!(record.errors[0].root_error_message, "query timed out after 5s");
}

#[tokio::test]
async fn reported_errors_do_not_fail_the_request() {
    let (pipeline, records) = collecting_pipeline(ApitoolkitConfig::new());
    let service = pipeline
        .inbound_layer()
        .layer(tower::service_fn(|_req: Req| async {
            apitoolkit_core::context::report(&QueryFailed { source: Timeout });
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("partial"))))
        }));

    let response = service
        .oneshot(Request::new(Full::new(Bytes::new())))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    response.into_body().collect().await.unwrap();

    let records = records.lock().unwrap();
    assert_eq!(records[0].status_code, 200);
    assert_eq!(records[0].errors[0].error_type, "QueryFailed");
    assert_eq!(records[0].errors[0].root_error_type, "Timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_isolated() {
    let (pipeline, records) = collecting_pipeline(ApitoolkitConfig::new());
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let service = pipeline.inbound_layer().layer(tower::service_fn({
        let barrier = barrier.clone();
        move |req: Req| {
            let barrier = barrier.clone();
            async move {
                let ctx = RequestContext::current().unwrap();
                let count: usize = req.uri().path().trim_start_matches('/').parse().unwrap();
                for _ in 0..count {
                    ctx.report(&Timeout);
                    barrier.wait().await;
                }
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(
                    ctx.msg_id().to_string(),
                ))))
            }
        }
    }));

    let run = |path: &'static str| {
        let service = service.clone();
        tokio::spawn(async move {
            let response = service
                .oneshot(Request::get(path).body(Full::new(Bytes::new())).unwrap())
                .await
                .unwrap();
            response.into_body().collect().await.unwrap().to_bytes()
        })
    };
    let (a, b) = tokio::join!(run("/2"), run("/2"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a, b);
    let records = records.lock().unwrap();
    assert_eq!(records.len(), 2);
    for record in records.iter() {
        assert_eq!(record.errors.len(), 2);
        assert!(record.msg_id.as_bytes() == a.as_ref() || record.msg_id.as_bytes() == b.as_ref());
    }
    assert_ne!(records[0].msg_id, records[1].msg_id);
}

#[tokio::test]
async fn nested_outbound_call_links_to_inbound() {
    let (pipeline, records) = collecting_pipeline(ApitoolkitConfig::new());
    let client = pipeline
        .outbound_layer()
        .layer(tower::service_fn(|_req: Req| async {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("remote"))))
        }));
    let service = pipeline.inbound_layer().layer(tower::service_fn(move |_req: Req| {
        let client = client.clone();
        async move {
            let remote = client
                .oneshot(
                    Request::get("http://inventory.internal/items/1")
                        .body(Full::new(Bytes::new()))
                        .unwrap(),
                )
                .await?;
            let body = remote.into_body().collect().await.unwrap().to_bytes();
            Ok::<_, Infallible>(Response::new(Full::new(body)))
        }
    }));

    let response = service
        .oneshot(Request::get("/checkout").body(Full::new(Bytes::new())).unwrap())
        .await
        .unwrap();
    response.into_body().collect().await.unwrap();

    let records = records.lock().unwrap();
    assert_eq!(records.len(), 2);
    let outbound = records
        .iter()
        .find(|r| r.sdk_type == SdkType::Outbound)
        .unwrap();
    let inbound = records
        .iter()
        .find(|r| r.sdk_type == SdkType::Inbound)
        .unwrap();
    assert_eq!(outbound.parent_id, inbound.msg_id);
    assert_eq!(outbound.host, "inventory.internal");
    assert_eq!(inbound.parent_id, "");
}

#[tokio::test]
async fn cancelled_request_still_emits_once() {
    let (pipeline, records) = collecting_pipeline(ApitoolkitConfig::new());
    let service = pipeline
        .inbound_layer()
        .layer(tower::service_fn(|_req: Req| async {
            std::future::pending::<()>().await;
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
        }));

    let call = service.oneshot(Request::get("/slow").body(Full::new(Bytes::new())).unwrap());
    let outcome = tokio::time::timeout(Duration::from_millis(20), call).await;

    assert!(outcome.is_err());
    let records = records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, CANCELLED_STATUS);
    assert_eq!(records[0].url_path, "/slow");
}

#[tokio::test]
async fn queue_publisher_receives_wire_record() {
    let topic = InMemoryTopic::new();
    let config = ApitoolkitConfig::new()
        .capture_request_body(true)
        .service_version("2.1.0")
        .tags(["canary"]);
    let pipeline = Pipeline::new(&config, QueuePublisher::new(topic.clone()));
    let service = pipeline.inbound_layer().layer(tower::service_fn(|req: Req| async {
        let body = req.into_body().collect().await.unwrap().to_bytes();
        Ok::<_, Infallible>(Response::new(Full::new(body)))
    }));

    let response = service
        .oneshot(
            Request::post("/login")
                .header("cookies", "session=1")
                .body(Full::new(Bytes::from(r#"{"email":"a@b.c","remember":true}"#)))
                .unwrap(),
        )
        .await
        .unwrap();
    response.into_body().collect().await.unwrap();

    let records = topic.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.service_version, "2.1.0");
    assert_eq!(record.tags, vec!["canary"]);
    assert_eq!(record.request_headers["cookies"], "[CLIENT_REDACTED]");
    assert_eq!(record.response_body, "");

    let raw: serde_json::Value = serde_json::from_slice(&topic.messages()[0]).unwrap();
    assert!(raw["errors"].is_array());
    assert_eq!(raw["proto_major"], 1);
}
