use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};

type GenericError = Box<dyn std::error::Error + Send + Sync>;
type Result<T> = std::result::Result<T, GenericError>;

/// Path of the registration endpoint.
pub const METADATA_PATH: &str = "/api/client_metadata";

/// Path of the token endpoint advertised in the served credentials.
pub const TOKEN_PATH: &str = "/token";

/// Access token handed out by the token endpoint.
pub const ACCESS_TOKEN: &str = "mock-access-token";

/// What the collector answers at registration.
#[derive(Debug, Clone)]
pub struct CollectorSetup {
    /// API key the registration endpoint accepts.
    pub api_key: String,
    /// Project id returned at registration.
    pub project_id: String,
    /// Pub/Sub project returned at registration.
    pub pubsub_project_id: String,
    /// Topic returned at registration.
    pub topic_id: String,
    /// Service account email in the served credentials.
    pub client_email: String,
    /// PEM private key in the served credentials. `None` serves emulator
    /// credentials.
    pub private_key: Option<String>,
    /// Seconds until handed-out tokens expire.
    pub token_ttl: u64,
}

impl Default for CollectorSetup {
    fn default() -> Self {
        Self {
            api_key: "test-api-key".to_string(),
            project_id: "00000000-0000-0000-0000-000000000001".to_string(),
            pubsub_project_id: "pubsub-project".to_string(),
            topic_id: "apitoolkit-go-client".to_string(),
            client_email: "publisher@pubsub-project.iam.gserviceaccount.com".to_string(),
            private_key: None,
            token_ttl: 3600,
        }
    }
}

impl CollectorSetup {
    /// Set the accepted API key.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    /// Serve credentials with a private key, enabling token exchange.
    pub fn private_key(mut self, pem: impl Into<String>) -> Self {
        self.private_key = Some(pem.into());
        self
    }

    /// Set the token lifetime in seconds.
    pub fn token_ttl(mut self, seconds: u64) -> Self {
        self.token_ttl = seconds;
        self
    }
}

/// A request the collector received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: http::HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl RecordedRequest {
    /// The `Authorization` header, if present.
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct CollectorState {
    requests: Vec<RecordedRequest>,
    published: Vec<Bytes>,
    assertions: Vec<String>,
    registration_status: Option<StatusCode>,
    publish_status: Option<StatusCode>,
}

struct Shared {
    setup: CollectorSetup,
    base_url: String,
    state: Mutex<CollectorState>,
    published: Notify,
}

/// An in-process stand-in for the APIToolkit registration endpoint, an
/// OAuth token endpoint and the Pub/Sub publish API.
///
/// ```ignore
/// let collector = MockCollector::start().await;
/// let config = ApitoolkitConfig::new()
///     .api_key("test-api-key")
///     .root_url(collector.base_url())
///     .pubsub_endpoint(collector.base_url());
/// ```
pub struct MockCollector {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockCollector {
    /// Start a collector with default answers on a random port.
    pub async fn start() -> Self {
        Self::start_with(CollectorSetup::default()).await
    }

    /// Start a collector with custom answers on a random port.
    pub async fn start_with(setup: CollectorSetup) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock collector");
        let addr = listener.local_addr().expect("listener has no address");

        let shared = Arc::new(Shared {
            setup,
            base_url: format!("http://{addr}"),
            state: Mutex::new(CollectorState::default()),
            published: Notify::new(),
        });

        let server_shared = shared.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let shared = server_shared.clone();

                                tokio::spawn(async move {
                                    let service = service_fn(move |req| handle(req, shared.clone()));
                                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(
                                        hyper_util::rt::TokioExecutor::new(),
                                    )
                                    .serve_connection(io, service)
                                    .await
                                    {
                                        tracing::debug!(error = ?err, "mock collector connection ended");
                                    }
                                });
                            }
                            Err(e) => tracing::debug!(error = %e, "mock collector accept failed"),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Base URL, usable as both the registration root and the Pub/Sub
    /// endpoint.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The answers this collector was started with.
    pub fn setup(&self) -> &CollectorSetup {
        &self.shared.setup
    }

    /// Make the registration endpoint answer with `status`.
    pub fn fail_registration(&self, status: StatusCode) {
        self.lock().registration_status = Some(status);
    }

    /// Make the publish endpoint answer with `status`.
    pub fn reject_publishes(&self, status: StatusCode) {
        self.lock().publish_status = Some(status);
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Requests received on `path`.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// JWT assertions presented to the token endpoint.
    pub fn token_assertions(&self) -> Vec<String> {
        self.lock().assertions.clone()
    }

    /// Decoded message payloads accepted by the publish endpoint.
    pub fn published(&self) -> Vec<Bytes> {
        self.lock().published.clone()
    }

    /// Published payloads parsed as JSON.
    pub fn published_json(&self) -> Vec<Value> {
        self.published()
            .iter()
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }

    /// Wait until `count` payloads were published or `timeout` passed.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.published.notified();
            if self.lock().published.len() >= count {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.published()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CollectorState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Deserialize)]
struct PublishBody {
    messages: Vec<PublishMessage>,
}

#[derive(Deserialize)]
struct PublishMessage {
    data: String,
}

fn json_response(status: StatusCode, body: Value) -> Result<Response<Full<Bytes>>> {
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&body)?)))?)
}

async fn handle(req: Request<hyper::body::Incoming>, shared: Arc<Shared>) -> Result<Response<Full<Bytes>>> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let recorded = RecordedRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        headers: parts.headers.clone(),
        body: body.clone(),
    };

    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    state.requests.push(recorded.clone());

    let path = parts.uri.path();
    if parts.method == Method::GET && path == METADATA_PATH {
        if let Some(status) = state.registration_status {
            return json_response(status, json!({"error": "registration disabled"}));
        }
        let expected = format!("Bearer {}", shared.setup.api_key);
        if recorded.authorization() != Some(expected.as_str()) {
            return json_response(StatusCode::UNAUTHORIZED, json!({"error": "invalid api key"}));
        }
        let setup = &shared.setup;
        let mut account = json!({
            "type": "service_account",
            "project_id": setup.pubsub_project_id,
            "client_email": setup.client_email,
            "token_uri": format!("{}{}", shared.base_url, TOKEN_PATH),
        });
        if let Some(key) = &setup.private_key {
            account["private_key"] = Value::String(key.clone());
        }
        return json_response(
            StatusCode::OK,
            json!({
                "project_id": setup.project_id,
                "pubsub_project_id": setup.pubsub_project_id,
                "topic_id": setup.topic_id,
                "pubsub_push_service_account": account,
            }),
        );
    }

    if parts.method == Method::POST && path == TOKEN_PATH {
        let form = String::from_utf8_lossy(&body);
        let assertion = form
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "assertion")
            .map(|(_, v)| urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_default());
        return match assertion {
            Some(assertion) => {
                state.assertions.push(assertion);
                json_response(
                    StatusCode::OK,
                    json!({
                        "access_token": ACCESS_TOKEN,
                        "expires_in": shared.setup.token_ttl,
                        "token_type": "Bearer",
                    }),
                )
            }
            None => json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid_grant"})),
        };
    }

    let publish_path = format!(
        "/v1/projects/{}/topics/{}:publish",
        shared.setup.pubsub_project_id, shared.setup.topic_id
    );
    if parts.method == Method::POST && path == publish_path {
        if let Some(status) = state.publish_status {
            return json_response(status, json!({"error": {"message": "publish rejected"}}));
        }
        let request: PublishBody = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return json_response(StatusCode::BAD_REQUEST, json!({"error": e.to_string()}))
            }
        };
        let mut ids = Vec::new();
        for message in request.messages {
            let data = match STANDARD.decode(message.data) {
                Ok(data) => data,
                Err(e) => {
                    return json_response(StatusCode::BAD_REQUEST, json!({"error": e.to_string()}))
                }
            };
            state.published.push(Bytes::from(data));
            ids.push(state.published.len().to_string());
        }
        drop(state);
        shared.published.notify_waiters();
        return json_response(StatusCode::OK, json!({ "messageIds": ids }));
    }

    json_response(StatusCode::NOT_FOUND, json!({"error": "no such endpoint"}))
}
