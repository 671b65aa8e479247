//! Outbound call mirroring.
//!
//! Wrap an HTTP client service with [`OutboundLayer`] to record each call it
//! makes. Calls made while an inbound request is being handled are linked to
//! it through `parent_id`.
//!
//! ```ignore
//! let client = ServiceBuilder::new()
//!     .layer(pipeline.outbound_layer().url_template("/repos/{owner}/{repo}"))
//!     .service(hyper_client);
//! ```

use super::{ExchangeRecorder, Pipeline};
use crate::assemble::CapturedExchange;
use crate::capture::{self, CaptureBody, ReplayBody};
use crate::context::RequestContext;
use crate::record::SdkType;
use crate::redact::RedactionSpec;
use bytes::{Buf, Bytes};
use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use uuid::Uuid;

/// Records every call made through the wrapped client.
#[derive(Clone, Debug)]
pub struct OutboundLayer {
    pipeline: Pipeline,
    parent_id: Option<String>,
    url_template: Option<String>,
    redaction: Option<Arc<RedactionSpec>>,
}

impl OutboundLayer {
    /// Create a layer for `pipeline`.
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            parent_id: None,
            url_template: None,
            redaction: None,
        }
    }

    /// Redact this client's calls with `spec` instead of the pipeline's
    /// settings. The always-redacted headers still apply.
    ///
    /// ```ignore
    /// let payments = pipeline
    ///     .outbound_layer()
    ///     .redaction(RedactionSpec::new().header("x-stripe-key").response_path("$.card"));
    /// ```
    pub fn redaction(mut self, spec: RedactionSpec) -> Self {
        self.redaction = Some(Arc::new(spec));
        self
    }

    /// Link calls to `ctx` instead of the ambient [`RequestContext::current`].
    pub fn parent(mut self, ctx: &RequestContext) -> Self {
        self.parent_id = Some(ctx.msg_id().to_string());
        self
    }

    /// Link calls to a known correlation id.
    pub fn parent_id(mut self, msg_id: impl Into<String>) -> Self {
        self.parent_id = Some(msg_id.into());
        self
    }

    /// Route template of the remote endpoint, used as `url_path` and to
    /// derive path parameters.
    pub fn url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = Some(template.into());
        self
    }
}

impl<S> Layer<S> for OutboundLayer {
    type Service = OutboundService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OutboundService {
            inner,
            pipeline: self.pipeline.clone(),
            parent_id: self.parent_id.clone(),
            url_template: self.url_template.clone(),
            redaction: self.redaction.clone(),
        }
    }
}

/// Service produced by [`OutboundLayer`].
#[derive(Clone, Debug)]
pub struct OutboundService<S> {
    inner: S,
    pipeline: Pipeline,
    parent_id: Option<String>,
    url_template: Option<String>,
    redaction: Option<Arc<RedactionSpec>>,
}

impl<S> OutboundService<S> {
    fn resolve_parent<B>(&self, req: &Request<B>) -> Option<String> {
        self.parent_id
            .clone()
            .or_else(|| RequestContext::from_request(req).map(|c| c.msg_id().to_string()))
            .or_else(|| RequestContext::current().map(|c| c.msg_id().to_string()))
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for OutboundService<S>
where
    S: Service<Request<CaptureBody<ReqBody>>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: StdError + Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Body + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Send,
{
    type Response = Response<OutboundBody<ResBody, ResBody::Error>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let parent_id = self.resolve_parent(&req);
        let (parts, body) = req.into_parts();

        let mut exchange = CapturedExchange::new(
            &parts.method,
            &parts.uri,
            &parts.headers,
            Uuid::new_v4().to_string(),
            SdkType::Outbound,
        );
        exchange.parent_id = parent_id;
        exchange.route = self.url_template.clone();

        let limit = self.pipeline.max_body_size();
        let (body, request_capture) =
            capture::wrap(body, self.pipeline.capture_request_body(), limit);
        let req = Request::from_parts(parts, body);
        let mut recorder =
            ExchangeRecorder::new(self.pipeline.clone(), exchange, request_capture, None)
                .with_redaction(self.redaction.clone());
        let capture_response = self.pipeline.capture_response_body();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match recorder.in_span(async move { inner.call(req).await }).await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    recorder.respond(parts.status, &parts.headers, None);

                    let body = if capture_response {
                        let (replay, bytes) = capture::drain(body, limit).await;
                        if let Some(bytes) = bytes {
                            recorder.set_response_body(bytes);
                        }
                        OutboundBody::Replayed { body: replay }
                    } else {
                        OutboundBody::Streaming { body }
                    };
                    drop(recorder);
                    Ok(Response::from_parts(parts, body))
                }
                Err(error) => {
                    recorder.fail(&error);
                    drop(recorder);
                    Err(error)
                }
            }
        })
    }
}

pin_project! {
    /// Response body handed back to the caller of an observed client.
    ///
    /// When response capture is on the body was already read, up to the
    /// capture limit, and is replayed from memory; otherwise it streams
    /// straight from the original.
    #[derive(Debug)]
    #[project = OutboundBodyProj]
    pub enum OutboundBody<B, E> {
        /// The original body, untouched.
        Streaming {
            // Body returned by the wrapped client.
            #[pin]
            body: B,
        },
        /// A copy of the body read during capture.
        Replayed {
            // Buffered frames followed by any unread remainder.
            #[pin]
            body: ReplayBody<B, E>,
        },
    }
}

impl<B> Body for OutboundBody<B, B::Error>
where
    B: Body,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            OutboundBodyProj::Streaming { body } => body.poll_frame(cx).map(|frame| {
                frame.map(|result| {
                    result.map(|frame| frame.map_data(|mut data| data.copy_to_bytes(data.remaining())))
                })
            }),
            OutboundBodyProj::Replayed { body } => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            OutboundBody::Streaming { body } => body.is_end_stream(),
            OutboundBody::Replayed { body } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            OutboundBody::Streaming { body } => body.size_hint(),
            OutboundBody::Replayed { body } => body.size_hint(),
        }
    }
}
