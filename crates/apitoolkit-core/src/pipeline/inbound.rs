//! Inbound observation layer.

use super::{ExchangeRecorder, Pipeline};
use crate::assemble::CapturedExchange;
use crate::capture::{self, CaptureBody};
use crate::context::RequestContext;
use crate::record::SdkType;
use crate::route::{MatchedRoute, RouteParams};
use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tower::{Layer, Service};

/// Observes every request passing through the wrapped service.
///
/// The inner service receives the request with its body wrapped in a
/// [`CaptureBody`] and a [`RequestContext`] in its extensions. The response
/// body is wrapped in an [`ObservedBody`], which emits the record once it
/// has been read to the end or dropped.
#[derive(Clone, Debug)]
pub struct InboundLayer {
    pipeline: Pipeline,
}

impl InboundLayer {
    /// Create a layer for `pipeline`.
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for InboundLayer {
    type Service = InboundService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InboundService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Service produced by [`InboundLayer`].
#[derive(Clone, Debug)]
pub struct InboundService<S> {
    inner: S,
    pipeline: Pipeline,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for InboundService<S>
where
    S: Service<Request<CaptureBody<ReqBody>>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: StdError + Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let ctx = RequestContext::new();
        let (mut parts, body) = req.into_parts();

        let mut exchange = CapturedExchange::new(
            &parts.method,
            &parts.uri,
            &parts.headers,
            ctx.msg_id(),
            SdkType::Inbound,
        );
        exchange.route = parts.extensions.get::<MatchedRoute>().map(|r| r.0.clone());
        exchange.path_params = parts.extensions.get::<RouteParams>().map(|p| p.0.clone());
        parts.extensions.insert(ctx.clone());

        let limit = self.pipeline.max_body_size();
        let (body, request_capture) =
            capture::wrap(body, self.pipeline.capture_request_body(), limit);
        let req = Request::from_parts(parts, body);
        let mut recorder = ExchangeRecorder::new(
            self.pipeline.clone(),
            exchange,
            request_capture,
            Some(ctx.clone()),
        );
        let capture_response = self.pipeline.capture_response_body();

        // the clone may not be ready; keep the one that was polled
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            // `call` runs inside the scope as well as the future it returns
            let dispatched = recorder.in_span(ctx.scope(async move { inner.call(req).await }));
            match dispatched.await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    recorder.respond(parts.status, &parts.headers, parts.extensions.get());
                    let (body, response_capture) = capture::wrap(body, capture_response, limit);
                    recorder.set_response_capture(response_capture);
                    Ok(Response::from_parts(
                        parts,
                        ObservedBody::new(body, recorder),
                    ))
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
    /// Response body that emits the exchange record when it completes.
    ///
    /// Completion is the end of the stream, a body error, or the body being
    /// dropped early, whichever happens first.
    pub struct ObservedBody<B> {
        #[pin]
        inner: CaptureBody<B>,
        recorder: Option<ExchangeRecorder>,
    }
}

impl<B> ObservedBody<B> {
    pub(crate) fn new(inner: CaptureBody<B>, recorder: ExchangeRecorder) -> Self {
        Self {
            inner,
            recorder: Some(recorder),
        }
    }
}

impl<B: Body> Body for ObservedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let result = ready!(this.inner.poll_frame(cx));
        if !matches!(result, Some(Ok(_))) {
            // end of stream or a body error; the record is complete
            this.recorder.take();
        }
        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> std::fmt::Debug for ObservedBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedBody")
            .field("pending", &self.recorder.is_some())
            .finish()
    }
}
