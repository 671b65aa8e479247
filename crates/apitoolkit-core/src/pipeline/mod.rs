//! Pipeline orchestration.
//!
//! Every guarded call moves through the same states:
//!
//! ```text
//! START -> CAPTURE_BEGIN -> DOWNSTREAM_DISPATCH -> CAPTURE_END -> ASSEMBLE -> EMIT -> END
//!                                  |                    ^
//!                                  +-> ERROR_REPORT ----+
//! ```
//!
//! [`InboundLayer`] runs it around a server's request handling and
//! [`OutboundLayer`] around a client call. Both share one [`Pipeline`], which
//! holds the read-only configuration, the assembler and the sink.
//!
//! A span-writing sink opens its span at CAPTURE_BEGIN. The span is current
//! while the call is dispatched and is ended after EMIT.

mod inbound;
mod outbound;

pub use inbound::{InboundLayer, InboundService, ObservedBody};
pub use outbound::{OutboundBody, OutboundLayer, OutboundService};

use crate::assemble::{assemble, CapturedExchange, EventAssembler};
use crate::capture::BodyCapture;
use crate::config::ApitoolkitConfig;
use crate::context::RequestContext;
use crate::error::EmitError;
use crate::errors::ErrorRecord;
use crate::redact::RedactionSpec;
use crate::route::MatchedRoute;
use crate::sink::{EmissionSink, NullSink, OpenSpan, SpanScope, SpanStart};
use http::{HeaderMap, StatusCode};
use pin_project_lite::pin_project;
use std::error::Error as StdError;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime};

/// Status recorded when the guarded call failed with an error.
pub const FAILURE_STATUS: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

/// Status recorded when the guarded call was dropped before it produced a
/// response.
pub const CANCELLED_STATUS: u16 = 499;

/// Shared state of the observation pipeline.
///
/// Cheap to clone; everything inside is read-only after construction.
///
/// ```ignore
/// let pipeline = Pipeline::new(config, QueuePublisher::new(topic));
///
/// let service = ServiceBuilder::new()
///     .layer(pipeline.inbound_layer())
///     .service(router);
/// ```
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    debug: bool,
    capture_request_body: bool,
    capture_response_body: bool,
    max_body_size: usize,
    assembler: EventAssembler,
    sink: Arc<dyn EmissionSink>,
}

impl Pipeline {
    /// Create a pipeline emitting to `sink`.
    pub fn new<S: EmissionSink>(config: &ApitoolkitConfig, sink: S) -> Self {
        Self::with_assembler(config, EventAssembler::from_config(config), sink)
    }

    /// Create a pipeline with a pre-built assembler.
    pub fn with_assembler<S: EmissionSink>(
        config: &ApitoolkitConfig,
        assembler: EventAssembler,
        sink: S,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                debug: config.debug,
                capture_request_body: config.capture_request_body,
                capture_response_body: config.capture_response_body,
                max_body_size: config.max_body_size,
                assembler,
                sink: Arc::new(sink),
            }),
        }
    }

    /// A pipeline that observes but emits nothing.
    pub fn disabled(config: &ApitoolkitConfig) -> Self {
        Self::new(config, NullSink)
    }

    /// Layer for inbound requests.
    pub fn inbound_layer(&self) -> InboundLayer {
        InboundLayer::new(self.clone())
    }

    /// Layer for outbound calls.
    pub fn outbound_layer(&self) -> OutboundLayer {
        OutboundLayer::new(self.clone())
    }

    /// The assembler in use.
    pub fn assembler(&self) -> &EventAssembler {
        &self.inner.assembler
    }

    /// Whether internal failures are logged.
    pub fn debug(&self) -> bool {
        self.inner.debug
    }

    pub(crate) fn capture_request_body(&self) -> bool {
        self.inner.capture_request_body
    }

    pub(crate) fn capture_response_body(&self) -> bool {
        self.inner.capture_response_body
    }

    /// Largest body that is retained.
    pub fn max_body_size(&self) -> usize {
        self.inner.max_body_size
    }

    /// Let the sink open a span for a call that is starting. Never panics.
    pub(crate) fn open_span(&self, exchange: &CapturedExchange) -> Option<OpenSpan> {
        let start = SpanStart {
            sdk_type: exchange.sdk_type,
            method: exchange.method.as_str(),
            target: &exchange.raw_url,
            service_name: &self.inner.assembler.meta().service_name,
            started: SystemTime::now(),
        };
        match catch_unwind(AssertUnwindSafe(|| self.inner.sink.open_span(&start))) {
            Ok(span) => span,
            Err(_) => {
                self.report_failure(&exchange.msg_id, &EmitError::Panicked);
                None
            }
        }
    }

    /// Assemble and emit. Never fails and never panics.
    ///
    /// `redaction` replaces the pipeline's redaction settings for this one
    /// record.
    pub(crate) fn finish(
        &self,
        exchange: CapturedExchange,
        errors: Vec<ErrorRecord>,
        redaction: Option<&RedactionSpec>,
        span: Option<OpenSpan>,
    ) {
        let msg_id = exchange.msg_id.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let record = match redaction {
                Some(spec) => assemble(exchange, errors, spec, self.inner.assembler.meta()),
                None => self.inner.assembler.assemble(exchange, errors),
            };
            match span {
                Some(span) => self.inner.sink.emit_in_span(&record, span),
                None => self.inner.sink.emit(&record),
            }
        }));

        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error,
            Err(_) => EmitError::Panicked,
        };
        self.report_failure(&msg_id, &error);
    }

    fn report_failure(&self, msg_id: &str, error: &EmitError) {
        if self.inner.debug {
            tracing::error!(%msg_id, %error, "failed to emit telemetry record");
        } else {
            tracing::trace!(%msg_id, %error, "failed to emit telemetry record");
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("debug", &self.inner.debug)
            .field("capture_request_body", &self.inner.capture_request_body)
            .field("capture_response_body", &self.inner.capture_response_body)
            .field("max_body_size", &self.inner.max_body_size)
            .finish_non_exhaustive()
    }
}

/// Collects one exchange and emits it exactly once, when dropped.
///
/// Dropping covers every way a guarded call can end: a finished response
/// body, an error, or cancellation by the host.
pub(crate) struct ExchangeRecorder {
    pipeline: Pipeline,
    exchange: Option<CapturedExchange>,
    started: Instant,
    responded: bool,
    request_capture: BodyCapture,
    response_capture: BodyCapture,
    context: Option<RequestContext>,
    errors: Vec<ErrorRecord>,
    redaction: Option<Arc<RedactionSpec>>,
    span: Option<OpenSpan>,
}

impl ExchangeRecorder {
    /// Begin recording. Opens the sink's span, if it writes one.
    pub(crate) fn new(
        pipeline: Pipeline,
        exchange: CapturedExchange,
        request_capture: BodyCapture,
        context: Option<RequestContext>,
    ) -> Self {
        let span = pipeline.open_span(&exchange);
        Self {
            pipeline,
            exchange: Some(exchange),
            started: Instant::now(),
            responded: false,
            request_capture,
            response_capture: BodyCapture::disabled(),
            context,
            errors: Vec::new(),
            redaction: None,
            span,
        }
    }

    /// Redact this exchange with `spec` instead of the pipeline's settings.
    pub(crate) fn with_redaction(mut self, spec: Option<Arc<RedactionSpec>>) -> Self {
        self.redaction = spec;
        self
    }

    /// Run `fut` with this exchange's span current.
    pub(crate) fn in_span<F>(&self, fut: F) -> InSpan<F> {
        InSpan {
            inner: fut,
            scope: self.span.as_ref().map(OpenSpan::scope),
        }
    }

    fn exchange_mut(&mut self) -> Option<&mut CapturedExchange> {
        self.exchange.as_mut()
    }

    /// The response head is known.
    pub(crate) fn respond(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        route: Option<&MatchedRoute>,
    ) {
        let elapsed = self.started.elapsed();
        self.responded = true;
        if let Some(exchange) = self.exchange_mut() {
            exchange.status_code = status.as_u16();
            exchange.response_headers = headers.clone();
            exchange.duration = elapsed;
            if let Some(route) = route {
                exchange.route.get_or_insert_with(|| route.0.clone());
            }
        }
    }

    /// The guarded call failed.
    pub(crate) fn fail<E>(&mut self, error: &E)
    where
        E: StdError + 'static,
    {
        self.errors.push(ErrorRecord::from_returned(error));
        let elapsed = self.started.elapsed();
        self.responded = true;
        if let Some(exchange) = self.exchange_mut() {
            exchange.status_code = FAILURE_STATUS.as_u16();
            exchange.duration = elapsed;
        }
    }

    pub(crate) fn set_response_capture(&mut self, capture: BodyCapture) {
        self.response_capture = capture;
    }

    pub(crate) fn set_response_body(&mut self, body: bytes::Bytes) {
        if let Some(exchange) = self.exchange_mut() {
            exchange.response_body = body;
        }
    }
}

impl Drop for ExchangeRecorder {
    fn drop(&mut self) {
        let Some(mut exchange) = self.exchange.take() else {
            return;
        };

        if !self.responded {
            exchange.status_code = CANCELLED_STATUS;
            exchange.duration = self.started.elapsed();
        }
        exchange.request_body = self.request_capture.retrieve();
        if self.response_capture.is_enabled() {
            exchange.response_body = self.response_capture.retrieve();
        }

        let mut errors = Vec::new();
        if let Some(ctx) = &self.context {
            if let Some(route) = ctx.route() {
                exchange.route = Some(route);
            }
            if let Some(params) = ctx.path_params() {
                exchange.path_params = Some(params);
            }
            errors.extend(ctx.take_errors());
        }
        errors.append(&mut self.errors);

        self.pipeline.finish(
            exchange,
            errors,
            self.redaction.as_deref(),
            self.span.take(),
        );
    }
}

pin_project! {
    /// A future polled with its exchange's span entered.
    pub(crate) struct InSpan<F> {
        #[pin]
        inner: F,
        scope: Option<SpanScope>,
    }
}

impl<F: Future> Future for InSpan<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _entered = this.scope.as_ref().map(SpanScope::enter);
        this.inner.poll(cx)
    }
}
