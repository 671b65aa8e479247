//! Request-scoped observation state.
//!
//! Each guarded inbound call gets its own [`RequestContext`]. It carries the
//! correlation id, the errors reported while handling the call, and route
//! information a handler may supply late. Nothing here is shared between
//! requests.
//!
//! The context is reachable two ways: from the request extensions, and from
//! [`RequestContext::current`] anywhere inside the handler's task.
//!
//! ```ignore
//! async fn handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, AppError> {
//!     if let Err(err) = charge_card().await {
//!         apitoolkit_core::context::report(&err);
//!     }
//!     // ...
//! }
//! ```

use crate::errors::{ErrorAggregator, ErrorRecord};
use http::Request;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Per-request observation state, cheap to clone.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

struct Inner {
    msg_id: String,
    errors: ErrorAggregator,
    route: Mutex<Option<String>>,
    path_params: Mutex<Option<BTreeMap<String, String>>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Create a context with a fresh correlation id.
    pub fn new() -> Self {
        Self::with_msg_id(Uuid::new_v4().to_string())
    }

    /// Create a context with a given correlation id.
    pub fn with_msg_id(msg_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                msg_id: msg_id.into(),
                errors: ErrorAggregator::new(),
                route: Mutex::new(None),
                path_params: Mutex::new(None),
            }),
        }
    }

    /// The context of the guarded call this task is handling, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// The context attached to a request by the inbound layer.
    pub fn from_request<B>(req: &Request<B>) -> Option<Self> {
        req.extensions().get::<Self>().cloned()
    }

    /// Run `fut` with this context as [`RequestContext::current`].
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Correlation id of this guarded call.
    pub fn msg_id(&self) -> &str {
        &self.inner.msg_id
    }

    /// Record an error without failing the request.
    pub fn report<E>(&self, error: &E)
    where
        E: StdError + 'static,
    {
        self.inner.errors.push(ErrorRecord::from_error(error));
    }

    /// Record a type-erased error without failing the request.
    pub fn report_dyn(&self, error: &(dyn StdError + 'static)) {
        self.inner.errors.push(ErrorRecord::from_dyn(error));
    }

    /// Append an already-built record.
    pub fn push_record(&self, record: ErrorRecord) {
        self.inner.errors.push(record);
    }

    /// Errors reported so far.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.inner.errors.snapshot()
    }

    pub(crate) fn take_errors(&self) -> Vec<ErrorRecord> {
        self.inner.errors.take()
    }

    /// Set the matched route template, for routers that resolve it inside
    /// the handler.
    pub fn set_route(&self, template: impl Into<String>) {
        *self.inner.route.lock().unwrap_or_else(|e| e.into_inner()) = Some(template.into());
    }

    /// Matched route template set through [`RequestContext::set_route`].
    pub fn route(&self) -> Option<String> {
        self.inner
            .route
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Set the bound path parameters.
    pub fn set_path_params<I, K, V>(&self, params: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        *self
            .inner
            .path_params
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(params);
    }

    /// Path parameters set through [`RequestContext::set_path_params`].
    pub fn path_params(&self) -> Option<BTreeMap<String, String>> {
        self.inner
            .path_params
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("msg_id", &self.inner.msg_id)
            .field("errors", &self.inner.errors.len())
            .finish()
    }
}

/// Report an error against the current guarded call.
///
/// Returns `false` when called outside of one.
pub fn report<E>(error: &E) -> bool
where
    E: StdError + 'static,
{
    match RequestContext::current() {
        Some(ctx) => {
            ctx.report(error);
            true
        }
        None => false,
    }
}
