//! # apitoolkit-core
//!
//! The traffic observation pipeline behind APIToolkit.
//!
//! Every guarded HTTP exchange is captured, redacted, assembled into one
//! canonical [`TelemetryRecord`] and handed to an [`EmissionSink`]. Outbound
//! calls made while handling a request are mirrored the same way and linked
//! to it through `parent_id`.
//!
//! ## Modules
//!
//! - [`capture`] - pass-through body wrappers that retain a copy
//! - [`redact`] / [`json_path`] - header and structural body redaction
//! - [`route`] - route templates and path parameter extraction
//! - [`errors`] / [`context`] - per-request error aggregation
//! - [`assemble`] / [`record`] - the canonical record
//! - [`sink`] - queue and span emission
//! - [`pipeline`] - the inbound and outbound tower layers
//!
//! ## Features
//!
//! - `otel` (default) - [`sink::SpanExporter::from_tracer`] over OpenTelemetry
//!
//! ## Example
//!
//! ```ignore
//! use apitoolkit_core::prelude::*;
//!
//! let config = ApitoolkitConfig::from_env()?;
//! let pipeline = Pipeline::new(&config, QueuePublisher::new(InMemoryTopic::new()));
//!
//! let app = ServiceBuilder::new()
//!     .layer(pipeline.inbound_layer())
//!     .service(router);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod assemble;
pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod errors;
pub mod json_path;
pub mod pipeline;
pub mod record;
pub mod redact;
pub mod route;
pub mod sink;

pub use assemble::{CapturedExchange, EventAssembler, ServiceMeta};
pub use config::ApitoolkitConfig;
pub use context::RequestContext;
pub use error::{ConfigError, EmitError, EmitResult, Error, PublishError, Result};
pub use errors::{register_error_type, ErrorRecord};
pub use pipeline::{InboundLayer, OutboundLayer, Pipeline};
pub use record::{SdkType, TelemetryRecord};
pub use redact::{RedactionSpec, REDACTED};
pub use route::{MatchedRoute, RouteParams};
pub use sink::{EmissionSink, QueuePublisher, SpanExporter, TopicPublisher};

/// Commonly used items.
pub mod prelude {
    pub use crate::config::ApitoolkitConfig;
    pub use crate::context::RequestContext;
    pub use crate::errors::ErrorRecord;
    pub use crate::pipeline::{InboundLayer, OutboundLayer, Pipeline};
    pub use crate::record::TelemetryRecord;
    pub use crate::route::{MatchedRoute, RouteParams};
    pub use crate::sink::{
        CallbackSink, EmissionSink, InMemoryTopic, NullSink, QueuePublisher, SpanExporter,
        TopicPublisher,
    };
}
