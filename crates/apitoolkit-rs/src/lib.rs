//! # APIToolkit
//!
//! Observe the HTTP traffic of a Rust service.
//!
//! Every request the service handles is captured, redacted and emitted as
//! one telemetry record once the response has been sent. Outbound calls
//! made while handling it are recorded too and linked to the request that
//! made them. Observation never changes what the client sees.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use apitoolkit_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let apitoolkit = Apitoolkit::init(ApitoolkitConfig::from_env()?).await?;
//!
//!     let app = ServiceBuilder::new()
//!         .layer(apitoolkit.inbound_layer())
//!         .service(router);
//!     // serve `app` with hyper
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `cloud` (default) - registration and Google Pub/Sub publishing via
//!   [`Apitoolkit::init`]
//! - `otel` (default) - emit records as OpenTelemetry spans with
//!   [`SpanExporter::from_tracer`](sink::SpanExporter::from_tracer)
//! - `full` - all of the above
//!
//! ```toml
//! [dependencies]
//! apitoolkit-rs = { version = "0.2", default-features = false, features = ["otel"] }
//! ```

// Re-export core functionality
pub use apitoolkit_core::*;

// Re-export the cloud transport (feature-gated)
#[cfg(feature = "cloud")]
pub use apitoolkit_cloud as cloud;
#[cfg(feature = "cloud")]
pub use apitoolkit_cloud::{Apitoolkit, ClientMetadata, PubSubTopic, RegistrationError};

// Re-export commonly used dependencies
pub use tower;
pub use tracing;

/// Prelude module - import everything you need with `use apitoolkit_rs::prelude::*`
pub mod prelude {
    pub use apitoolkit_core::prelude::*;
    pub use apitoolkit_core::{RedactionSpec, SdkType};

    #[cfg(feature = "cloud")]
    pub use apitoolkit_cloud::Apitoolkit;

    pub use tower::{Layer, ServiceBuilder};
}
