//! # apitoolkit-cloud
//!
//! The transport side of APIToolkit: client registration, Google Pub/Sub
//! publishing with service-account credentials, and [`Apitoolkit::init`],
//! which turns an [`ApitoolkitConfig`](apitoolkit_core::ApitoolkitConfig)
//! into a pipeline publishing to the topic assigned at registration.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bootstrap;
pub mod error;
pub mod pubsub;
pub mod registration;

pub use bootstrap::Apitoolkit;
pub use error::{Error, RegistrationError, Result};
pub use pubsub::PubSubTopic;
pub use registration::{ClientMetadata, ServiceAccount};
