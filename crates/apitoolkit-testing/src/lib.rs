//! Testing utilities for APIToolkit integrations.
//!
//! [`MockCollector`] stands in for the APIToolkit registration endpoint, the
//! OAuth token endpoint and the Pub/Sub publish API, so the whole
//! register, authenticate and publish path can run against a local server.

pub mod collector;

pub use collector::{CollectorSetup, MockCollector, RecordedRequest};
