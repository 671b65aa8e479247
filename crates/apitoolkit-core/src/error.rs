//! Error types for APIToolkit

use thiserror::Error;

/// Result type alias for APIToolkit operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result of handing a record to an emission sink
pub type EmitResult = std::result::Result<(), EmitError>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A record could not be emitted.
    #[error(transparent)]
    Emit(#[from] EmitError),

    /// A payload could not be published to the topic.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    /// A setting is present but unusable.
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Name of the offending setting
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Environment variables could not be deserialized.
    #[error("Environment configuration error: {0}")]
    Env(#[from] envy::Error),
}

/// Errors raised by an emission sink.
///
/// These never reach the guarded call; the pipeline logs them when debug is enabled.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The record could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink cannot accept records right now.
    #[error("Emission sink unavailable: {0}")]
    Unavailable(String),

    /// An attribute could not be written to the span.
    #[error("Span attribute error: {0}")]
    Attribute(String),

    /// The sink panicked while emitting.
    #[error("Emission sink panicked")]
    Panicked,
}

/// Errors raised by a topic publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The transport failed before a response was received.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials could not be obtained or were refused.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The topic answered with a non-success status.
    #[error("Topic rejected message with status {status}: {body}")]
    Rejected {
        /// HTTP status returned by the topic endpoint
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },

    /// The payload or response could not be encoded/decoded.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The publisher has been closed.
    #[error("Publisher closed")]
    Closed,
}
