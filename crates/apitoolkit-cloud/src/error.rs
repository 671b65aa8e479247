//! Error types for the cloud transport

use apitoolkit_core::{ConfigError, PublishError};
use thiserror::Error;

/// Result type alias for cloud operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The client could not be registered.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The publisher could not be built.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Errors raised while fetching client metadata.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The request never got a response.
    #[error("Registration transport error: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("Registration failed with status {status}: {body}")]
    Status {
        /// HTTP status returned by the endpoint
        status: u16,
        /// Response body, for diagnostics
        body: String,
    },

    /// The response body is not valid client metadata.
    #[error("Invalid registration response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RegistrationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RegistrationError::Decode(err.to_string())
        } else {
            RegistrationError::Transport(err.to_string())
        }
    }
}
