//! Integration configuration.
//!
//! [`ApitoolkitConfig`] can be assembled with the builder methods or loaded
//! from `APITOOLKIT_`-prefixed environment variables. List values are
//! comma-separated.
//!
//! ```ignore
//! use apitoolkit_core::config::ApitoolkitConfig;
//!
//! // APITOOLKIT_API_KEY=... APITOOLKIT_CAPTURE_REQUEST_BODY=true
//! let config = ApitoolkitConfig::from_env()?;
//!
//! let config = ApitoolkitConfig::new()
//!     .api_key("my-key")
//!     .capture_response_body(true)
//!     .redact_response_body(["$.user.ssn", "$..token"]);
//! ```

use crate::capture::DEFAULT_MAX_BODY_SIZE;
use crate::error::ConfigError;
use crate::json_path::JsonPath;
use crate::redact::RedactionSpec;
use serde::Deserialize;

/// Default registration endpoint base.
pub const DEFAULT_ROOT_URL: &str = "https://app.apitoolkit.io";

/// Default Pub/Sub REST endpoint.
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Prefix of every recognized environment variable.
pub const ENV_PREFIX: &str = "APITOOLKIT_";

/// Load variables from a `.env` file into the process environment, if one
/// exists. Variables already set are not overridden.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env file");
    }
}

/// Configuration for the observation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApitoolkitConfig {
    /// Surface internal failures through `tracing`.
    pub debug: bool,

    /// Key exchanged for publishing credentials at startup.
    pub api_key: Option<String>,

    /// Base URL of the registration endpoint.
    pub root_url: String,

    /// Header names to redact, in addition to the built-in ones.
    pub redact_headers: Vec<String>,

    /// Structural paths redacted in request bodies.
    pub redact_request_body: Vec<String>,

    /// Structural paths redacted in response bodies.
    pub redact_response_body: Vec<String>,

    /// Retain request bodies.
    pub capture_request_body: bool,

    /// Retain response bodies.
    pub capture_response_body: bool,

    /// Largest body, in bytes, that is retained. Longer bodies are recorded
    /// as empty.
    pub max_body_size: usize,

    /// Name of the observed service.
    pub service_name: String,

    /// Version of the observed service.
    pub service_version: String,

    /// Free-form tags attached to every record.
    pub tags: Vec<String>,

    /// Run as a no-op when provisioning fails instead of failing startup.
    pub allow_degraded: bool,

    /// Base URL of the Pub/Sub REST API.
    pub pubsub_endpoint: String,
}

impl Default for ApitoolkitConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn strings<I>(items: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl ApitoolkitConfig {
    /// Create a configuration with default values.
    ///
    /// Defaults:
    /// - Debug off, no API key
    /// - Redacted headers: `cookies`, `authorization`, `x-api-key`
    /// - Redacted body paths: `$.password`, `$.email`
    /// - Body capture disabled, bodies over 1 MiB never retained
    /// - Registration failures are fatal
    pub fn new() -> Self {
        Self {
            debug: false,
            api_key: None,
            root_url: DEFAULT_ROOT_URL.to_string(),
            redact_headers: strings(["cookies", "authorization", "x-api-key"]),
            redact_request_body: strings(["$.password", "$.email"]),
            redact_response_body: strings(["$.password", "$.email"]),
            capture_request_body: false,
            capture_response_body: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            service_name: String::new(),
            service_version: String::new(),
            tags: Vec::new(),
            allow_degraded: false,
            pubsub_endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
        }
    }

    /// Load `.env`, then read the `APITOOLKIT_` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_env_only()
    }

    /// Read the `APITOOLKIT_` environment variables without touching `.env`.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let config: Self = envy::prefixed(ENV_PREFIX).from_env()?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        let clean = |items: Vec<String>| -> Vec<String> {
            items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        self.redact_headers = clean(self.redact_headers);
        self.redact_request_body = clean(self.redact_request_body);
        self.redact_response_body = clean(self.redact_response_body);
        self.tags = clean(self.tags);
        self.api_key = self
            .api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        self
    }

    /// Enable or disable diagnostics for internal failures.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the API key.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the registration endpoint base.
    pub fn root_url(mut self, url: impl Into<String>) -> Self {
        self.root_url = url.into();
        self
    }

    /// Replace the redacted header names.
    pub fn redact_headers(mut self, headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redact_headers = strings(headers);
        self
    }

    /// Replace the request body redaction paths.
    pub fn redact_request_body(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redact_request_body = strings(paths);
        self
    }

    /// Replace the response body redaction paths.
    pub fn redact_response_body(
        mut self,
        paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.redact_response_body = strings(paths);
        self
    }

    /// Enable or disable request body capture.
    pub fn capture_request_body(mut self, capture: bool) -> Self {
        self.capture_request_body = capture;
        self
    }

    /// Enable or disable response body capture.
    pub fn capture_response_body(mut self, capture: bool) -> Self {
        self.capture_response_body = capture;
        self
    }

    /// Set the largest body that is retained.
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Set the service name.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the service version.
    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    /// Replace the service tags.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = strings(tags);
        self
    }

    /// Choose whether a provisioning failure degrades to a no-op pipeline.
    pub fn allow_degraded(mut self, allow: bool) -> Self {
        self.allow_degraded = allow;
        self
    }

    /// Set the Pub/Sub REST endpoint, e.g. an emulator.
    pub fn pubsub_endpoint(mut self, url: impl Into<String>) -> Self {
        self.pubsub_endpoint = url.into();
        self
    }

    /// The API key, or an error when it is not set.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Missing("api_key"))
    }

    /// Compile the redaction settings.
    ///
    /// Paths that do not parse are left out and logged, as warnings when
    /// debug is on.
    pub fn redaction_spec(&self) -> RedactionSpec {
        let spec = RedactionSpec::from_lists(
            &self.redact_headers,
            &self.redact_request_body,
            &self.redact_response_body,
        );
        for error in spec.rejected_paths() {
            if self.debug {
                tracing::warn!(%error, "skipping redaction path");
            } else {
                tracing::trace!(%error, "skipping redaction path");
            }
        }
        spec
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, url) in [
            ("root_url", &self.root_url),
            ("pubsub_endpoint", &self.pubsub_endpoint),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("`{url}` is not an http(s) URL"),
                });
            }
        }

        if matches!(&self.api_key, Some(key) if key.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "api_key",
                reason: "must not be blank".to_string(),
            });
        }

        for (field, raw) in [
            ("redact_request_body", &self.redact_request_body),
            ("redact_response_body", &self.redact_response_body),
        ] {
            let failed = raw
                .iter()
                .filter(|p| !p.trim().is_empty())
                .filter(|p| JsonPath::parse(p).is_err())
                .count();
            if failed > 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{failed} path(s) could not be parsed"),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "APITOOLKIT_API_KEY",
        "APITOOLKIT_MAX_BODY_SIZE",
        "APITOOLKIT_DEBUG",
        "APITOOLKIT_REDACT_HEADERS",
        "APITOOLKIT_REDACT_REQUEST_BODY",
        "APITOOLKIT_CAPTURE_REQUEST_BODY",
        "APITOOLKIT_TAGS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = ApitoolkitConfig::new();

        assert!(!config.debug);
        assert_eq!(config.root_url, DEFAULT_ROOT_URL);
        assert_eq!(
            config.redact_headers,
            vec!["cookies", "authorization", "x-api-key"]
        );
        assert_eq!(config.redact_request_body, vec!["$.password", "$.email"]);
        assert!(!config.capture_request_body);
        assert_eq!(config.max_body_size, DEFAULT_MAX_BODY_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ApitoolkitConfig::new()
            .api_key("k")
            .service_name("orders")
            .service_version("1.2.0")
            .tags(["eu", "prod"])
            .capture_response_body(true);

        assert_eq!(config.require_api_key().unwrap(), "k");
        assert_eq!(config.service_name, "orders");
        assert_eq!(config.tags, vec!["eu", "prod"]);
        assert!(config.capture_response_body);
    }

    #[test]
    fn test_missing_api_key() {
        let err = ApitoolkitConfig::new().require_api_key().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("api_key")));
    }

    #[test]
    fn test_validate_rejects_bad_url_and_paths() {
        let err = ApitoolkitConfig::new().root_url("ftp://x").validate();
        assert!(matches!(err, Err(ConfigError::Invalid { field: "root_url", .. })));

        let err = ApitoolkitConfig::new()
            .redact_request_body(["$.ok", "$[broken"])
            .validate();
        assert!(matches!(
            err,
            Err(ConfigError::Invalid {
                field: "redact_request_body",
                ..
            })
        ));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_prefixed_vars() {
        clear_env();
        std::env::set_var("APITOOLKIT_API_KEY", "env-key");
        std::env::set_var("APITOOLKIT_DEBUG", "true");
        std::env::set_var("APITOOLKIT_REDACT_HEADERS", "x-secret, x-token");
        std::env::set_var("APITOOLKIT_REDACT_REQUEST_BODY", "$.card.number");
        std::env::set_var("APITOOLKIT_CAPTURE_REQUEST_BODY", "true");
        std::env::set_var("APITOOLKIT_TAGS", "a,b");
        std::env::set_var("APITOOLKIT_MAX_BODY_SIZE", "4096");

        let config = ApitoolkitConfig::from_env_only().unwrap();
        clear_env();

        assert_eq!(config.api_key.as_deref(), Some("env-key"));
        assert!(config.debug);
        assert_eq!(config.redact_headers, vec!["x-secret", "x-token"]);
        assert_eq!(config.redact_request_body, vec!["$.card.number"]);
        assert_eq!(config.redact_response_body, vec!["$.password", "$.email"]);
        assert!(config.capture_request_body);
        assert_eq!(config.tags, vec!["a", "b"]);
        assert_eq!(config.max_body_size, 4096);
        assert_eq!(config.root_url, DEFAULT_ROOT_URL);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_when_unset() {
        clear_env();

        let config = ApitoolkitConfig::from_env_only().unwrap();

        assert_eq!(config, ApitoolkitConfig::new());
    }
}
