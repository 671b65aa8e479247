//! Google Pub/Sub topic publisher.
//!
//! Records go out through the Pub/Sub REST API. Access tokens come from the
//! OAuth JWT bearer flow: a short-lived RS256 assertion signed with the
//! service-account key is traded at the token endpoint for an access token,
//! which is reused until shortly before it expires.

use crate::registration::{ClientMetadata, ServiceAccount};
use apitoolkit_core::sink::TopicPublisher;
use apitoolkit_core::PublishError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// OAuth scope requested for publishing.
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of a signed assertion, in seconds.
const ASSERTION_TTL: u64 = 3600;

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default, rename = "messageIds")]
    message_ids: Vec<String>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Publishes payloads to one Pub/Sub topic.
pub struct PubSubTopic {
    client: reqwest::Client,
    publish_url: String,
    account: ServiceAccount,
    signing_key: Option<EncodingKey>,
    token: Mutex<Option<CachedToken>>,
}

impl PubSubTopic {
    /// Publish to `topic_id` in `project_id` at `endpoint`.
    ///
    /// Fails when the account carries a private key that is not a valid
    /// RSA PEM key.
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        project_id: &str,
        topic_id: &str,
        account: ServiceAccount,
    ) -> Result<Self, PublishError> {
        let signing_key = match &account.private_key {
            Some(pem) if account.has_private_key() => Some(
                EncodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| PublishError::Auth(format!("invalid private key: {e}")))?,
            ),
            _ => None,
        };

        Ok(Self {
            client,
            publish_url: format!(
                "{}/v1/projects/{}/topics/{}:publish",
                endpoint.trim_end_matches('/'),
                project_id,
                topic_id
            ),
            account,
            signing_key,
            token: Mutex::new(None),
        })
    }

    /// Publish to the topic named in registration metadata.
    pub fn from_metadata(
        client: reqwest::Client,
        endpoint: &str,
        metadata: &ClientMetadata,
    ) -> Result<Self, PublishError> {
        Self::new(
            client,
            endpoint,
            &metadata.pubsub_project_id,
            &metadata.topic_id,
            metadata.pubsub_push_service_account.clone(),
        )
    }

    /// The publish URL.
    pub fn publish_url(&self) -> &str {
        &self.publish_url
    }

    /// Whether publishing goes out without credentials.
    pub fn is_emulator(&self) -> bool {
        self.signing_key.is_none()
    }

    /// A valid access token, or `None` in emulator mode.
    async fn access_token(&self) -> Result<Option<String>, PublishError> {
        let Some(key) = &self.signing_key else {
            return Ok(None);
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(Some(token.value.clone()));
            }
        }

        let token = self.exchange(key).await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(Some(value))
    }

    async fn exchange(&self, key: &EncodingKey) -> Result<CachedToken, PublishError> {
        let token_uri = self.account.token_uri();
        let iat = jsonwebtoken::get_current_timestamp();
        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: PUBSUB_SCOPE,
            aud: token_uri,
            iat,
            exp: iat + ASSERTION_TTL,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
            .map_err(|e| PublishError::Auth(e.to_string()))?;

        let form = format!(
            "grant_type={}&assertion={}",
            urlencoding::encode(JWT_BEARER_GRANT),
            urlencoding::encode(&assertion)
        );
        let requested_at = Instant::now();
        let response = self
            .client
            .post(token_uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(form)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Auth(format!("token exchange failed: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Auth(format!("invalid token response: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(ASSERTION_TTL));

        tracing::trace!(lifetime_secs = lifetime.as_secs(), "obtained pubsub access token");
        Ok(CachedToken {
            value: token.access_token,
            refresh_at: requested_at + lifetime.saturating_sub(REFRESH_MARGIN),
        })
    }
}

#[async_trait]
impl TopicPublisher for PubSubTopic {
    async fn publish(&self, payload: Bytes) -> Result<String, PublishError> {
        let token = self.access_token().await?;
        let body = json!({ "messages": [{ "data": STANDARD.encode(&payload) }] });

        let mut request = self.client.post(&self.publish_url).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let published: PublishResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Encoding(e.to_string()))?;
        published
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| PublishError::Encoding("no message id returned".to_string()))
    }
}

impl std::fmt::Debug for PubSubTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubTopic")
            .field("publish_url", &self.publish_url)
            .field("account", &self.account)
            .field("emulator", &self.is_emulator())
            .finish()
    }
}
