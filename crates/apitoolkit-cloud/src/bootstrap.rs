//! Turning a configuration into a ready pipeline.

use crate::error::Result;
use crate::pubsub::PubSubTopic;
use crate::registration::ClientMetadata;
use apitoolkit_core::config::load_dotenv;
use apitoolkit_core::prelude::*;
use apitoolkit_core::EventAssembler;
use std::time::Duration;

/// Timeout for registration, token and publish requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A provisioned APIToolkit client.
///
/// ```ignore
/// let apitoolkit = Apitoolkit::init(ApitoolkitConfig::from_env()?).await?;
///
/// let app = ServiceBuilder::new()
///     .layer(apitoolkit.inbound_layer())
///     .service(router);
/// ```
#[derive(Clone)]
pub struct Apitoolkit {
    pipeline: Pipeline,
    metadata: Option<ClientMetadata>,
}

impl Apitoolkit {
    /// Register with APIToolkit and build a pipeline publishing to the
    /// assigned topic.
    ///
    /// An invalid configuration is always an error. A missing API key or a
    /// failed registration is an error unless `allow_degraded` is set, in
    /// which case the pipeline runs without emitting anything.
    pub async fn init(config: ApitoolkitConfig) -> Result<Self> {
        config.validate()?;

        match Self::provision(&config).await {
            Ok(apitoolkit) => Ok(apitoolkit),
            Err(error) if config.allow_degraded => {
                tracing::warn!(%error, "APIToolkit provisioning failed, telemetry disabled");
                Ok(Self {
                    pipeline: Pipeline::disabled(&config),
                    metadata: None,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Load `.env`, read the configuration from the environment and
    /// [`init`](Self::init).
    pub async fn from_env() -> Result<Self> {
        load_dotenv();
        Self::init(ApitoolkitConfig::from_env_only()?).await
    }

    async fn provision(config: &ApitoolkitConfig) -> Result<Self> {
        let api_key = config.require_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| crate::RegistrationError::Transport(e.to_string()))?;

        let metadata = ClientMetadata::fetch(&client, &config.root_url, api_key).await?;
        let topic = PubSubTopic::from_metadata(client, &config.pubsub_endpoint, &metadata)?;
        if config.debug {
            tracing::debug!(topic = ?topic, "pubsub topic configured");
        }

        let assembler = EventAssembler::from_config(config).with_project_id(&metadata.project_id);
        let sink = QueuePublisher::new(topic).debug(config.debug);
        tracing::info!(
            project_id = %metadata.project_id,
            topic_id = %metadata.topic_id,
            "APIToolkit client initialized"
        );

        Ok(Self {
            pipeline: Pipeline::with_assembler(config, assembler, sink),
            metadata: Some(metadata),
        })
    }

    /// The pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Layer observing inbound requests.
    pub fn inbound_layer(&self) -> InboundLayer {
        self.pipeline.inbound_layer()
    }

    /// Layer mirroring outbound calls.
    pub fn outbound_layer(&self) -> OutboundLayer {
        self.pipeline.outbound_layer()
    }

    /// Registration metadata, absent in degraded mode.
    pub fn metadata(&self) -> Option<&ClientMetadata> {
        self.metadata.as_ref()
    }

    /// The project records are stamped with.
    pub fn project_id(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.project_id.as_str())
    }

    /// Whether provisioning failed and nothing is emitted.
    pub fn is_degraded(&self) -> bool {
        self.metadata.is_none()
    }
}

impl std::fmt::Debug for Apitoolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Apitoolkit")
            .field("project_id", &self.project_id())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
