use super::EmissionSink;
use crate::error::{EmitError, EmitResult, PublishError};
use crate::record::TelemetryRecord;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// A topic that accepts opaque payloads.
#[async_trait]
pub trait TopicPublisher: Send + Sync + 'static {
    /// Publish one payload and return the id the topic assigned to it.
    async fn publish(&self, payload: Bytes) -> Result<String, PublishError>;
}

/// Serializes records and publishes them without waiting for the result.
///
/// Publishing runs on the ambient tokio runtime. The outcome is only ever
/// logged, at `debug`/`error` when debug is enabled and at `trace` otherwise.
#[derive(Clone)]
pub struct QueuePublisher {
    topic: Arc<dyn TopicPublisher>,
    debug: bool,
}

impl QueuePublisher {
    /// Publish to `topic`.
    pub fn new<T: TopicPublisher>(topic: T) -> Self {
        Self::from_arc(Arc::new(topic))
    }

    /// Publish to a shared topic.
    pub fn from_arc(topic: Arc<dyn TopicPublisher>) -> Self {
        Self {
            topic,
            debug: false,
        }
    }

    /// Surface publish outcomes.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl EmissionSink for QueuePublisher {
    fn emit(&self, record: &TelemetryRecord) -> EmitResult {
        let payload = Bytes::from(record.to_json_bytes()?);
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EmitError::Unavailable(e.to_string()))?;

        let topic = Arc::clone(&self.topic);
        let debug = self.debug;
        let msg_id = record.msg_id.clone();
        runtime.spawn(async move {
            match topic.publish(payload).await {
                Ok(message_id) if debug => {
                    tracing::debug!(%msg_id, %message_id, "published telemetry record");
                }
                Ok(message_id) => {
                    tracing::trace!(%msg_id, %message_id, "published telemetry record");
                }
                Err(error) if debug => {
                    tracing::error!(%msg_id, %error, "failed to publish telemetry record");
                }
                Err(error) => {
                    tracing::trace!(%msg_id, %error, "failed to publish telemetry record");
                }
            }
        });

        Ok(())
    }
}

/// A topic held in memory, for local development and tests.
#[derive(Clone, Default)]
pub struct InMemoryTopic {
    inner: Arc<TopicState>,
}

#[derive(Default)]
struct TopicState {
    messages: Mutex<Vec<Bytes>>,
    next_id: AtomicU64,
    arrived: Notify,
}

impl InMemoryTopic {
    /// Create an empty topic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload published so far.
    pub fn messages(&self) -> Vec<Bytes> {
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Every payload published so far, decoded as records. Payloads that are
    /// not records are skipped.
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.messages()
            .iter()
            .filter_map(|m| serde_json::from_slice(m).ok())
            .collect()
    }

    /// Wait until at least `count` payloads arrived or `timeout` passed, then
    /// return the decoded records.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<TelemetryRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let arrived = self.inner.arrived.notified();
            if self.len() >= count {
                break;
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                break;
            }
        }
        self.records()
    }

    /// Number of payloads published.
    pub fn len(&self) -> usize {
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether nothing was published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TopicPublisher for InMemoryTopic {
    async fn publish(&self, payload: Bytes) -> Result<String, PublishError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
        self.inner.arrived.notify_waiters();
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::sample_record;

    struct Rejecting;

    #[async_trait]
    impl TopicPublisher for Rejecting {
        async fn publish(&self, _payload: Bytes) -> Result<String, PublishError> {
            Err(PublishError::Rejected {
                status: 403,
                body: "forbidden".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_publishes_json_record() {
        let topic = InMemoryTopic::new();
        let sink = QueuePublisher::new(topic.clone());

        sink.emit(&sample_record()).unwrap();
        let records = topic.wait_for(1, Duration::from_secs(2)).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0], sample_record());
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_escalated() {
        let sink = QueuePublisher::new(Rejecting).debug(true);
        assert!(sink.emit(&sample_record()).is_ok());
    }

    #[test]
    fn test_emit_outside_runtime_reports_unavailable() {
        let sink = QueuePublisher::new(InMemoryTopic::new());
        assert!(matches!(
            sink.emit(&sample_record()),
            Err(EmitError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let topic = InMemoryTopic::new();
        let records = topic.wait_for(1, Duration::from_millis(20)).await;
        assert!(records.is_empty());
    }
}
