//! Retry / dead-letter protocol
//!
//! Turns a routing outcome into a message disposition:
//!
//! ```text
//! Delivered -> Processing -> Success
//!                         -> RetryPending (republished to -retry, attempt + 1)
//!                         -> DeadLettered (retries exhausted, -error)
//!                         -> Invalid      (non-retryable or undecodable, -invalid)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cm_common::{updated_by, ConsumerError, Disposition, ResourceChangedData};
use cm_config::AppConfig;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::router::MetricsRouter;

/// A message as consumed from a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Zero on first delivery
    pub attempt: u32,
    pub payload: Vec<u8>,
}

/// A message published to a retry, error or invalid topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub partition: i32,
    /// Offset of the message on the topic it was first consumed from
    pub offset: i64,
    pub attempt: u32,
    pub payload: Vec<u8>,
    /// Minimum wait before the message may be consumed again
    pub delay: Option<Duration>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publisher closed")]
    Closed,
}

#[async_trait]
pub trait TopicPublisher: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), PublishError>;
}

// ============================================================================
// Policy
// ============================================================================

/// Attempt limits and topic naming
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub group_id: String,
    pub retry_suffix: String,
    pub error_suffix: String,
    pub invalid_suffix: String,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts,
            backoff: config.retry.backoff(),
            group_id: config.consumer.group_id.clone(),
            retry_suffix: config.retry.retry_suffix.clone(),
            error_suffix: config.retry.error_suffix.clone(),
            invalid_suffix: config.retry.invalid_suffix.clone(),
        }
    }

    fn derived(&self, topic: &str, suffix: &str) -> String {
        format!("{}-{}-{}", self.origin_topic(topic), self.group_id, suffix)
    }

    pub fn retry_topic(&self, topic: &str) -> String {
        self.derived(topic, &self.retry_suffix)
    }

    pub fn error_topic(&self, topic: &str) -> String {
        self.derived(topic, &self.error_suffix)
    }

    pub fn invalid_topic(&self, topic: &str) -> String {
        self.derived(topic, &self.invalid_suffix)
    }

    pub fn is_retry_topic(&self, topic: &str) -> bool {
        topic.ends_with(&format!("-{}-{}", self.group_id, self.retry_suffix))
    }

    /// The main topic a retry topic was derived from
    pub fn origin_topic<'a>(&self, topic: &'a str) -> &'a str {
        let suffix = format!("-{}-{}", self.group_id, self.retry_suffix);
        topic.strip_suffix(suffix.as_str()).unwrap_or(topic)
    }

    /// Whether a failed delivery with this attempt number may be retried
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ============================================================================
// Protocol
// ============================================================================

pub struct RetryProtocol {
    router: MetricsRouter,
    publisher: Arc<dyn TopicPublisher>,
    policy: RetryPolicy,
}

impl RetryProtocol {
    pub fn new(
        router: MetricsRouter,
        publisher: Arc<dyn TopicPublisher>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            router,
            publisher,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Route one message and publish it onwards if it failed.
    ///
    /// An `Err` means the onward publish failed and the message must be
    /// redelivered as-is.
    pub async fn process(
        &self,
        message: &InboundMessage,
        delta_type: &str,
    ) -> Result<Disposition, PublishError> {
        let event: ResourceChangedData = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to decode resource changed payload"
                );
                let reason = format!("Invalid payload: {}", e);
                let disposition = self.divert_invalid(message, reason).await?;
                metrics::counter!("cm_messages_total", "disposition" => disposition.label())
                    .increment(1);
                return Ok(disposition);
            }
        };

        let provenance = updated_by(&message.topic, message.partition, message.offset);
        let span = info_span!(
            "route",
            context_id = %event.context_id,
            topic = %message.topic,
            offset = message.offset,
            attempt = message.attempt,
        );

        let outcome = self
            .router
            .route(&event, delta_type, &provenance)
            .instrument(span)
            .await;

        let disposition = match outcome {
            Ok(()) => Ok(Disposition::Success),
            Err(e @ ConsumerError::NonRetryable { .. }) => {
                self.divert_invalid(message, e.to_string()).await
            }
            Err(e) if self.policy.can_retry(message.attempt) => {
                self.schedule_retry(message, e.to_string()).await
            }
            Err(e) => self.dead_letter(message, e.to_string()).await,
        }?;

        metrics::counter!("cm_messages_total", "disposition" => disposition.label()).increment(1);
        Ok(disposition)
    }

    async fn schedule_retry(
        &self,
        message: &InboundMessage,
        reason: String,
    ) -> Result<Disposition, PublishError> {
        let topic = self.policy.retry_topic(&message.topic);
        let attempt = message.attempt + 1;
        warn!(
            topic = %topic,
            attempt = attempt,
            max_attempts = self.policy.max_attempts,
            reason = %reason,
            "Retryable failure, scheduling redelivery"
        );
        self.publisher
            .publish(OutboundMessage {
                topic: topic.clone(),
                partition: message.partition,
                offset: message.offset,
                attempt,
                payload: message.payload.clone(),
                delay: Some(self.policy.backoff),
                error: Some(reason),
            })
            .await?;
        Ok(Disposition::RetryPending { topic, attempt })
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        reason: String,
    ) -> Result<Disposition, PublishError> {
        let topic = self.policy.error_topic(&message.topic);
        error!(
            topic = %topic,
            attempts = message.attempt + 1,
            reason = %reason,
            "Retries exhausted, moving message to error topic"
        );
        self.publish_terminal(message, topic.clone(), reason).await?;
        Ok(Disposition::DeadLettered { topic })
    }

    async fn divert_invalid(
        &self,
        message: &InboundMessage,
        reason: String,
    ) -> Result<Disposition, PublishError> {
        let topic = self.policy.invalid_topic(&message.topic);
        error!(topic = %topic, reason = %reason, "Non-retryable failure, moving message to invalid topic");
        self.publish_terminal(message, topic.clone(), reason).await?;
        Ok(Disposition::Invalid { topic })
    }

    async fn publish_terminal(
        &self,
        message: &InboundMessage,
        topic: String,
        reason: String,
    ) -> Result<(), PublishError> {
        self.publisher
            .publish(OutboundMessage {
                topic,
                partition: message.partition,
                offset: message.offset,
                attempt: message.attempt,
                payload: message.payload.clone(),
                delay: None,
                error: Some(reason),
            })
            .await
    }
}

// ============================================================================
// In-memory publisher
// ============================================================================

/// Forwards published messages to a listener and, unless built with
/// [`InMemoryTopicPublisher::forwarding`], keeps a copy of each one
pub struct InMemoryTopicPublisher {
    published: Mutex<Vec<OutboundMessage>>,
    record: bool,
    listener: Option<mpsc::UnboundedSender<OutboundMessage>>,
}

impl Default for InMemoryTopicPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTopicPublisher {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            record: true,
            listener: None,
        }
    }

    pub fn with_listener(listener: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new()
        }
    }

    /// Listener only; nothing is retained in memory
    pub fn forwarding(listener: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self {
            record: false,
            ..Self::with_listener(listener)
        }
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TopicPublisher for InMemoryTopicPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        info!(topic = %message.topic, attempt = message.attempt, "Publishing message");
        if let Some(ref listener) = self.listener {
            listener.send(message.clone()).map_err(|_| PublishError::Closed)?;
        }
        if self.record {
            self.published.lock().push(message);
        }
        Ok(())
    }
}
