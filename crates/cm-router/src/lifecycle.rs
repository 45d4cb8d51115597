//! Lifecycle Manager - Background tasks for the consumer
//!
//! Handles:
//! - Redelivery of retry-topic messages after their backoff
//! - Periodic pool statistics logging
//! - Graceful shutdown coordination

use std::sync::Arc;
use std::time::Duration;

use cm_common::AckNack;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::manager::ConsumerManager;
use crate::retry::{InboundMessage, OutboundMessage};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for pool statistics logging
    pub stats_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(60),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks.
    ///
    /// `published` receives everything the topic publisher emits; messages on
    /// retry topics are fed back into `manager`, the rest are terminal.
    pub fn start(
        manager: Arc<ConsumerManager>,
        published: mpsc::UnboundedReceiver<OutboundMessage>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Retry topic redelivery
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let mut published = published;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = published.recv() => {
                            let Some(outbound) = received else {
                                debug!("Publisher closed, redelivery stopping");
                                break;
                            };

                            if !manager.policy().is_retry_topic(&outbound.topic) {
                                info!(
                                    topic = %outbound.topic,
                                    offset = outbound.offset,
                                    error = ?outbound.error,
                                    "Message reached terminal topic"
                                );
                                continue;
                            }

                            let delay = outbound.delay.unwrap_or_default();
                            let inbound = InboundMessage {
                                topic: outbound.topic,
                                partition: outbound.partition,
                                offset: outbound.offset,
                                attempt: outbound.attempt,
                                payload: outbound.payload,
                            };

                            let manager = manager.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let topic = inbound.topic.clone();
                                let offset = inbound.offset;
                                match manager.submit(inbound).await.await {
                                    Ok(AckNack::Ack) => {}
                                    Ok(AckNack::Nack { .. }) => {
                                        warn!(topic = %topic, offset = offset, "Redelivered message was not acknowledged");
                                    }
                                    Err(e) => {
                                        error!(topic = %topic, offset = offset, error = %e, "Redelivery task failed");
                                    }
                                }
                            });
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Redelivery task shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Pool statistics
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.stats_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let stats = manager.pool().get_stats();
                            info!(
                                active_workers = stats.active_workers,
                                queue_size = stats.queue_size,
                                queue_capacity = stats.queue_capacity,
                                in_flight = manager.in_flight_count(),
                                "Consumer pool stats"
                            );
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("Stats reporter shutting down");
                            break;
                        }
                    }
                }
            });
        }

        Self { shutdown_tx }
    }

    pub async fn shutdown(&self) {
        info!("Stopping lifecycle tasks");
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::client::tests::MockMetricsApi;
    use crate::factory::MetricsClientFactory;
    use crate::pool::ConsumerPool;
    use crate::retry::{InMemoryTopicPublisher, RetryPolicy, RetryProtocol};
    use crate::router::MetricsRouter;
    use cm_config::ConsumerConfig;

    #[tokio::test]
    async fn test_retryable_message_is_redelivered_until_dead_lettered() {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(InMemoryTopicPublisher::with_listener(tx));
        let api = Arc::new(MockMetricsApi::failing_post(|| ApiError::response(500, "")));
        let router = MetricsRouter::new(Arc::new(MetricsClientFactory::new(api.clone())));
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        let protocol = Arc::new(RetryProtocol::new(router, publisher.clone(), policy.clone()));
        let pool = Arc::new(ConsumerPool::new(2, protocol));
        let manager = Arc::new(ConsumerManager::new(&ConsumerConfig::default(), policy.clone(), pool));
        manager.start();

        let lifecycle = LifecycleManager::start(manager.clone(), rx, LifecycleConfig::default());

        let payload = serde_json::to_vec(&serde_json::json!({
            "context_id": "ctx",
            "resource_id": "r",
            "resource_kind": "company-registers",
            "resource_uri": "/company/12345678/registers",
            "event": { "type": "changed" }
        }))
        .unwrap();
        let ack = manager
            .dispatch(InboundMessage {
                topic: "stream-company-registers".to_string(),
                partition: 0,
                offset: 17,
                attempt: 0,
                payload,
            })
            .await;
        assert_eq!(ack, AckNack::Ack);

        let error_topic = policy.error_topic("stream-company-registers");
        let mut waited = 0;
        while publisher.published_to(&error_topic).is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }

        let dead = publisher.published_to(&error_topic);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].offset, 17);
        let retries = publisher.published_to(&policy.retry_topic("stream-company-registers"));
        assert_eq!(retries.len(), 2);
        assert!(retries.iter().all(|m| m.offset == 17));
        assert_eq!(api.post_count(), 3);

        // Every attempt records the original stream position
        let retry_topic = policy.retry_topic("stream-company-registers");
        let updated_by: Vec<String> = api
            .posts
            .lock()
            .iter()
            .map(|(_, request)| request.internal_data.updated_by.clone())
            .collect();
        assert_eq!(
            updated_by,
            vec![
                "stream-company-registers-0-17".to_string(),
                format!("{}-0-17", retry_topic),
                format!("{}-0-17", retry_topic),
            ]
        );

        lifecycle.shutdown().await;
    }
}
