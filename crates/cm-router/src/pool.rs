//! ConsumerPool - Worker pool with concurrency control
//!
//! - Semaphore-bounded concurrency
//! - One task per message, no ordering across messages
//! - Bounded in-memory queue; over capacity is NACKed back to the transport

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use cm_common::{AckNack, Disposition};
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use crate::retry::{InboundMessage, RetryProtocol};

const QUEUE_CAPACITY_MULTIPLIER: u32 = 10;
const MIN_QUEUE_CAPACITY: u32 = 500;
const REJECT_DELAY_MS: u64 = 5_000;

/// Task submitted to a pool worker
pub struct PoolTask {
    pub message: InboundMessage,
    pub delta_type: String,
    pub ack_tx: oneshot::Sender<AckNack>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub running: bool,
}

pub struct ConsumerPool {
    concurrency: u32,
    protocol: Arc<RetryProtocol>,

    /// Pool-level concurrency semaphore
    semaphore: Arc<Semaphore>,

    running: AtomicBool,

    /// Messages accepted but not yet picked up by a worker
    queue_size: Arc<AtomicU32>,

    active_workers: Arc<AtomicU32>,
}

impl ConsumerPool {
    pub fn new(concurrency: u32, protocol: Arc<RetryProtocol>) -> Self {
        Self {
            concurrency,
            protocol,
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            running: AtomicBool::new(false),
            queue_size: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(concurrency = self.concurrency, "Starting consumer pool");
    }

    /// Messages the pool will hold before it starts rejecting
    pub fn capacity(&self) -> u32 {
        std::cmp::max(self.concurrency * QUEUE_CAPACITY_MULTIPLIER, MIN_QUEUE_CAPACITY)
    }

    /// Submit a message; the outcome arrives on `task.ack_tx`
    pub fn submit(&self, task: PoolTask) {
        if !self.running.load(Ordering::SeqCst) {
            let _ = task.ack_tx.send(AckNack::Nack { delay_ms: Some(REJECT_DELAY_MS) });
            return;
        }

        let current_size = self.queue_size.load(Ordering::SeqCst);
        let capacity = self.capacity();
        if current_size >= capacity {
            debug!(current = current_size, capacity = capacity, "Pool at capacity, rejecting");
            let _ = task.ack_tx.send(AckNack::Nack { delay_ms: Some(REJECT_DELAY_MS) });
            return;
        }

        self.queue_size.fetch_add(1, Ordering::SeqCst);

        let semaphore = self.semaphore.clone();
        let protocol = self.protocol.clone();
        let queue_size = self.queue_size.clone();
        let active_workers = self.active_workers.clone();

        tokio::spawn(async move {
            Self::run_task(task, semaphore, protocol, queue_size, active_workers).await;
        });
    }

    async fn run_task(
        task: PoolTask,
        semaphore: Arc<Semaphore>,
        protocol: Arc<RetryProtocol>,
        queue_size: Arc<AtomicU32>,
        active_workers: Arc<AtomicU32>,
    ) {
        let permit = match semaphore.acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed");
                queue_size.fetch_sub(1, Ordering::SeqCst);
                let _ = task.ack_tx.send(AckNack::Nack { delay_ms: Some(REJECT_DELAY_MS) });
                return;
            }
        };

        queue_size.fetch_sub(1, Ordering::SeqCst);
        active_workers.fetch_add(1, Ordering::SeqCst);

        let start = std::time::Instant::now();
        let outcome = protocol.process(&task.message, &task.delta_type).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let ack_nack = match outcome {
            Ok(Disposition::Success) => {
                debug!(
                    topic = %task.message.topic,
                    offset = task.message.offset,
                    duration_ms = duration_ms,
                    "Message processed successfully"
                );
                AckNack::Ack
            }
            Ok(disposition) => {
                debug!(
                    topic = %task.message.topic,
                    offset = task.message.offset,
                    disposition = disposition.label(),
                    "Message handed to follow-up topic, ACKing"
                );
                AckNack::Ack
            }
            Err(e) => {
                warn!(
                    topic = %task.message.topic,
                    offset = task.message.offset,
                    error = %e,
                    "Follow-up publish failed, NACKing for redelivery"
                );
                AckNack::Nack { delay_ms: Some(protocol.policy().backoff.as_millis() as u64) }
            }
        };

        active_workers.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        let _ = task.ack_tx.send(ack_nack);
    }

    pub fn available_capacity(&self) -> usize {
        let used = self.queue_size.load(Ordering::SeqCst);
        self.capacity().saturating_sub(used) as usize
    }

    /// Stop accepting new work
    pub fn drain(&self) {
        info!("Draining consumer pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            concurrency: self.concurrency,
            active_workers: self.active_workers.load(Ordering::SeqCst),
            queue_size: self.queue_size.load(Ordering::SeqCst),
            queue_capacity: self.capacity(),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::client::tests::MockMetricsApi;
    use crate::factory::MetricsClientFactory;
    use crate::retry::{InMemoryTopicPublisher, RetryPolicy};
    use crate::router::MetricsRouter;

    fn pool(api: MockMetricsApi, concurrency: u32) -> (ConsumerPool, Arc<InMemoryTopicPublisher>) {
        let publisher = Arc::new(InMemoryTopicPublisher::new());
        let router = MetricsRouter::new(Arc::new(MetricsClientFactory::new(Arc::new(api))));
        let protocol = Arc::new(RetryProtocol::new(router, publisher.clone(), RetryPolicy::default()));
        (ConsumerPool::new(concurrency, protocol), publisher)
    }

    fn task(offset: i64) -> (PoolTask, oneshot::Receiver<AckNack>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let payload = serde_json::to_vec(&serde_json::json!({
            "context_id": format!("ctx-{}", offset),
            "resource_id": "r",
            "resource_kind": "company-officers",
            "resource_uri": "/company/12345678/appointments/abc",
            "event": { "type": "changed" }
        }))
        .unwrap();
        let message = InboundMessage {
            topic: "stream-company-officers".to_string(),
            partition: 0,
            offset,
            attempt: 0,
            payload,
        };
        (
            PoolTask {
                message,
                delta_type: "officers".to_string(),
                ack_tx,
            },
            ack_rx,
        )
    }

    #[tokio::test]
    async fn test_rejects_before_start() {
        let (pool, _) = pool(MockMetricsApi::default(), 2);
        let (task, rx) = task(1);
        pool.submit(task);
        assert_eq!(rx.await.unwrap(), AckNack::Nack { delay_ms: Some(REJECT_DELAY_MS) });
    }

    #[tokio::test]
    async fn test_processes_concurrently_and_acks() {
        let (pool, publisher) = pool(MockMetricsApi::default(), 2);
        pool.start();

        let mut receivers = Vec::new();
        for offset in 0..5 {
            let (task, rx) = task(offset);
            pool.submit(task);
            receivers.push(rx);
        }
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), AckNack::Ack);
        }
        assert!(publisher.published().is_empty());
        assert!(pool.is_fully_drained());
    }

    #[tokio::test]
    async fn test_failed_message_is_acked_after_handoff() {
        let (pool, publisher) = pool(MockMetricsApi::failing_post(|| ApiError::response(404, "")), 1);
        pool.start();

        let (task, rx) = task(7);
        pool.submit(task);
        assert_eq!(rx.await.unwrap(), AckNack::Ack);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_stops_intake() {
        let (pool, _) = pool(MockMetricsApi::default(), 1);
        pool.start();
        pool.drain();

        let (task, rx) = task(1);
        pool.submit(task);
        assert!(matches!(rx.await.unwrap(), AckNack::Nack { .. }));
        assert!(!pool.get_stats().running);
        assert_eq!(pool.available_capacity(), MIN_QUEUE_CAPACITY as usize);
    }
}
