//! ConsumerManager - Central orchestrator for inbound messages
//!
//! - Resolves the delta type from the topic the message arrived on
//! - In-pipeline tracking so a redelivered message is not processed twice at once
//! - Intake bounded by the pool's queue capacity; callers wait instead of being rejected
//! - NACKed messages are dispatched again after the NACK delay

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cm_common::AckNack;
use cm_config::ConsumerConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::{ConsumerPool, PoolTask};
use crate::retry::{InboundMessage, RetryPolicy};

pub struct ConsumerManager {
    /// In-pipeline message tracking, keyed by topic-partition-offset-attempt
    in_pipeline: DashMap<String, Instant>,

    /// Inbound topic bindings
    consumer: ConsumerConfig,

    policy: RetryPolicy,

    pool: Arc<ConsumerPool>,

    /// One permit per message between intake and its final ACK
    intake: Arc<Semaphore>,

    running: AtomicBool,
}

impl ConsumerManager {
    pub fn new(config: &ConsumerConfig, policy: RetryPolicy, pool: Arc<ConsumerPool>) -> Self {
        let intake = Arc::new(Semaphore::new(pool.capacity() as usize));

        Self {
            in_pipeline: DashMap::new(),
            consumer: config.clone(),
            policy,
            pool,
            intake,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(topics = self.consumer.topics.len(), "Starting consumer manager");
        self.pool.start();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &Arc<ConsumerPool> {
        &self.pool
    }

    /// Delta type for a topic. Retry topics resolve through their origin.
    ///
    /// Unbound topics pass their own name through, which no client is
    /// mapped to, so the message ends up on the invalid topic.
    pub fn delta_type_for(&self, topic: &str) -> String {
        let origin = self.policy.origin_topic(topic);
        match self.consumer.delta_type_for(origin) {
            Some(delta_type) => delta_type.as_str().to_string(),
            None => {
                warn!(topic = %topic, "No delta type bound to topic");
                origin.to_string()
            }
        }
    }

    /// Wait for intake capacity, then deliver the message in the background
    pub async fn submit(self: &Arc<Self>, message: InboundMessage) -> JoinHandle<AckNack> {
        // The semaphore is never closed
        let permit = self.intake.clone().acquire_owned().await.ok();
        let manager = self.clone();

        tokio::spawn(async move {
            let ack = manager.deliver(message).await;
            drop(permit);
            ack
        })
    }

    /// Dispatch until ACKed. Returns the last NACK only once the manager has stopped.
    pub async fn deliver(&self, message: InboundMessage) -> AckNack {
        loop {
            let delay_ms = match self.dispatch(message.clone()).await {
                AckNack::Ack => return AckNack::Ack,
                AckNack::Nack { delay_ms } => delay_ms,
            };

            if !self.is_running() {
                warn!(
                    topic = %message.topic,
                    offset = message.offset,
                    attempt = message.attempt,
                    "Consumer stopped, message left unacknowledged"
                );
                return AckNack::Nack { delay_ms };
            }

            let delay = delay_ms.map(Duration::from_millis).unwrap_or(self.policy.backoff);
            debug!(
                topic = %message.topic,
                offset = message.offset,
                delay_ms = delay.as_millis() as u64,
                "Message NACKed, dispatching again"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Process one message once and return the transport ACK/NACK
    pub async fn dispatch(&self, message: InboundMessage) -> AckNack {
        if !self.is_running() {
            return AckNack::Nack { delay_ms: None };
        }

        let pipeline_key = format!(
            "{}-{}-{}-{}",
            message.topic, message.partition, message.offset, message.attempt
        );
        match self.in_pipeline.entry(pipeline_key.clone()) {
            Entry::Occupied(_) => {
                debug!(key = %pipeline_key, "Duplicate message (redelivery), NACKing");
                return AckNack::Nack { delay_ms: None };
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
            }
        }

        let delta_type = self.delta_type_for(&message.topic);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pool.submit(PoolTask {
            message,
            delta_type,
            ack_tx,
        });

        // Channel dropped - NACK to be safe
        let result = ack_rx.await.unwrap_or(AckNack::Nack { delay_ms: None });
        self.in_pipeline.remove(&pipeline_key);
        result
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_pipeline.len()
    }

    /// Stop intake and wait up to `timeout` for in-flight work
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down consumer manager");
        self.running.store(false, Ordering::SeqCst);
        self.pool.drain();

        let deadline = Instant::now() + timeout;
        while !self.pool.is_fully_drained() {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.in_pipeline.len(),
                    "Shutdown timeout reached with messages in flight"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Consumer manager drained");
    }
}
