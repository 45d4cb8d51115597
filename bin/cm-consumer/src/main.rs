//! Company Metrics Consumer
//!
//! Reads resource change messages as JSON lines from stdin and routes them to
//! the metrics recalculation API. Messages published to retry topics are fed
//! back in after their backoff; error and invalid topics are terminal.
//!
//! Each input line looks like:
//!
//! ```json
//! {"topic": "stream-company-charges", "partition": 0, "offset": 42, "payload": {...}}
//! ```
//!
//! `payload` is the change event. A JSON string payload is passed through as raw bytes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cm_common::AckNack;
use cm_config::AppConfig;
use cm_router::{
    ConsumerManager, ConsumerPool, HttpMetricsApi, HttpMetricsApiConfig, InMemoryTopicPublisher,
    InboundMessage, LifecycleConfig, LifecycleManager, MetricsClientFactory, MetricsRouter,
    RetryPolicy, RetryProtocol,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// One stdin line
#[derive(Debug, Deserialize)]
struct InputRecord {
    topic: String,
    #[serde(default)]
    partition: i32,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    attempt: u32,
    payload: serde_json::Value,
}

impl InputRecord {
    fn into_message(self) -> Result<InboundMessage> {
        let payload = match self.payload {
            serde_json::Value::String(raw) => raw.into_bytes(),
            value => serde_json::to_vec(&value).context("Failed to encode payload")?,
        };
        Ok(InboundMessage {
            topic: self.topic,
            partition: self.partition,
            offset: self.offset,
            attempt: self.attempt,
            payload,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Starting Company Metrics Consumer");

    // 1. Configuration
    let config_path = std::env::var("CM_CONFIG").ok().map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    // 2. Downstream API and routing
    let api = Arc::new(HttpMetricsApi::new(HttpMetricsApiConfig::from(&config.api))?);
    let factory = Arc::new(MetricsClientFactory::new(api));
    let router = MetricsRouter::new(factory);

    // 3. Retry protocol over the in-process topic publisher
    let (published_tx, published_rx) = mpsc::unbounded_channel();
    let publisher = Arc::new(InMemoryTopicPublisher::forwarding(published_tx));
    let policy = RetryPolicy::from_config(&config);
    let protocol = Arc::new(RetryProtocol::new(router, publisher, policy.clone()));

    // 4. Pool and manager
    let pool = Arc::new(ConsumerPool::new(config.consumer.concurrency, protocol));
    let manager = Arc::new(ConsumerManager::new(&config.consumer, policy, pool));
    manager.start();

    let lifecycle = LifecycleManager::start(manager.clone(), published_rx, LifecycleConfig::default());

    log_startup_summary(&config);

    let input_task = tokio::spawn(read_input(manager.clone()));

    info!("Company Metrics Consumer started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    input_task.abort();
    lifecycle.shutdown().await;
    manager.shutdown(SHUTDOWN_TIMEOUT).await;

    info!("Company Metrics Consumer shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Feed stdin lines to the manager until EOF.
///
/// `submit` waits while the pool is full, so reading stops until capacity frees up.
async fn read_input(manager: Arc<ConsumerManager>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Input closed, waiting for in-flight retries");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to read input");
                return;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<InputRecord>(&line)
            .context("Malformed input line")
            .and_then(InputRecord::into_message)
        {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping input line");
                continue;
            }
        };

        let topic = message.topic.clone();
        let offset = message.offset;
        let delivery = manager.submit(message).await;
        tokio::spawn(async move {
            match delivery.await {
                Ok(AckNack::Ack) => debug!(topic = %topic, offset = offset, "ACK"),
                Ok(AckNack::Nack { delay_ms }) => {
                    warn!(topic = %topic, offset = offset, delay_ms = ?delay_ms, "NACK")
                }
                Err(e) => error!(topic = %topic, offset = offset, error = %e, "Delivery task failed"),
            }
        });
    }
}

fn log_startup_summary(config: &AppConfig) {
    info!("=== Company Metrics Consumer Startup Summary ===");
    info!("  Metrics API: {}", config.api.metrics_api_url);
    info!("  Charges API: {}", config.api.charges_api_url);
    info!("  Group: {}", config.consumer.group_id);
    info!("  Concurrency: {}", config.consumer.concurrency);
    info!(
        "  Retry: {} attempts, {}ms backoff",
        config.retry.max_attempts, config.retry.backoff_ms
    );
    for binding in &config.consumer.topics {
        info!("  Topic: {} -> {}", binding.topic, binding.delta_type);
    }
    info!("================================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
