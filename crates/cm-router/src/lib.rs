//! Company Metrics Router
//!
//! This crate turns resource change events into metrics recalculation calls:
//! - MetricsRouter: Extracts the company number and picks a client per delta/event type
//! - MetricsClientFactory: Fixed (delta type, event type) -> client table with a null fallback
//! - ResourceMetricsClient: Builds the recalculation request, with an optional charge existence check
//! - ResponseHandler: Classifies downstream failures as retryable or not
//! - RetryProtocol: Retry, dead-letter and invalid topic handling around the router
//! - ConsumerPool / ConsumerManager: Concurrency-bounded processing with ACK/NACK
//! - Lifecycle: Redelivery of retry topics and periodic stats

pub mod api;
pub mod client;
pub mod extractor;
pub mod factory;
pub mod lifecycle;
pub mod manager;
pub mod pool;
pub mod response_handler;
pub mod retry;
pub mod router;

pub use api::{ApiError, ChargeLookup, HttpMetricsApi, HttpMetricsApiConfig, MetricsApi};
pub use client::{ExistenceCheck, MetricsClient, MetricsRequest, NullMetricsClient, ResourceMetricsClient};
pub use extractor::{extract_company_number, CompanyNumber};
pub use factory::MetricsClientFactory;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use manager::ConsumerManager;
pub use pool::{ConsumerPool, PoolStats, PoolTask};
pub use response_handler::ResponseHandler;
pub use retry::{
    InMemoryTopicPublisher, InboundMessage, OutboundMessage, PublishError, RetryPolicy, RetryProtocol,
    TopicPublisher,
};
pub use router::MetricsRouter;
