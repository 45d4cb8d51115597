//! Metrics clients - one per resource type, plus a null client
//!
//! Every real client runs the same pipeline:
//! 1. Optional existence pre-check (charges only)
//! 2. Build a one-hot `RecalculateRequest`
//! 3. POST it to the metrics API
//! 4. Classify any failure through the `ResponseHandler`

use std::sync::Arc;

use async_trait::async_trait;
use cm_common::{ConsumerError, EventType, MetricCategory, RecalculateRequest, Result};
use tracing::{debug, error, info};

use crate::api::{ChargeLookup, MetricsApi};
use crate::extractor::CompanyNumber;
use crate::response_handler::ResponseHandler;

/// Request-scoped data handed to a client
#[derive(Debug, Clone)]
pub struct MetricsRequest {
    pub company_number: CompanyNumber,
    pub updated_by: String,
    pub resource_uri: String,
    pub context_id: String,
    /// `None` when the event type did not parse
    pub event_type: Option<EventType>,
}

#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Request a recalculation. Success means nothing was raised.
    async fn post_metrics(&self, request: &MetricsRequest) -> Result<()>;

    /// Label used in logs and error messages
    fn resource_type(&self) -> &str;
}

/// Read performed before posting, to detect consistency lag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistenceCheck {
    /// Changed charges must exist, deleted charges must be gone
    Charge,
}

/// The shared recalculation pipeline, configured per resource type
pub struct ResourceMetricsClient {
    api: Arc<dyn MetricsApi>,
    category: MetricCategory,
    resource_type: &'static str,
    existence_check: Option<ExistenceCheck>,
    response_handler: ResponseHandler,
}

impl ResourceMetricsClient {
    pub fn new(
        api: Arc<dyn MetricsApi>,
        category: MetricCategory,
        resource_type: &'static str,
        existence_check: Option<ExistenceCheck>,
    ) -> Self {
        Self {
            api,
            category,
            resource_type,
            existence_check,
            response_handler: ResponseHandler::new(),
        }
    }

    pub fn charges(api: Arc<dyn MetricsApi>) -> Self {
        Self::new(api, MetricCategory::Mortgage, "charges", Some(ExistenceCheck::Charge))
    }

    pub fn appointments(api: Arc<dyn MetricsApi>) -> Self {
        Self::new(api, MetricCategory::Appointments, "appointments", None)
    }

    pub fn pscs(api: Arc<dyn MetricsApi>) -> Self {
        Self::new(api, MetricCategory::PersonsWithSignificantControl, "PSCs", None)
    }

    pub fn psc_statements(api: Arc<dyn MetricsApi>) -> Self {
        Self::new(api, MetricCategory::PersonsWithSignificantControl, "PSC statements", None)
    }

    pub fn registers(api: Arc<dyn MetricsApi>) -> Self {
        Self::new(api, MetricCategory::Registers, "registers", None)
    }

    pub fn build_request(&self, updated_by: &str) -> RecalculateRequest {
        RecalculateRequest::for_category(self.category, updated_by)
    }

    async fn check_existence(&self, check: ExistenceCheck, request: &MetricsRequest) -> Result<()> {
        match check {
            ExistenceCheck::Charge => self.check_charge(request).await,
        }
    }

    async fn check_charge(&self, request: &MetricsRequest) -> Result<()> {
        let company_number = request.company_number.as_str();
        let lookup = self
            .api
            .get_charge(&request.resource_uri, &request.context_id)
            .await
            .map_err(|e| self.response_handler.handle(company_number, self.resource_type, e))?;

        match (request.event_type, lookup) {
            (Some(EventType::Deleted), ChargeLookup::Found) => {
                error!(
                    company_number = %company_number,
                    resource_uri = %request.resource_uri,
                    "Charge still present for deleted event"
                );
                Err(ConsumerError::retryable(format!(
                    "Charge details found for [{}] when should have been deleted",
                    company_number
                )))
            }
            (Some(EventType::Deleted), ChargeLookup::NotFound) => Ok(()),
            (_, ChargeLookup::NotFound) => {
                error!(
                    company_number = %company_number,
                    resource_uri = %request.resource_uri,
                    "Charge not yet present for changed event"
                );
                Err(ConsumerError::retryable(format!(
                    "Charge details not found for company [{}]",
                    company_number
                )))
            }
            (_, ChargeLookup::Found) => Ok(()),
        }
    }
}

#[async_trait]
impl MetricsClient for ResourceMetricsClient {
    async fn post_metrics(&self, request: &MetricsRequest) -> Result<()> {
        if let Some(check) = self.existence_check {
            self.check_existence(check, request).await?;
        }

        let body = self.build_request(&request.updated_by);
        let company_number = request.company_number.as_str();
        debug!(
            company_number = %company_number,
            resource_type = %self.resource_type,
            context_id = %request.context_id,
            "Requesting metrics recalculation"
        );

        self.api
            .post_recalculate(company_number, &body, &request.context_id)
            .await
            .map_err(|e| self.response_handler.handle(company_number, self.resource_type, e))?;

        info!(
            company_number = %company_number,
            resource_type = %self.resource_type,
            "Metrics recalculation requested"
        );
        Ok(())
    }

    fn resource_type(&self) -> &str {
        self.resource_type
    }
}

/// Stand-in for unmapped delta/event type combinations. Always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsClient;

#[async_trait]
impl MetricsClient for NullMetricsClient {
    async fn post_metrics(&self, request: &MetricsRequest) -> Result<()> {
        error!(
            company_number = %request.company_number,
            event_type = ?request.event_type,
            context_id = %request.context_id,
            "Invalid delta type and/or event type"
        );
        Err(ConsumerError::non_retryable(format!(
            "Invalid delta type and/or event type for company number {}",
            request.company_number
        )))
    }

    fn resource_type(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::extractor::extract_company_number;
    use parking_lot::Mutex;

    /// Records calls and replays scripted responses
    #[derive(Default)]
    pub struct MockMetricsApi {
        pub posts: Mutex<Vec<(String, RecalculateRequest)>>,
        pub charge_reads: Mutex<Vec<String>>,
        post_error: Mutex<Option<fn() -> ApiError>>,
        charge_result: Mutex<Option<fn() -> std::result::Result<ChargeLookup, ApiError>>>,
    }

    impl MockMetricsApi {
        pub fn failing_post(f: fn() -> ApiError) -> Self {
            let api = Self::default();
            *api.post_error.lock() = Some(f);
            api
        }

        pub fn with_charge(f: fn() -> std::result::Result<ChargeLookup, ApiError>) -> Self {
            let api = Self::default();
            *api.charge_result.lock() = Some(f);
            api
        }

        pub fn post_count(&self) -> usize {
            self.posts.lock().len()
        }
    }

    #[async_trait]
    impl MetricsApi for MockMetricsApi {
        async fn post_recalculate(
            &self,
            company_number: &str,
            request: &RecalculateRequest,
            _context_id: &str,
        ) -> std::result::Result<(), ApiError> {
            self.posts.lock().push((company_number.to_string(), request.clone()));
            match *self.post_error.lock() {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }

        async fn get_charge(
            &self,
            resource_uri: &str,
            _context_id: &str,
        ) -> std::result::Result<ChargeLookup, ApiError> {
            self.charge_reads.lock().push(resource_uri.to_string());
            match *self.charge_result.lock() {
                Some(f) => f(),
                None => Ok(ChargeLookup::Found),
            }
        }
    }

    pub fn request(uri: &str, event_type: Option<EventType>) -> MetricsRequest {
        MetricsRequest {
            company_number: extract_company_number(Some(uri)).unwrap(),
            updated_by: "stream-company-charges-0-12".to_string(),
            resource_uri: uri.to_string(),
            context_id: "context-id".to_string(),
            event_type,
        }
    }

    const CHARGE_URI: &str = "/company/01203396/charges/abc123";

    #[tokio::test]
    async fn test_each_client_sets_one_flag() {
        let cases: Vec<(fn(Arc<dyn MetricsApi>) -> ResourceMetricsClient, [bool; 4])> = vec![
            (ResourceMetricsClient::charges, [true, false, false, false]),
            (ResourceMetricsClient::appointments, [false, true, false, false]),
            (ResourceMetricsClient::pscs, [false, false, true, false]),
            (ResourceMetricsClient::psc_statements, [false, false, true, false]),
            (ResourceMetricsClient::registers, [false, false, false, true]),
        ];

        for (build, expected) in cases {
            let api = Arc::new(MockMetricsApi::default());
            let client = build(api.clone());
            client
                .post_metrics(&request(CHARGE_URI, Some(EventType::Changed)))
                .await
                .unwrap();

            let posts = api.posts.lock();
            assert_eq!(posts.len(), 1);
            assert_eq!(posts[0].0, "01203396");
            assert_eq!(posts[0].1.flags(), expected, "client {}", client.resource_type());
            assert_eq!(posts[0].1.internal_data.updated_by, "stream-company-charges-0-12");
        }
    }

    #[tokio::test]
    async fn test_changed_charge_not_found_is_retryable() {
        let api = Arc::new(MockMetricsApi::with_charge(|| Ok(ChargeLookup::NotFound)));
        let client = ResourceMetricsClient::charges(api.clone());

        let err = client
            .post_metrics(&request(CHARGE_URI, Some(EventType::Changed)))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("not found for company [01203396]"));
        assert_eq!(api.post_count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_charge_still_present_is_retryable() {
        let api = Arc::new(MockMetricsApi::with_charge(|| Ok(ChargeLookup::Found)));
        let client = ResourceMetricsClient::charges(api.clone());

        let err = client
            .post_metrics(&request(CHARGE_URI, Some(EventType::Deleted)))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("should have been deleted"));
        assert_eq!(api.post_count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_charge_gone_posts_metrics() {
        let api = Arc::new(MockMetricsApi::with_charge(|| Ok(ChargeLookup::NotFound)));
        let client = ResourceMetricsClient::charges(api.clone());

        client
            .post_metrics(&request(CHARGE_URI, Some(EventType::Deleted)))
            .await
            .unwrap();

        assert_eq!(*api.charge_reads.lock(), vec![CHARGE_URI.to_string()]);
        assert_eq!(api.post_count(), 1);
    }

    #[tokio::test]
    async fn test_charge_read_failure_is_classified() {
        let api = Arc::new(MockMetricsApi::with_charge(|| Err(ApiError::response(401, ""))));
        let client = ResourceMetricsClient::charges(api.clone());

        let err = client
            .post_metrics(&request(CHARGE_URI, Some(EventType::Changed)))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Failed recalculating charges for company 01203396");
    }

    #[tokio::test]
    async fn test_non_charge_clients_skip_existence_read() {
        let api = Arc::new(MockMetricsApi::default());
        let client = ResourceMetricsClient::registers(api.clone());

        client
            .post_metrics(&request("/company/01203396/registers", Some(EventType::Deleted)))
            .await
            .unwrap();

        assert!(api.charge_reads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_post_failure_is_classified() {
        let api = Arc::new(MockMetricsApi::failing_post(|| ApiError::response(502, "")));
        let client = ResourceMetricsClient::pscs(api);

        let err = client
            .post_metrics(&request("/company/01203396/persons-with-significant-control/x", Some(EventType::Changed)))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Failed recalculating PSCs for company 01203396");
    }

    #[tokio::test]
    async fn test_null_client_always_fails() {
        let err = NullMetricsClient
            .post_metrics(&request(CHARGE_URI, None))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Invalid delta type and/or event type for company number 01203396"
        );
    }
}
