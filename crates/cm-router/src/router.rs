//! MetricsRouter - entry point for a decoded change event

use std::sync::Arc;

use cm_common::{ResourceChangedData, Result};
use tracing::debug;

use crate::client::MetricsRequest;
use crate::extractor::extract_company_number;
use crate::factory::MetricsClientFactory;

/// Stateless dispatcher; retries are the transport's job
#[derive(Clone)]
pub struct MetricsRouter {
    factory: Arc<MetricsClientFactory>,
}

impl MetricsRouter {
    pub fn new(factory: Arc<MetricsClientFactory>) -> Self {
        Self { factory }
    }

    pub async fn route(
        &self,
        event: &ResourceChangedData,
        delta_type: &str,
        updated_by: &str,
    ) -> Result<()> {
        let event_type = event.event.event_type.to_ascii_lowercase();
        let company_number = extract_company_number(event.resource_uri.as_deref())?;
        let client = self.factory.get_metrics_client(delta_type, &event_type);

        debug!(
            company_number = %company_number,
            delta_type = %delta_type,
            event_type = %event_type,
            client = %client.resource_type(),
            "Routing resource change"
        );

        let request = MetricsRequest {
            company_number,
            updated_by: updated_by.to_string(),
            resource_uri: event.resource_uri.clone().unwrap_or_default(),
            context_id: event.context_id.clone(),
            event_type: event_type.parse().ok(),
        };
        client.post_metrics(&request).await
    }
}
