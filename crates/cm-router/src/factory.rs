//! MetricsClientFactory - (delta type, event type) -> client lookup

use std::collections::HashMap;
use std::sync::Arc;

use cm_common::{DeltaType, EventType};
use tracing::warn;

use crate::api::MetricsApi;
use crate::client::{MetricsClient, NullMetricsClient, ResourceMetricsClient};

pub type ClientTable = HashMap<DeltaType, HashMap<EventType, Arc<dyn MetricsClient>>>;

/// Built once at startup, read-only afterwards
pub struct MetricsClientFactory {
    clients: ClientTable,
    null_client: Arc<dyn MetricsClient>,
}

impl MetricsClientFactory {
    pub fn new(api: Arc<dyn MetricsApi>) -> Self {
        let mut clients: ClientTable = HashMap::new();

        for delta_type in DeltaType::ALL {
            let client: Arc<dyn MetricsClient> = match delta_type {
                DeltaType::Charges => Arc::new(ResourceMetricsClient::charges(api.clone())),
                DeltaType::Officers => Arc::new(ResourceMetricsClient::appointments(api.clone())),
                DeltaType::Pscs => Arc::new(ResourceMetricsClient::pscs(api.clone())),
                DeltaType::PscStatements => {
                    Arc::new(ResourceMetricsClient::psc_statements(api.clone()))
                }
                DeltaType::Registers => Arc::new(ResourceMetricsClient::registers(api.clone())),
            };

            // One instance serves both event types; clients branch internally
            let by_event = EventType::ALL
                .into_iter()
                .map(|event_type| (event_type, client.clone()))
                .collect();
            clients.insert(delta_type, by_event);
        }

        Self::with_clients(clients)
    }

    /// Use an explicit table, e.g. with stubbed clients
    pub fn with_clients(clients: ClientTable) -> Self {
        Self {
            clients,
            null_client: Arc::new(NullMetricsClient),
        }
    }

    /// Never fails: unmapped combinations get the null client
    pub fn get_metrics_client(&self, delta_type: &str, event_type: &str) -> Arc<dyn MetricsClient> {
        let client = delta_type
            .parse::<DeltaType>()
            .ok()
            .zip(event_type.parse::<EventType>().ok())
            .and_then(|(delta, event)| self.clients.get(&delta)?.get(&event))
            .cloned();

        match client {
            Some(client) => client,
            None => {
                warn!(
                    delta_type = %delta_type,
                    event_type = %event_type,
                    "No metrics client mapped, using null client"
                );
                self.null_client.clone()
            }
        }
    }

    pub fn null_client(&self) -> Arc<dyn MetricsClient> {
        self.null_client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::MockMetricsApi;

    fn factory() -> MetricsClientFactory {
        MetricsClientFactory::new(Arc::new(MockMetricsApi::default()))
    }

    #[test]
    fn test_mapped_clients() {
        let factory = factory();
        let cases = [
            ("charges", "changed", "charges"),
            ("charges", "deleted", "charges"),
            ("officers", "changed", "appointments"),
            ("officers", "deleted", "appointments"),
            ("pscs", "changed", "PSCs"),
            ("psc-statements", "deleted", "PSC statements"),
            ("registers", "CHANGED", "registers"),
        ];
        for (delta, event, label) in cases {
            assert_eq!(factory.get_metrics_client(delta, event).resource_type(), label);
        }
    }

    #[test]
    fn test_event_types_share_one_instance() {
        let factory = factory();
        for delta_type in DeltaType::ALL {
            let changed = factory.get_metrics_client(delta_type.as_str(), "changed");
            let deleted = factory.get_metrics_client(delta_type.as_str(), "deleted");
            assert!(Arc::ptr_eq(&changed, &deleted), "{}", delta_type);
        }
    }

    #[test]
    fn test_unmapped_combinations_return_null_client() {
        let factory = factory();
        let null_client = factory.null_client();
        for (delta, event) in [
            ("unknown-type", "changed"),
            ("charges", "updated"),
            ("", ""),
            ("company-charges", "deleted"),
        ] {
            let client = factory.get_metrics_client(delta, event);
            assert_eq!(client.resource_type(), "null");
            assert!(Arc::ptr_eq(&client, &null_client));
        }
    }

    #[test]
    fn test_custom_table_misses_fall_back() {
        let factory = MetricsClientFactory::with_clients(HashMap::new());
        assert_eq!(factory.get_metrics_client("charges", "changed").resource_type(), "null");
    }
}
