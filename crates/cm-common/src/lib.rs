use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Inbound Event Types
// ============================================================================

/// A decoded resource change notification as delivered by the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChangedData {
    pub context_id: String,
    pub resource_id: String,
    pub resource_kind: String,
    pub resource_uri: Option<String>,
    /// Opaque resource body, never inspected here
    #[serde(default)]
    pub data: Option<String>,
    pub event: EventRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// Builds the audit trail sent downstream as `internalData.updatedBy`
pub fn updated_by(topic: &str, partition: i32, offset: i64) -> String {
    format!("{}-{}-{}", topic, partition, offset)
}

// ============================================================================
// Routing Keys
// ============================================================================

/// Category of the changed resource, derived from the inbound topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeltaType {
    Charges,
    Officers,
    Pscs,
    PscStatements,
    Registers,
}

impl DeltaType {
    pub const ALL: [DeltaType; 5] = [
        DeltaType::Charges,
        DeltaType::Officers,
        DeltaType::Pscs,
        DeltaType::PscStatements,
        DeltaType::Registers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaType::Charges => "charges",
            DeltaType::Officers => "officers",
            DeltaType::Pscs => "pscs",
            DeltaType::PscStatements => "psc-statements",
            DeltaType::Registers => "registers",
        }
    }
}

impl fmt::Display for DeltaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeltaType {
    type Err = UnknownKey;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "charges" => Ok(DeltaType::Charges),
            "officers" | "appointments" => Ok(DeltaType::Officers),
            "pscs" => Ok(DeltaType::Pscs),
            "psc-statements" => Ok(DeltaType::PscStatements),
            "registers" => Ok(DeltaType::Registers),
            _ => Err(UnknownKey(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Changed,
    Deleted,
}

impl EventType {
    pub const ALL: [EventType; 2] = [EventType::Changed, EventType::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Changed => "changed",
            EventType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownKey;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("changed") {
            Ok(EventType::Changed)
        } else if s.eq_ignore_ascii_case("deleted") {
            Ok(EventType::Deleted)
        } else {
            Err(UnknownKey(s.to_string()))
        }
    }
}

/// A delta or event type string with no routing entry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown routing key: {0}")]
pub struct UnknownKey(pub String);

// ============================================================================
// Recalculation Payload
// ============================================================================

/// Which aggregate metric the downstream service must recompute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricCategory {
    Mortgage,
    Appointments,
    PersonsWithSignificantControl,
    Registers,
}

/// Body of `POST /company/{company_number}/metrics/recalculate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculateRequest {
    pub mortgage: bool,
    pub appointments: bool,
    pub persons_with_significant_control: bool,
    pub registers: bool,
    pub internal_data: InternalData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalData {
    pub updated_by: String,
}

impl RecalculateRequest {
    /// Exactly one flag is set, the one matching `category`.
    pub fn for_category(category: MetricCategory, updated_by: impl Into<String>) -> Self {
        Self {
            mortgage: category == MetricCategory::Mortgage,
            appointments: category == MetricCategory::Appointments,
            persons_with_significant_control: category
                == MetricCategory::PersonsWithSignificantControl,
            registers: category == MetricCategory::Registers,
            internal_data: InternalData {
                updated_by: updated_by.into(),
            },
        }
    }

    pub fn flags(&self) -> [bool; 4] {
        [
            self.mortgage,
            self.appointments,
            self.persons_with_significant_control,
            self.registers,
        ]
    }
}

// ============================================================================
// Consumer Outcome Types
// ============================================================================

/// ACK/NACK response sent back to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckNack {
    Ack,
    Nack { delay_ms: Option<u64> },
}

/// Where a processed message ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Recalculation requested
    Success,
    /// Republished to the retry topic
    RetryPending { topic: String, attempt: u32 },
    /// Retries exhausted, moved to the error topic
    DeadLettered { topic: String },
    /// Not processable, moved to the invalid topic
    Invalid { topic: String },
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Success => "success",
            Disposition::RetryPending { .. } => "retry",
            Disposition::DeadLettered { .. } => "error",
            Disposition::Invalid { .. } => "invalid",
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure classified for the retry protocol
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("{message}")]
    Retryable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{message}")]
    NonRetryable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl ConsumerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            source: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable {
            message: message.into(),
            source: None,
        }
    }

    pub fn retryable_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Retryable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn non_retryable_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::NonRetryable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumerError::Retryable { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recalculate_request_is_one_hot() {
        let categories = [
            MetricCategory::Mortgage,
            MetricCategory::Appointments,
            MetricCategory::PersonsWithSignificantControl,
            MetricCategory::Registers,
        ];
        for category in categories {
            let request = RecalculateRequest::for_category(category, "topic-0-1");
            assert_eq!(request.flags().iter().filter(|f| **f).count(), 1);
            assert_eq!(request.internal_data.updated_by, "topic-0-1");
        }
    }

    #[test]
    fn test_recalculate_request_wire_format() {
        let request = RecalculateRequest::for_category(
            MetricCategory::PersonsWithSignificantControl,
            "stream-company-psc-1-42",
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "mortgage": false,
                "appointments": false,
                "personsWithSignificantControl": true,
                "registers": false,
                "internalData": { "updatedBy": "stream-company-psc-1-42" }
            })
        );
    }

    #[test]
    fn test_delta_type_parsing() {
        assert_eq!("charges".parse::<DeltaType>(), Ok(DeltaType::Charges));
        assert_eq!("Officers".parse::<DeltaType>(), Ok(DeltaType::Officers));
        assert_eq!("appointments".parse::<DeltaType>(), Ok(DeltaType::Officers));
        assert_eq!("psc-statements".parse::<DeltaType>(), Ok(DeltaType::PscStatements));
        assert_eq!(
            "unknown-type".parse::<DeltaType>(),
            Err(UnknownKey("unknown-type".to_string()))
        );
    }

    #[test]
    fn test_event_type_parsing_is_case_insensitive() {
        assert_eq!("CHANGED".parse::<EventType>(), Ok(EventType::Changed));
        assert_eq!("Deleted".parse::<EventType>(), Ok(EventType::Deleted));
        assert_eq!("updated".parse::<EventType>(), Err(UnknownKey("updated".to_string())));
    }

    #[test]
    fn test_resource_changed_data_deserialization() {
        let json = r#"{
            "context_id": "ctx-1",
            "resource_id": "abc",
            "resource_kind": "company-charges",
            "resource_uri": "/company/01203396/charges/abc",
            "data": "{}",
            "event": { "type": "changed", "published_at": "2024-01-01T00:00:00" }
        }"#;
        let event: ResourceChangedData = serde_json::from_str(json).unwrap();
        assert_eq!(event.event.event_type, "changed");
        assert_eq!(event.resource_uri.as_deref(), Some("/company/01203396/charges/abc"));
    }

    #[test]
    fn test_updated_by_format() {
        assert_eq!(updated_by("stream-company-charges", 3, 1042), "stream-company-charges-3-1042");
    }

    #[test]
    fn test_consumer_error_classification() {
        assert!(ConsumerError::retryable("x").is_retryable());
        assert!(!ConsumerError::non_retryable("x").is_retryable());
        assert_eq!(ConsumerError::non_retryable("boom").to_string(), "boom");
    }
}
