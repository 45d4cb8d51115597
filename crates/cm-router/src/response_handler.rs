//! Classification of downstream API failures
//!
//! | Failure                 | Classification |
//! |-------------------------|----------------|
//! | Illegal argument        | Retryable      |
//! | URI validation          | Non-retryable  |
//! | 5xx response            | Retryable      |
//! | Other non-2xx response  | Non-retryable  |
//! | Transport (no response) | Retryable      |

use cm_common::ConsumerError;
use tracing::{error, info};

use crate::api::ApiError;

#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseHandler;

impl ResponseHandler {
    pub fn new() -> Self {
        Self
    }

    /// Turn an API failure into the error the retry protocol acts on
    pub fn handle(&self, company_number: &str, resource_type: &str, error: ApiError) -> ConsumerError {
        let message = format!(
            "Failed recalculating {} for company {}",
            resource_type, company_number
        );

        let retryable = match &error {
            ApiError::IllegalArgument(cause) => {
                error!(
                    company_number = %company_number,
                    resource_type = %resource_type,
                    cause = %cause,
                    "Illegal argument building API request"
                );
                true
            }
            ApiError::UriValidation(cause) => {
                error!(
                    company_number = %company_number,
                    resource_type = %resource_type,
                    cause = %cause,
                    "Invalid URI"
                );
                false
            }
            ApiError::Response { status, .. } if (500..600).contains(status) => {
                error!(
                    company_number = %company_number,
                    resource_type = %resource_type,
                    status = *status,
                    "Server error returned"
                );
                true
            }
            ApiError::Response { status, .. } => {
                info!(
                    company_number = %company_number,
                    resource_type = %resource_type,
                    status = *status,
                    "Client error returned"
                );
                false
            }
            ApiError::Transport(cause) => {
                error!(
                    company_number = %company_number,
                    resource_type = %resource_type,
                    cause = %cause,
                    "No response from API"
                );
                true
            }
        };

        if retryable {
            ConsumerError::retryable_with(message, error)
        } else {
            ConsumerError::non_retryable_with(message, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(error: ApiError) -> ConsumerError {
        ResponseHandler::new().handle("12345678", "registers", error)
    }

    #[test]
    fn test_server_errors_are_retryable() {
        for status in [500, 502, 503, 599] {
            assert!(classify(ApiError::response(status, "")).is_retryable(), "status {}", status);
        }
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        for status in [400, 401, 404, 409] {
            assert!(!classify(ApiError::response(status, "")).is_retryable(), "status {}", status);
        }
    }

    #[test]
    fn test_argument_and_uri_failures() {
        assert!(classify(ApiError::IllegalArgument("bad".into())).is_retryable());
        assert!(!classify(ApiError::UriValidation("bad".into())).is_retryable());
        assert!(classify(ApiError::Transport("refused".into())).is_retryable());
    }

    #[test]
    fn test_classification_is_stable() {
        for _ in 0..3 {
            assert!(classify(ApiError::response(500, "")).is_retryable());
            assert!(!classify(ApiError::response(404, "")).is_retryable());
        }
    }

    #[test]
    fn test_message_and_source() {
        let err = classify(ApiError::response(404, "not found"));
        assert_eq!(err.to_string(), "Failed recalculating registers for company 12345678");
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("404"));
    }
}
