//! Company number extraction from resource URIs

use std::fmt;
use std::sync::LazyLock;

use cm_common::ConsumerError;
use regex::Regex;
use tracing::error;

static COMPANY_NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"company/([a-zA-Z0-9]{6,10})/").expect("company number pattern is valid")
});

/// A company number taken from a resource URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompanyNumber(String);

impl CompanyNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompanyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CompanyNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Pull the company number out of `company/<number>/...`.
///
/// Both failure modes are non-retryable: a malformed URI will not change on
/// redelivery.
pub fn extract_company_number(uri: Option<&str>) -> Result<CompanyNumber, ConsumerError> {
    let uri = match uri {
        Some(uri) if !uri.trim().is_empty() => uri,
        _ => {
            error!("Could not extract company number from empty or null resource uri");
            return Err(ConsumerError::non_retryable("empty or null resource uri"));
        }
    };

    COMPANY_NUMBER_PATTERN
        .captures(uri)
        .and_then(|captures| captures.get(1))
        .map(|m| CompanyNumber(m.as_str().to_string()))
        .ok_or_else(|| {
            error!(resource_uri = %uri, "Could not extract company number from resource URI");
            ConsumerError::non_retryable(format!(
                "could not extract company number from resource URI: {}",
                uri
            ))
        })
}
