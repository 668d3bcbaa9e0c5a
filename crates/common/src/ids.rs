//! Type-safe identifier newtypes for radcert.
//!
//! Keeps attempt identifiers and domain names from being mixed up with
//! other strings flowing through the issuer and the distribution agent.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one issuance attempt.
///
/// Attempt IDs show up in every log line of an attempt, in the
/// in-progress marker that guards a domain, and in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(String);

impl AttemptId {
    /// Create a new random attempt ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in temporary file names
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AttemptId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A DNS name a certificate is issued for.
///
/// Stored lower-cased without a trailing dot so comparisons against
/// certificate SANs and store prefixes are stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the DNS-01 TXT record for this domain.
    ///
    /// Wildcard names validate against the base domain.
    pub fn challenge_record_name(&self) -> String {
        let base = self.0.strip_prefix("*.").unwrap_or(&self.0);
        format!("_acme-challenge.{}", base)
    }

    /// Whether a certificate name (possibly a wildcard) covers this domain
    pub fn is_covered_by(&self, cert_name: &str) -> bool {
        let cert_name = cert_name.trim_end_matches('.').to_ascii_lowercase();
        if cert_name == self.0 {
            return true;
        }
        match cert_name.strip_prefix("*.") {
            Some(suffix) => self
                .0
                .split_once('.')
                .map(|(label, rest)| !label.is_empty() && rest == suffix)
                .unwrap_or(false),
            None => false,
        }
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DomainName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for DomainName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<DomainName> for String {
    fn from(d: DomainName) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_id() {
        let id1 = AttemptId::new();
        let id2 = AttemptId::from_string("attempt-1");

        assert_ne!(id1, id2);
        assert_eq!(id2.as_str(), "attempt-1");
        assert_eq!(id1.short().len(), 8);
    }

    #[test]
    fn test_domain_name_normalized() {
        let domain = DomainName::new("Radius.Example.COM.");
        assert_eq!(domain.as_str(), "radius.example.com");
        assert_eq!(
            domain.challenge_record_name(),
            "_acme-challenge.radius.example.com"
        );
    }

    #[test]
    fn test_wildcard_challenge_name() {
        let domain = DomainName::new("*.example.com");
        assert_eq!(domain.challenge_record_name(), "_acme-challenge.example.com");
    }

    #[test]
    fn test_domain_coverage() {
        let domain = DomainName::new("radius.example.com");
        assert!(domain.is_covered_by("radius.example.com"));
        assert!(domain.is_covered_by("RADIUS.example.com."));
        assert!(domain.is_covered_by("*.example.com"));
        assert!(!domain.is_covered_by("*.radius.example.com"));
        assert!(!domain.is_covered_by("other.example.com"));
        assert!(!DomainName::new("example.com").is_covered_by("*.example.com"));
    }
}
