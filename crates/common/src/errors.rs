//! Error classification shared by every component.
//!
//! Component errors stay specific (`StoreError`, `ApplyError`, ...) but all
//! of them map onto one small taxonomy that decides two things: whether a
//! failure is retried locally, and what the trigger boundary reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or API hiccup, retried with backoff
    TransientNetwork,
    /// CA or DNS provider refused the operation; needs an operator
    Authorization,
    /// An artifact failed structural checks
    Validation,
    /// Another attempt is already in flight; reported as a no-op
    Concurrency,
    /// Filesystem or reload failure on the consumer host
    Apply,
}

impl ErrorClass {
    /// Only transient network errors are retried locally
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientNetwork)
    }

    /// Concurrency errors are benign and surface as a no-op
    pub fn is_benign(self) -> bool {
        matches!(self, ErrorClass::Concurrency)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::Authorization => "authorization",
            ErrorClass::Validation => "validation",
            ErrorClass::Concurrency => "concurrency",
            ErrorClass::Apply => "apply",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a component error onto the shared taxonomy.
pub trait Classify {
    /// Taxonomy class of this error
    fn class(&self) -> ErrorClass;

    /// Stable, machine-readable reason code (e.g. `dns_propagation_timeout`)
    fn reason(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorClass::TransientNetwork.is_retryable());
        assert!(!ErrorClass::Authorization.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::Concurrency.is_retryable());
        assert!(!ErrorClass::Apply.is_retryable());
    }

    #[test]
    fn test_serialized_names_match_display() {
        for class in [
            ErrorClass::TransientNetwork,
            ErrorClass::Authorization,
            ErrorClass::Validation,
            ErrorClass::Concurrency,
            ErrorClass::Apply,
        ] {
            let json = serde_json::to_string(&class).unwrap();
            assert_eq!(json, format!("\"{}\"", class));
        }
    }
}
