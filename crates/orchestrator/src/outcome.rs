//! Trigger outcome reporting.
//!
//! Every invocation ends with one JSON line on stdout and an exit status
//! an external timer can act on:
//!
//! | outcome        | exit |
//! |----------------|------|
//! | `success`      | 0    |
//! | `failure`      | 1    |
//! | `config_error` | 2    |
//! | `noop`         | 3    |

use std::fmt::Display;

use chrono::{DateTime, Utc};
use radcert_common::{AttemptId, Classify, DomainName, ErrorClass};
use serde::Serialize;

/// Exit status for work done
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status for a failed run
pub const EXIT_FAILURE: i32 = 1;
/// Exit status for configuration or usage errors
pub const EXIT_CONFIG: i32 = 2;
/// Exit status when there was nothing to do
pub const EXIT_NOOP: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Noop,
    Failure,
    ConfigError,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => EXIT_SUCCESS,
            Outcome::Noop => EXIT_NOOP,
            Outcome::Failure => EXIT_FAILURE,
            Outcome::ConfigError => EXIT_CONFIG,
        }
    }
}

/// Machine-readable result of one trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    pub command: &'static str,
    pub outcome: Outcome,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TriggerReport {
    fn new(command: &'static str, outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            command,
            outcome,
            reason: reason.into(),
            class: None,
            domain: None,
            not_after: None,
            attempt_id: None,
            message: None,
        }
    }

    pub fn success(command: &'static str, reason: impl Into<String>) -> Self {
        Self::new(command, Outcome::Success, reason)
    }

    pub fn noop(command: &'static str, reason: impl Into<String>) -> Self {
        Self::new(command, Outcome::Noop, reason)
    }

    pub fn config_error(command: &'static str, message: impl Display) -> Self {
        let mut report = Self::new(command, Outcome::ConfigError, "config_invalid");
        report.message = Some(message.to_string());
        report
    }

    pub fn failure(
        command: &'static str,
        reason: impl Into<String>,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        let mut report = Self::new(command, Outcome::Failure, reason);
        report.class = Some(class);
        report.message = Some(message.into());
        report
    }

    /// Report for a classified error. Concurrency errors are benign and
    /// become a no-op.
    pub fn from_error<E: Classify + Display>(command: &'static str, err: &E) -> Self {
        let class = err.class();
        let outcome = if class.is_benign() {
            Outcome::Noop
        } else {
            Outcome::Failure
        };
        let mut report = Self::new(command, outcome, err.reason());
        report.class = Some(class);
        report.message = Some(err.to_string());
        report
    }

    pub fn with_domain(mut self, domain: &DomainName) -> Self {
        self.domain = Some(domain.clone());
        self
    }

    pub fn with_not_after(mut self, not_after: DateTime<Utc>) -> Self {
        self.not_after = Some(not_after);
        self
    }

    pub fn with_attempt(mut self, attempt_id: AttemptId) -> Self {
        self.attempt_id = Some(attempt_id);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"command\":\"{}\",\"outcome\":\"failure\",\"reason\":\"report_unserializable\",\"message\":\"{}\"}}",
                self.command, e
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::RenewalError;
    use crate::store::StoreError;
    use radcert_common::ArtifactKind;

    #[test]
    fn test_exit_codes() {
        assert_eq!(TriggerReport::success("renew", "renewed").exit_code(), 0);
        assert_eq!(TriggerReport::noop("sync", "unchanged").exit_code(), 3);
        assert_eq!(TriggerReport::config_error("renew", "bad").exit_code(), 2);
    }

    #[test]
    fn test_concurrency_is_noop() {
        let err = RenewalError::InProgress {
            domain: "radius.example.com".to_string(),
        };
        let report = TriggerReport::from_error("renew", &err);
        assert_eq!(report.outcome, Outcome::Noop);
        assert_eq!(report.reason, "attempt_in_progress");
        assert_eq!(report.exit_code(), 3);
    }

    #[test]
    fn test_failure_line() {
        let err = StoreError::Forbidden {
            kind: ArtifactKind::LeafChain,
            message: "HTTP 403".to_string(),
        };
        let report = TriggerReport::from_error("sync", &err)
            .with_domain(&DomainName::new("radius.example.com"));
        assert_eq!(report.exit_code(), 1);

        let json: serde_json::Value = serde_json::from_str(&report.to_json_line()).unwrap();
        assert_eq!(json["command"], "sync");
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["reason"], "store_access_denied");
        assert_eq!(json["class"], "authorization");
        assert_eq!(json["domain"], "radius.example.com");
        assert!(json.get("attempt_id").is_none());
    }
}
