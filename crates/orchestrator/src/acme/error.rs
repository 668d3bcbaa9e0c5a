//! ACME and DNS-01 errors

use radcert_common::{ArtifactError, Classify, ErrorClass};
use thiserror::Error;

use super::issuer::IssuanceState;
use crate::state::StateError;
use crate::store::{LoadError, StoreError};

const PROBLEM_PREFIX: &str = "urn:ietf:params:acme:error:";

/// Errors reported by a DNS provider or resolver
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS provider request failed: {0}")]
    Transport(String),

    #[error("DNS provider throttled the request: {0}")]
    Throttled(String),

    #[error("DNS provider denied the change: {0}")]
    Denied(String),

    #[error("DNS provider rejected the change: {0}")]
    Rejected(String),
}

impl Classify for DnsError {
    fn class(&self) -> ErrorClass {
        match self {
            DnsError::Transport(_) | DnsError::Throttled(_) => ErrorClass::TransientNetwork,
            DnsError::Denied(_) => ErrorClass::Authorization,
            DnsError::Rejected(_) => ErrorClass::Validation,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            DnsError::Transport(_) => "dns_unreachable",
            DnsError::Throttled(_) => "dns_throttled",
            DnsError::Denied(_) => "dns_access_denied",
            DnsError::Rejected(_) => "dns_change_rejected",
        }
    }
}

/// Errors publishing a challenge record
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to publish challenge record {record}: {source}")]
    Dns {
        record: String,
        #[source]
        source: DnsError,
    },

    #[error("Invalid challenge value for {record}")]
    InvalidValue { record: String },
}

impl Classify for PublishError {
    fn class(&self) -> ErrorClass {
        match self {
            PublishError::Dns { source, .. } => source.class(),
            PublishError::InvalidValue { .. } => ErrorClass::Validation,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            PublishError::Dns { source, .. } => source.reason(),
            PublishError::InvalidValue { .. } => "challenge_value_invalid",
        }
    }
}

/// Errors removing a challenge record
#[derive(Debug, Error)]
#[error("Failed to remove challenge record {record}: {source}")]
pub struct RemoveError {
    pub record: String,
    #[source]
    pub source: DnsError,
}

impl Classify for RemoveError {
    fn class(&self) -> ErrorClass {
        self.source.class()
    }

    fn reason(&self) -> &'static str {
        "challenge_cleanup_failed"
    }
}

/// Errors from the certificate authority
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("CA rejected the request ({problem_type}): {detail}")]
    Api {
        problem_type: String,
        detail: String,
        status: Option<u16>,
    },

    #[error("CA request failed: {0}")]
    Transport(String),

    #[error("CA did not offer a DNS-01 challenge for {0}")]
    NoDnsChallenge(String),

    #[error("Order became invalid: {0}")]
    OrderInvalid(String),

    #[error("CA did not finish {stage} within {timeout_secs}s")]
    Timeout {
        stage: &'static str,
        timeout_secs: u64,
    },

    #[error("ACME account is not loaded")]
    NoAccount,

    #[error("ACME account storage error: {0}")]
    AccountStorage(String),

    #[error("Failed to build certificate request: {0}")]
    Csr(String),
}

impl AcmeError {
    /// Short problem name, e.g. `rateLimited`
    pub fn problem(&self) -> Option<&str> {
        match self {
            AcmeError::Api { problem_type, .. } => Some(
                problem_type
                    .strip_prefix(PROBLEM_PREFIX)
                    .unwrap_or(problem_type),
            ),
            _ => None,
        }
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        match err {
            instant_acme::Error::Api(problem) => AcmeError::Api {
                problem_type: problem.r#type.unwrap_or_default(),
                detail: problem.detail.unwrap_or_default(),
                status: problem.status,
            },
            other => AcmeError::Transport(other.to_string()),
        }
    }
}

impl Classify for AcmeError {
    fn class(&self) -> ErrorClass {
        match self {
            AcmeError::Api { status, .. } => match self.problem() {
                Some("badNonce") | Some("serverInternal") => ErrorClass::TransientNetwork,
                Some("malformed") | Some("badCSR") | Some("badPublicKey") => {
                    ErrorClass::Validation
                }
                _ if status.is_some_and(|s| s >= 500) => ErrorClass::TransientNetwork,
                _ => ErrorClass::Authorization,
            },
            AcmeError::Transport(_) | AcmeError::Timeout { .. } => ErrorClass::TransientNetwork,
            AcmeError::NoDnsChallenge(_) | AcmeError::OrderInvalid(_) | AcmeError::NoAccount => {
                ErrorClass::Authorization
            }
            AcmeError::AccountStorage(_) => ErrorClass::Apply,
            AcmeError::Csr(_) => ErrorClass::Validation,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            AcmeError::Api { .. } => match self.problem() {
                Some("rateLimited") => "ca_rate_limited",
                Some("unauthorized") => "ca_unauthorized",
                Some("rejectedIdentifier") => "ca_rejected_identifier",
                Some("caa") => "ca_caa_forbidden",
                Some("dns") => "ca_dns_lookup_failed",
                Some("badNonce") => "ca_bad_nonce",
                Some("serverInternal") => "ca_server_error",
                _ => "ca_rejected",
            },
            AcmeError::Transport(_) => "ca_unreachable",
            AcmeError::NoDnsChallenge(_) => "ca_no_dns01_challenge",
            AcmeError::OrderInvalid(_) => "ca_order_invalid",
            AcmeError::Timeout { .. } => "ca_timeout",
            AcmeError::NoAccount => "acme_account_missing",
            AcmeError::AccountStorage(_) => "acme_account_storage",
            AcmeError::Csr(_) => "csr_invalid",
        }
    }
}

/// Errors ending an issuance attempt
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Challenge record {record} did not propagate within {timeout_secs}s")]
    PropagationTimeout { record: String, timeout_secs: u64 },

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error("Failed to read current certificate from store: {0}")]
    Load(#[from] LoadError),

    #[error("Failed to store issued certificate: {0}")]
    Store(#[from] StoreError),

    #[error("Issued certificate is unusable: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Invalid issuance transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: IssuanceState,
        to: IssuanceState,
    },
}

impl Classify for IssuanceError {
    fn class(&self) -> ErrorClass {
        match self {
            IssuanceError::Publish(e) => e.class(),
            IssuanceError::PropagationTimeout { .. } => ErrorClass::TransientNetwork,
            IssuanceError::Acme(e) => e.class(),
            IssuanceError::Load(e) => e.class(),
            IssuanceError::Store(e) => e.class(),
            IssuanceError::Artifact(e) => e.class(),
            IssuanceError::InvalidTransition { .. } => ErrorClass::Validation,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            IssuanceError::Publish(e) => e.reason(),
            IssuanceError::PropagationTimeout { .. } => "dns_propagation_timeout",
            IssuanceError::Acme(e) => e.reason(),
            IssuanceError::Load(e) => e.reason(),
            IssuanceError::Store(e) => e.reason(),
            IssuanceError::Artifact(e) => e.reason(),
            IssuanceError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

/// Errors from one scheduler firing
#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("Another issuance attempt for {domain} is in progress")]
    InProgress { domain: String },

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl Classify for RenewalError {
    fn class(&self) -> ErrorClass {
        match self {
            RenewalError::InProgress { .. } => ErrorClass::Concurrency,
            RenewalError::Issuance(e) => e.class(),
            RenewalError::State(e) => e.class(),
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            RenewalError::InProgress { .. } => "attempt_in_progress",
            RenewalError::Issuance(e) => e.reason(),
            RenewalError::State(e) => e.reason(),
        }
    }
}
