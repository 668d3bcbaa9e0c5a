//! Renewal scheduler
//!
//! One firing per external trigger: take the domain's in-progress marker,
//! let the issuer decide renew-or-skip, release the marker. A firing that
//! finds the marker held returns [`RenewalError::InProgress`], which the
//! trigger boundary reports as a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use radcert_common::{AttemptId, Classify, DomainName};
use tracing::{debug, info, warn};

use super::client::CertificateAuthority;
use super::error::RenewalError;
use super::issuer::{IssueOutcome, Issuer};
use crate::state::LeaseStore;

/// Default lifetime of the in-progress marker (15 minutes)
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

/// Result of one firing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// A new certificate was issued and stored
    Renewed {
        not_after: DateTime<Utc>,
        attempt_id: AttemptId,
    },
    /// The stored certificate is outside the renewal window
    NotDue { not_after: DateTime<Utc> },
}

/// Externally triggered renewal controller for one domain
pub struct RenewalScheduler<C: CertificateAuthority> {
    issuer: Arc<Issuer<C>>,
    leases: Arc<dyn LeaseStore>,
    domain: DomainName,
    contact: String,
    lease_ttl: Duration,
}

impl<C: CertificateAuthority> RenewalScheduler<C> {
    pub fn new(
        issuer: Arc<Issuer<C>>,
        leases: Arc<dyn LeaseStore>,
        domain: DomainName,
        contact: impl Into<String>,
    ) -> Self {
        Self {
            issuer,
            leases,
            domain,
            contact: contact.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Set how long a marker outlives a crashed attempt
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    /// Run one firing. `force` renews regardless of remaining validity.
    pub async fn fire(&self, force: bool) -> Result<RenewalOutcome, RenewalError> {
        let holder = AttemptId::new();
        if !self
            .leases
            .try_acquire(&self.domain, &holder, self.lease_ttl)
            .await?
        {
            info!(domain = %self.domain, "Renewal already in progress, skipping");
            return Err(RenewalError::InProgress {
                domain: self.domain.to_string(),
            });
        }
        debug!(domain = %self.domain, holder = %holder, "Acquired renewal marker");

        let result = self.issuer.issue(&self.domain, &self.contact, force).await;

        if let Err(e) = self.leases.release(&self.domain, &holder).await {
            warn!(domain = %self.domain, error = %e, "Failed to release renewal marker");
        }

        match result {
            Ok(IssueOutcome::Current(set)) => Ok(RenewalOutcome::NotDue {
                not_after: set.not_after,
            }),
            Ok(IssueOutcome::Issued { set, attempt }) => {
                info!(
                    domain = %self.domain,
                    attempt = %attempt.id,
                    not_after = %set.not_after,
                    "Certificate renewed"
                );
                Ok(RenewalOutcome::Renewed {
                    not_after: set.not_after,
                    attempt_id: attempt.id,
                })
            }
            Err(e) => {
                warn!(
                    domain = %self.domain,
                    class = %e.class(),
                    reason = e.reason(),
                    error = %e,
                    "Renewal failed"
                );
                Err(e.into())
            }
        }
    }
}

impl<C: CertificateAuthority> std::fmt::Debug for RenewalScheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("domain", &self.domain)
            .field("contact", &self.contact)
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}
