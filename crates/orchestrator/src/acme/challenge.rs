//! DNS-01 challenge record management
//!
//! Publishes `_acme-challenge.<domain>` TXT records through a
//! [`DnsProvider`] and tracks the one active record per domain so cleanup
//! can always find it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use radcert_common::{retry, DomainName, RetryPolicy};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::dns::DnsProvider;
use super::error::{PublishError, RemoveError};
use super::propagation::PropagationProbe;

/// Lifecycle of a challenge record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    Pending,
    Published,
    Validated,
    Removed,
    Failed,
}

/// One challenge record owned by an issuance attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeRecord {
    pub domain: DomainName,
    pub token: String,
    pub record_name: String,
    pub record_value: String,
    pub state: ChallengeState,
}

impl ChallengeRecord {
    pub fn new(domain: DomainName, token: impl Into<String>, record_value: impl Into<String>) -> Self {
        Self {
            record_name: domain.challenge_record_name(),
            domain,
            token: token.into(),
            record_value: record_value.into(),
            state: ChallengeState::Pending,
        }
    }
}

/// Handle to a published record, needed to remove it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub domain: DomainName,
    pub record_name: String,
    pub record_value: String,
}

/// Publishes and removes challenge records
pub struct ChallengePublisher {
    provider: Arc<dyn DnsProvider>,
    probe: PropagationProbe,
    ttl: u32,
    policy: RetryPolicy,
    /// Map of domain -> published record
    active: DashMap<DomainName, RecordHandle>,
}

impl ChallengePublisher {
    pub fn new(
        provider: Arc<dyn DnsProvider>,
        probe: PropagationProbe,
        ttl: u32,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            probe,
            ttl,
            policy,
            active: DashMap::new(),
        }
    }

    /// Publish the TXT value for `domain`.
    ///
    /// An UPSERT of a single value, so publishing the same value twice
    /// succeeds and leaves one record. A different value replaces the
    /// previous one; only one record is active per domain.
    pub async fn publish(
        &self,
        domain: &DomainName,
        token: &str,
        value: &str,
    ) -> Result<RecordHandle, PublishError> {
        let record_name = domain.challenge_record_name();
        if value.trim().is_empty() {
            return Err(PublishError::InvalidValue {
                record: record_name,
            });
        }

        let provider = self.provider.as_ref();
        let name = record_name.as_str();
        let ttl = self.ttl;
        retry(&self.policy, "dns.upsert", move || provider.upsert_txt(name, value, ttl))
            .await
            .map_err(|source| PublishError::Dns {
                record: record_name.clone(),
                source,
            })?;

        let handle = RecordHandle {
            domain: domain.clone(),
            record_name,
            record_value: value.to_string(),
        };
        if let Some(previous) = self.active.insert(domain.clone(), handle.clone()) {
            if previous.record_value != handle.record_value {
                debug!(domain = %domain, "Replaced earlier challenge value");
            }
        }

        info!(domain = %domain, record = %handle.record_name, token = %token, "Published DNS-01 challenge");
        Ok(handle)
    }

    /// Remove a published record. Removing an absent record succeeds.
    pub async fn remove(&self, handle: &RecordHandle) -> Result<(), RemoveError> {
        let provider = self.provider.as_ref();
        let name = handle.record_name.as_str();
        let value = handle.record_value.as_str();
        let ttl = self.ttl;
        retry(&self.policy, "dns.delete", move || provider.delete_txt(name, value, ttl))
            .await
            .map_err(|source| RemoveError {
                record: handle.record_name.clone(),
                source,
            })?;

        self.active
            .remove_if(&handle.domain, |_, active| active.record_value == handle.record_value);
        debug!(domain = %handle.domain, record = %handle.record_name, "Removed DNS-01 challenge");
        Ok(())
    }

    /// Whether the record is visible to resolvers within `timeout`
    pub async fn await_propagation(&self, handle: &RecordHandle, timeout: Duration) -> bool {
        let visible = self
            .probe
            .await_record(&handle.record_name, &handle.record_value, timeout)
            .await;
        if !visible {
            warn!(
                record = %handle.record_name,
                timeout_secs = timeout.as_secs(),
                "Challenge record not visible before timeout"
            );
        }
        visible
    }

    /// Record currently published for `domain`
    pub fn active_record(&self, domain: &DomainName) -> Option<RecordHandle> {
        let result = self.active.get(domain).map(|h| h.clone());
        trace!(domain = %domain, found = result.is_some(), "Active challenge lookup");
        result
    }

    /// Number of domains with a published record
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl std::fmt::Debug for ChallengePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengePublisher")
            .field("ttl", &self.ttl)
            .field("active", &self.active.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::dns::MemoryDns;

    fn publisher(dns: Arc<MemoryDns>) -> ChallengePublisher {
        let probe = PropagationProbe::new(dns.clone(), Duration::ZERO, Duration::from_millis(10));
        ChallengePublisher::new(dns, probe, 60, RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let dns = Arc::new(MemoryDns::new());
        let publisher = publisher(dns.clone());
        let domain = DomainName::new("radius.example.com");

        let first = publisher.publish(&domain, "tok", "digest").await.unwrap();
        let second = publisher.publish(&domain, "tok", "digest").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(dns.record_count(), 1);
        assert_eq!(dns.values("_acme-challenge.radius.example.com"), vec!["digest"]);
        assert_eq!(publisher.active_count(), 1);
    }

    #[tokio::test]
    async fn test_new_value_replaces_old() {
        let dns = Arc::new(MemoryDns::new());
        let publisher = publisher(dns.clone());
        let domain = DomainName::new("radius.example.com");

        publisher.publish(&domain, "tok1", "first").await.unwrap();
        publisher.publish(&domain, "tok2", "second").await.unwrap();

        assert_eq!(dns.values("_acme-challenge.radius.example.com"), vec!["second"]);
        assert_eq!(
            publisher.active_record(&domain).unwrap().record_value,
            "second"
        );
    }

    #[tokio::test]
    async fn test_empty_value_rejected() {
        let dns = Arc::new(MemoryDns::new());
        let publisher = publisher(dns.clone());

        let err = publisher
            .publish(&DomainName::new("radius.example.com"), "tok", " ")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidValue { .. }));
        assert_eq!(dns.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_clears_record() {
        let dns = Arc::new(MemoryDns::new());
        let publisher = publisher(dns.clone());
        let domain = DomainName::new("radius.example.com");

        let handle = publisher.publish(&domain, "tok", "digest").await.unwrap();
        publisher.remove(&handle).await.unwrap();
        // Second removal is a no-op
        publisher.remove(&handle).await.unwrap();

        assert_eq!(dns.record_count(), 0);
        assert_eq!(publisher.active_count(), 0);
    }

    #[tokio::test]
    async fn test_await_propagation() {
        let dns = Arc::new(MemoryDns::new().with_propagation_delay(1));
        let publisher = publisher(dns.clone());
        let domain = DomainName::new("radius.example.com");

        let handle = publisher.publish(&domain, "tok", "digest").await.unwrap();
        assert!(publisher.await_propagation(&handle, Duration::from_secs(5)).await);
    }

    #[test]
    fn test_record_name() {
        let record = ChallengeRecord::new(DomainName::new("Radius.Example.com."), "tok", "v");
        assert_eq!(record.record_name, "_acme-challenge.radius.example.com");
        assert_eq!(record.state, ChallengeState::Pending);
    }
}
