//! Distribution agent (consumer side).
//!
//! One cycle per trigger:
//!
//! 1. `HEAD` all three artifacts
//! 2. compare with the cached metadata; stop if nothing changed
//! 3. fetch all three bodies, even if only one changed
//! 4. check the bodies assemble into a set
//! 5. hand the set to the [`Applier`]
//! 6. only then record the new metadata
//!
//! Any failure leaves the deployed files and the cache as they were, so
//! the next trigger simply tries again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radcert_common::{
    ArtifactError, ArtifactKind, CertificateArtifactSet, Classify, DomainName, ErrorClass,
    RetryPolicy,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::deploy::ApplyError;
use crate::state::{LocalCacheState, StateError, StateStore};
use crate::store::{get_all, head_all, ArtifactSource, StoreError};

/// Consumer of a fetched set
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, set: &CertificateArtifactSet) -> Result<(), ApplyError>;
}

/// Errors ending a distribution cycle
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Fetched artifacts are unusable: {0}")]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl Classify for SyncError {
    fn class(&self) -> ErrorClass {
        match self {
            SyncError::Store(e) => e.class(),
            SyncError::Artifact(e) => e.class(),
            SyncError::Apply(e) => e.class(),
            SyncError::State(e) => e.class(),
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            SyncError::Store(e) => e.reason(),
            SyncError::Artifact(e) => e.reason(),
            SyncError::Apply(e) => e.reason(),
            SyncError::State(e) => e.reason(),
        }
    }
}

/// Result of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Store metadata matches the cache; nothing fetched or applied
    Unchanged,
    /// A set was fetched and applied; `cache` is the state to persist
    Applied {
        not_after: DateTime<Utc>,
        cache: LocalCacheState,
    },
}

/// Polls the store and applies changed sets
pub struct DistributionAgent {
    source: Arc<dyn ArtifactSource>,
    applier: Arc<dyn Applier>,
    state: Arc<dyn StateStore>,
    domain: DomainName,
    policy: RetryPolicy,
}

impl DistributionAgent {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        applier: Arc<dyn Applier>,
        state: Arc<dyn StateStore>,
        domain: DomainName,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            applier,
            state,
            domain,
            policy,
        }
    }

    /// One cycle against `cache`. Pure with respect to persisted state:
    /// the caller decides what to do with the returned cache.
    pub async fn run_cycle(
        &self,
        cache: &LocalCacheState,
        force: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let metadata = head_all(self.source.as_ref(), &self.policy).await?;

        if !force && cache.matches(&metadata) {
            debug!(domain = %self.domain, "Store metadata unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        let changed: Vec<ArtifactKind> = ArtifactKind::ALL
            .into_iter()
            .filter(|kind| cache.fingerprints.get(kind) != metadata.get(kind))
            .collect();
        info!(
            domain = %self.domain,
            changed = ?changed,
            force,
            "Fetching artifact set"
        );

        let mut bodies = get_all(self.source.as_ref(), &self.policy).await?;
        let mut take = |kind| bodies.remove(&kind).unwrap_or_default();
        let set = CertificateArtifactSet::from_parts(
            self.domain.clone(),
            take(ArtifactKind::LeafChain),
            take(ArtifactKind::PrivateKey),
            take(ArtifactKind::TrustAnchor),
        )?;

        self.applier.apply(&set).await?;

        Ok(SyncOutcome::Applied {
            not_after: set.not_after,
            cache: LocalCacheState::applied(metadata, Utc::now()),
        })
    }

    /// Load the cache, run a cycle, persist the cache after a successful apply
    pub async fn sync(&self, force: bool) -> Result<SyncOutcome, SyncError> {
        let cache = self.state.load().await?;
        let outcome = self.run_cycle(&cache, force).await?;

        if let SyncOutcome::Applied { not_after, cache } = &outcome {
            self.state.save(cache).await?;
            info!(domain = %self.domain, not_after = %not_after, "Deployed certificate set");
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for DistributionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionAgent")
            .field("domain", &self.domain)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use crate::store::{ArtifactSink, MemoryArtifactStore};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use rcgen::{CertificateParams, DistinguishedName, KeyPair};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingApplier {
        applied: Mutex<Vec<DateTime<Utc>>>,
        fail: bool,
    }

    #[async_trait]
    impl Applier for RecordingApplier {
        async fn apply(&self, set: &CertificateArtifactSet) -> Result<(), ApplyError> {
            if self.fail {
                return Err(ApplyError::Io {
                    path: "/etc/freeradius/3.0/certs/server.pem".into(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.applied.lock().push(set.not_after);
            Ok(())
        }
    }

    fn issued(valid_days: i64) -> CertificateArtifactSet {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["radius.example.com".to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(valid_days);
        let cert = params.self_signed(&key).unwrap();
        CertificateArtifactSet::from_parts(
            DomainName::new("radius.example.com"),
            Bytes::from(cert.pem()),
            Bytes::from(key.serialize_pem()),
            Bytes::from(cert.pem()),
        )
        .unwrap()
    }

    async fn seed(store: &MemoryArtifactStore, set: &CertificateArtifactSet) {
        for kind in ArtifactKind::ALL {
            store.put(kind, set.body(kind).clone()).await.unwrap();
        }
    }

    struct Fixture {
        store: Arc<MemoryArtifactStore>,
        applier: Arc<RecordingApplier>,
        state: Arc<MemoryStateStore>,
        agent: DistributionAgent,
    }

    fn fixture(applier: RecordingApplier) -> Fixture {
        let store = Arc::new(MemoryArtifactStore::new());
        let applier = Arc::new(applier);
        let state = Arc::new(MemoryStateStore::new());
        let agent = DistributionAgent::new(
            store.clone(),
            applier.clone(),
            state.clone(),
            DomainName::new("radius.example.com"),
            RetryPolicy::fixed(2, Duration::ZERO),
        );
        Fixture {
            store,
            applier,
            state,
            agent,
        }
    }

    #[tokio::test]
    async fn test_first_sync_applies_and_caches() {
        let f = fixture(RecordingApplier::default());
        let set = issued(90);
        seed(&f.store, &set).await;

        let outcome = f.agent.sync(false).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { not_after, .. } if not_after == set.not_after));
        assert_eq!(f.applier.applied.lock().len(), 1);
        assert_eq!(f.state.save_count(), 1);
        assert_eq!(f.state.current().fingerprints.len(), 3);
    }

    #[tokio::test]
    async fn test_unchanged_metadata_skips_fetch_and_apply() {
        let f = fixture(RecordingApplier::default());
        seed(&f.store, &issued(90)).await;
        f.agent.sync(false).await.unwrap();
        let gets = f.store.get_count();

        let outcome = f.agent.sync(false).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(f.store.get_count(), gets);
        assert_eq!(f.applier.applied.lock().len(), 1);
        assert_eq!(f.state.save_count(), 1);
    }

    #[tokio::test]
    async fn test_force_refetches() {
        let f = fixture(RecordingApplier::default());
        seed(&f.store, &issued(90)).await;
        f.agent.sync(false).await.unwrap();

        let outcome = f.agent.sync(true).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { .. }));
        assert_eq!(f.applier.applied.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_one_changed_artifact_refetches_all() {
        let f = fixture(RecordingApplier::default());
        let set = issued(90);
        seed(&f.store, &set).await;
        f.agent.sync(false).await.unwrap();
        let gets = f.store.get_count();

        // Same set, trust anchor rewritten with a trailing newline
        let mut anchor = set.trust_anchor.to_vec();
        anchor.push(b'\n');
        f.store
            .put(ArtifactKind::TrustAnchor, Bytes::from(anchor))
            .await
            .unwrap();

        f.agent.sync(false).await.unwrap();
        assert_eq!(f.store.get_count(), gets + 3);
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_cache() {
        let f = fixture(RecordingApplier {
            fail: true,
            ..Default::default()
        });
        seed(&f.store, &issued(90)).await;

        let err = f.agent.sync(false).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Apply);
        assert_eq!(f.state.save_count(), 0);
        assert!(f.state.current().is_empty());
    }

    #[tokio::test]
    async fn test_empty_body_aborts_cycle() {
        let f = fixture(RecordingApplier::default());
        let set = issued(90);
        seed(&f.store, &set).await;
        f.store
            .put(ArtifactKind::PrivateKey, Bytes::new())
            .await
            .unwrap();

        let err = f.agent.sync(false).await.unwrap_err();
        assert!(matches!(err, SyncError::Artifact(ArtifactError::Empty(ArtifactKind::PrivateKey))));
        assert!(f.applier.applied.lock().is_empty());
        assert_eq!(f.state.save_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_transient() {
        let f = fixture(RecordingApplier::default());
        seed(&f.store, &issued(90)).await;
        f.agent.sync(false).await.unwrap();
        let cached = f.state.current();

        f.store.delete(ArtifactKind::LeafChain).await.unwrap();

        let err = f.agent.sync(false).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientNetwork);
        assert_eq!(f.state.current(), cached);
    }
}
