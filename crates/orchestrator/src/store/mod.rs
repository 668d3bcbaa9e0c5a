//! Artifact store clients.
//!
//! Each artifact kind lives at a fixed key under a per-domain prefix:
//!
//! ```text
//! <prefix>/server.pem   leaf + intermediates
//! <prefix>/server.key   private key
//! <prefix>/ca.pem       trust anchor
//! ```
//!
//! The issuer writes through an [`ArtifactSink`] (S3 with server-side
//! encryption). The consumer only ever reads through an [`ArtifactSource`]
//! backed by plain HTTP, so the consumer host carries no cloud credential.

mod http;
mod memory;
mod s3;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use radcert_common::{
    retry, ArtifactError, ArtifactKind, ArtifactMetadata, CertificateArtifactSet, Classify,
    DomainName, ErrorClass, RetryPolicy,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use http::HttpArtifactSource;
pub use memory::MemoryArtifactStore;
pub use s3::S3ArtifactStore;

/// Errors from the artifact store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found in store")]
    NotFound { kind: ArtifactKind },

    #[error("Access to {kind} denied: {message}")]
    Forbidden { kind: ArtifactKind, message: String },

    #[error("Store returned HTTP {status} for {kind}")]
    Status { kind: ArtifactKind, status: u16 },

    #[error("Store response for {kind} carries no entity tag")]
    MissingMetadata { kind: ArtifactKind },

    #[error("Store request timed out: {operation}")]
    Timeout { operation: String },

    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Invalid store configuration: {0}")]
    Config(String),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound { .. }
            | StoreError::Timeout { .. }
            | StoreError::Transport(_) => ErrorClass::TransientNetwork,
            StoreError::Status { status, .. } if *status >= 500 || *status == 429 => {
                ErrorClass::TransientNetwork
            }
            StoreError::Status { .. } | StoreError::Forbidden { .. } => ErrorClass::Authorization,
            StoreError::MissingMetadata { .. } | StoreError::Config(_) => ErrorClass::Validation,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "artifact_missing",
            StoreError::Forbidden { .. } => "store_access_denied",
            StoreError::Status { .. } => "store_http_status",
            StoreError::MissingMetadata { .. } => "store_metadata_missing",
            StoreError::Timeout { .. } => "store_timeout",
            StoreError::Transport(_) => "store_unreachable",
            StoreError::Config(_) => "store_misconfigured",
        }
    }
}

/// Read path: metadata and bodies
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Change-detection metadata for one artifact
    async fn head_metadata(&self, kind: ArtifactKind) -> Result<ArtifactMetadata, StoreError>;

    /// Body of one artifact
    async fn get(&self, kind: ArtifactKind) -> Result<Bytes, StoreError>;
}

/// Write path, held by the issuer only
#[async_trait]
pub trait ArtifactSink: ArtifactSource {
    async fn put(&self, kind: ArtifactKind, body: Bytes) -> Result<(), StoreError>;

    /// Remove an artifact; removing a missing artifact succeeds
    async fn delete(&self, kind: ArtifactKind) -> Result<(), StoreError>;
}

/// Store key for one artifact under `prefix`
pub fn object_key(prefix: &str, kind: ArtifactKind) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        kind.file_name().to_string()
    } else {
        format!("{}/{}", prefix, kind.file_name())
    }
}

/// Metadata for every artifact kind, fetched with retries
pub async fn head_all(
    source: &dyn ArtifactSource,
    policy: &RetryPolicy,
) -> Result<BTreeMap<ArtifactKind, ArtifactMetadata>, StoreError> {
    let mut metadata = BTreeMap::new();
    for kind in ArtifactKind::ALL {
        let meta = retry(policy, "store.head", move || source.head_metadata(kind)).await?;
        metadata.insert(kind, meta);
    }
    Ok(metadata)
}

/// Bodies for every artifact kind, fetched with retries
pub async fn get_all(
    source: &dyn ArtifactSource,
    policy: &RetryPolicy,
) -> Result<BTreeMap<ArtifactKind, Bytes>, StoreError> {
    let mut bodies = BTreeMap::new();
    for kind in ArtifactKind::ALL {
        let body = retry(policy, "store.get", move || source.get(kind)).await?;
        bodies.insert(kind, body);
    }
    Ok(bodies)
}

/// Error loading the set currently held by the store
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl Classify for LoadError {
    fn class(&self) -> ErrorClass {
        match self {
            LoadError::Store(e) => e.class(),
            LoadError::Artifact(e) => e.class(),
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            LoadError::Store(e) => e.reason(),
            LoadError::Artifact(e) => e.reason(),
        }
    }
}

/// Fetch one body, retrying transient failures.
///
/// A missing object is a definite answer here, not a transient state, so
/// it ends the retry loop as `Ok(None)`.
async fn get_if_present<S: ArtifactSource + ?Sized>(
    source: &S,
    kind: ArtifactKind,
    policy: &RetryPolicy,
) -> Result<Option<Bytes>, StoreError> {
    retry(policy, "store.get", move || async move {
        match source.get(kind).await {
            Ok(body) => Ok(Some(body)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    })
    .await
}

/// Load the set currently held by the store.
///
/// Returns `Ok(None)` when any of the three artifacts is absent.
pub async fn load_set(
    source: &dyn ArtifactSource,
    domain: &DomainName,
    policy: &RetryPolicy,
) -> Result<Option<CertificateArtifactSet>, LoadError> {
    let mut bodies = Vec::with_capacity(ArtifactKind::ALL.len());
    for kind in ArtifactKind::ALL {
        match get_if_present(source, kind, policy).await? {
            Some(body) => bodies.push(body),
            None => {
                debug!(domain = %domain, kind = %kind, "No stored artifact");
                return Ok(None);
            }
        }
    }

    let mut bodies = bodies.into_iter();
    let (Some(leaf), Some(key), Some(anchor)) = (bodies.next(), bodies.next(), bodies.next())
    else {
        return Ok(None);
    };

    let set = CertificateArtifactSet::from_parts(domain.clone(), leaf, key, anchor)?;
    Ok(Some(set))
}

/// Publish a complete set.
///
/// The previous bodies are snapshotted first. If any put fails, every
/// artifact touched so far is restored (or deleted when there was no
/// previous body), so the store keeps the old set rather than a mix.
pub async fn publish_set(
    sink: &dyn ArtifactSink,
    set: &CertificateArtifactSet,
    policy: &RetryPolicy,
) -> Result<(), StoreError> {
    let mut previous: Vec<(ArtifactKind, Option<Bytes>)> = Vec::with_capacity(3);
    for kind in ArtifactKind::ALL {
        previous.push((kind, get_if_present(sink, kind, policy).await?));
    }

    for (written, kind) in ArtifactKind::ALL.into_iter().enumerate() {
        let body = set.body(kind).clone();
        if let Err(e) = retry(policy, "store.put", move || sink.put(kind, body.clone())).await {
            warn!(
                domain = %set.domain,
                kind = %kind,
                error = %e,
                "Publishing artifact set failed, restoring previous set"
            );
            restore(sink, &previous[..=written], policy).await;
            return Err(e);
        }
        debug!(domain = %set.domain, kind = %kind, "Stored artifact");
    }

    info!(
        domain = %set.domain,
        not_after = %set.not_after,
        "Published certificate artifact set"
    );
    Ok(())
}

async fn restore(
    sink: &dyn ArtifactSink,
    previous: &[(ArtifactKind, Option<Bytes>)],
    policy: &RetryPolicy,
) {
    for (kind, body) in previous {
        let kind = *kind;
        let result = match body {
            Some(body) => retry(policy, "store.restore", move || sink.put(kind, body.clone())).await,
            None => retry(policy, "store.restore", move || sink.delete(kind)).await,
        };
        if let Err(e) = result {
            warn!(kind = %kind, error = %e, "Failed to restore artifact");
        }
    }
}
