//! In-memory artifact store for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use radcert_common::{content_fingerprint, ArtifactKind, ArtifactMetadata};
use tracing::trace;

use super::{ArtifactSink, ArtifactSource, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

/// Artifact store held in process memory.
///
/// Counts reads so callers can assert that nothing was fetched, and can be
/// told to fail puts for chosen kinds.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<ArtifactKind, StoredObject>>,
    failing_puts: Mutex<HashSet<ArtifactKind>>,
    heads: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put of `kind` fail with a transport error
    pub fn fail_puts_for(&self, kind: ArtifactKind) {
        self.failing_puts.lock().insert(kind);
    }

    pub fn clear_failures(&self) {
        self.failing_puts.lock().clear();
    }

    /// Number of metadata requests served
    pub fn head_count(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    /// Number of body requests served
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of successful writes
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for MemoryArtifactStore {
    async fn head_metadata(&self, kind: ArtifactKind) -> Result<ArtifactMetadata, StoreError> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock();
        let object = objects.get(&kind).ok_or(StoreError::NotFound { kind })?;
        Ok(ArtifactMetadata::new(
            object.etag.clone(),
            Some(object.last_modified),
        ))
    }

    async fn get(&self, kind: ArtifactKind) -> Result<Bytes, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock();
        objects
            .get(&kind)
            .map(|object| object.body.clone())
            .ok_or(StoreError::NotFound { kind })
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifactStore {
    async fn put(&self, kind: ArtifactKind, body: Bytes) -> Result<(), StoreError> {
        if self.failing_puts.lock().contains(&kind) {
            return Err(StoreError::Transport(format!("injected failure for {}", kind)));
        }

        let object = StoredObject {
            etag: format!("\"{}\"", content_fingerprint(&body)),
            last_modified: Utc::now().trunc_subsecs(0),
            body,
        };
        trace!(kind = %kind, etag = %object.etag, "Stored object in memory");
        self.objects.lock().insert(kind, object);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, kind: ArtifactKind) -> Result<(), StoreError> {
        self.objects.lock().remove(&kind);
        Ok(())
    }
}
