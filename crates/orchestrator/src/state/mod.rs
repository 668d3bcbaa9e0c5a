//! Persisted state.
//!
//! Two records survive between invocations:
//!
//! - [`LocalCacheState`]: the metadata of the last artifact set the
//!   consumer applied successfully.
//! - the in-progress marker for issuance attempts, see [`lease`].
//!
//! Both are passed in and handed back explicitly; nothing is kept in
//! process-global state.

pub mod lease;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use radcert_common::{ArtifactKind, ArtifactMetadata, Classify, ErrorClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub use lease::{FileLeaseStore, LeaseStore, MemoryLeaseStore};

/// Errors from persisted state
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Classify for StateError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Apply
    }

    fn reason(&self) -> &'static str {
        match self {
            StateError::Io { .. } => "state_io",
            StateError::Corrupt { .. } => "state_corrupt",
        }
    }
}

/// Fingerprints of the last successfully applied artifact set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCacheState {
    pub fingerprints: BTreeMap<ArtifactKind, ArtifactMetadata>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
}

impl LocalCacheState {
    /// Whether every artifact kind is cached with exactly this metadata
    pub fn matches(&self, current: &BTreeMap<ArtifactKind, ArtifactMetadata>) -> bool {
        ArtifactKind::ALL.iter().all(|kind| {
            matches!(
                (self.fingerprints.get(kind), current.get(kind)),
                (Some(cached), Some(seen)) if cached == seen
            )
        })
    }

    /// Cache state after a successful apply of `metadata`
    pub fn applied(metadata: BTreeMap<ArtifactKind, ArtifactMetadata>, at: DateTime<Utc>) -> Self {
        Self {
            fingerprints: metadata,
            applied_at: Some(at),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Storage for [`LocalCacheState`]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the cache; a missing record is an empty cache
    async fn load(&self) -> Result<LocalCacheState, StateError>;

    async fn save(&self, state: &LocalCacheState) -> Result<(), StateError>;
}

/// JSON file, replaced atomically on save
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<LocalCacheState, StateError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %self.path.display(), "No cache state yet");
                return Ok(LocalCacheState::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        // The cache only saves work; a damaged one means "apply again"
        match serde_json::from_slice(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Discarding unreadable cache state"
                );
                Ok(LocalCacheState::default())
            }
        }
    }

    async fn save(&self, state: &LocalCacheState) -> Result<(), StateError> {
        let content = serde_json::to_vec_pretty(state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &content))
            .await
            .map_err(|e| self.io_error(std::io::Error::other(e)))?
            .map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), "Saved cache state");
        Ok(())
    }
}

fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// In-memory state for tests
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<LocalCacheState>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: LocalCacheState) -> Self {
        Self {
            state: Mutex::new(state),
            saves: Mutex::new(0),
        }
    }

    pub fn current(&self) -> LocalCacheState {
        self.state.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<LocalCacheState, StateError> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &LocalCacheState) -> Result<(), StateError> {
        *self.state.lock() = state.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}
