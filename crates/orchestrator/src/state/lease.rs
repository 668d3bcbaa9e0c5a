//! In-progress markers for issuance attempts.
//!
//! A marker names the attempt holding it and expires after a TTL, so a
//! crashed attempt blocks renewals for at most that long.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use radcert_common::{AttemptId, DomainName};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

use super::StateError;

/// Mutual exclusion for issuance attempts on one domain
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the marker for `domain`.
    ///
    /// Returns `Ok(false)` when another unexpired marker is held.
    async fn try_acquire(
        &self,
        domain: &DomainName,
        holder: &AttemptId,
        ttl: Duration,
    ) -> Result<bool, StateError>;

    /// Drop the marker if `holder` still owns it
    async fn release(&self, domain: &DomainName, holder: &AttemptId) -> Result<(), StateError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Marker {
    holder: AttemptId,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Marker {
    fn new(holder: &AttemptId, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            holder: holder.clone(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What is on disk at a marker path
#[derive(Debug)]
enum OnDisk {
    Missing,
    Parsed(Marker),
    /// Present but not a marker; only its age is known
    Unreadable { age: Option<Duration> },
}

impl OnDisk {
    /// Whether the entry still blocks other attempts.
    ///
    /// An unreadable marker is aged by its mtime against the caller's TTL,
    /// so a holder that crashed mid-write cannot be displaced early.
    fn is_live(&self, ttl: Duration) -> bool {
        match self {
            OnDisk::Missing => false,
            OnDisk::Parsed(marker) => !marker.is_expired(Utc::now()),
            OnDisk::Unreadable { age } => age.map(|age| age < ttl).unwrap_or(true),
        }
    }

    fn holder(&self) -> Option<&AttemptId> {
        match self {
            OnDisk::Parsed(marker) => Some(&marker.holder),
            _ => None,
        }
    }
}

/// Marker files in a state directory.
///
/// A marker is written to a private temp file and published with a hard
/// link, which fails if the name exists, so readers never see a partial
/// marker. Takeover of a stale marker and release run under an exclusive
/// `flock` on a per-domain guard file.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn marker_path(&self, domain: &DomainName) -> PathBuf {
        self.dir.join(format!("{}.lock", domain))
    }

    fn guard_path(&self, domain: &DomainName) -> PathBuf {
        self.dir.join(format!(".{}.lock.guard", domain))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StateError {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn write_temp(path: &Path, marker: &Marker) -> Result<PathBuf, StateError> {
        let temp = path.with_extension(format!("lock.tmp-{}", marker.holder));
        let content = serde_json::to_vec(marker).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        let written = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .and_then(|mut file| {
                file.write_all(&content)?;
                file.sync_all()
            });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp);
            return Err(Self::io_error(&temp, e));
        }
        Ok(temp)
    }

    /// Publish `marker` only if no marker exists
    fn create(path: &Path, marker: &Marker) -> Result<bool, StateError> {
        let temp = Self::write_temp(path, marker)?;
        let linked = std::fs::hard_link(&temp, path);
        let _ = std::fs::remove_file(&temp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Self::io_error(path, e)),
        }
    }

    /// Publish `marker` over whatever is there
    fn replace(path: &Path, marker: &Marker) -> Result<(), StateError> {
        let temp = Self::write_temp(path, marker)?;
        std::fs::rename(&temp, path).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            Self::io_error(path, e)
        })
    }

    fn read(path: &Path) -> Result<OnDisk, StateError> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(OnDisk::Missing),
            Err(e) => return Err(Self::io_error(path, e)),
        };
        if let Ok(marker) = serde_json::from_slice(&content) {
            return Ok(OnDisk::Parsed(marker));
        }

        let age = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        Ok(OnDisk::Unreadable { age })
    }

    fn remove(path: &Path) -> Result<(), StateError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(path, e)),
        }
    }

    #[cfg(unix)]
    fn lock_guard(path: &Path) -> Result<Flock<std::fs::File>, StateError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Self::io_error(path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Self::io_error(path, std::io::Error::from(errno)))
    }

    #[cfg(not(unix))]
    fn lock_guard(_path: &Path) -> Result<(), StateError> {
        Ok(())
    }

    fn acquire_blocking(
        dir: &Path,
        path: &Path,
        guard: &Path,
        domain: &DomainName,
        marker: &Marker,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        std::fs::create_dir_all(dir).map_err(|e| Self::io_error(dir, e))?;

        if Self::create(path, marker)? {
            debug!(domain = %domain, attempt = %marker.holder, "Acquired in-progress marker");
            return Ok(true);
        }

        let _guard = Self::lock_guard(guard)?;
        let existing = Self::read(path)?;
        if existing.is_live(ttl) {
            debug!(
                domain = %domain,
                holder = ?existing.holder().map(ToString::to_string),
                "Another attempt holds the in-progress marker"
            );
            return Ok(false);
        }

        match existing {
            OnDisk::Missing => Self::create(path, marker),
            stale => {
                warn!(
                    domain = %domain,
                    stale_holder = ?stale.holder().map(ToString::to_string),
                    "Taking over stale in-progress marker"
                );
                Self::replace(path, marker)?;
                Ok(true)
            }
        }
    }

    fn release_blocking(
        path: &Path,
        guard: &Path,
        domain: &DomainName,
        holder: &AttemptId,
    ) -> Result<(), StateError> {
        if !path.exists() {
            return Ok(());
        }
        let _guard = Self::lock_guard(guard)?;
        match Self::read(path)? {
            OnDisk::Parsed(existing) if existing.holder == *holder => {
                Self::remove(path)?;
                debug!(domain = %domain, attempt = %holder, "Released in-progress marker");
            }
            OnDisk::Parsed(existing) => {
                warn!(
                    domain = %domain,
                    attempt = %holder,
                    holder = %existing.holder,
                    "In-progress marker was taken over, leaving it in place"
                );
            }
            OnDisk::Unreadable { .. } => {
                warn!(
                    domain = %domain,
                    attempt = %holder,
                    "Unreadable in-progress marker, leaving it in place"
                );
            }
            OnDisk::Missing => {}
        }
        Ok(())
    }
}

fn join_error(path: &Path, e: tokio::task::JoinError) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn try_acquire(
        &self,
        domain: &DomainName,
        holder: &AttemptId,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let dir = self.dir.clone();
        let path = self.marker_path(domain);
        let guard = self.guard_path(domain);
        let domain = domain.clone();
        let marker = Marker::new(holder, ttl);

        tokio::task::spawn_blocking(move || {
            Self::acquire_blocking(&dir, &path, &guard, &domain, &marker, ttl)
        })
        .await
        .map_err(|e| join_error(&self.dir, e))?
    }

    async fn release(&self, domain: &DomainName, holder: &AttemptId) -> Result<(), StateError> {
        let path = self.marker_path(domain);
        let guard = self.guard_path(domain);
        let domain = domain.clone();
        let holder = holder.clone();

        tokio::task::spawn_blocking(move || Self::release_blocking(&path, &guard, &domain, &holder))
            .await
            .map_err(|e| join_error(&self.dir, e))?
    }
}

/// In-process markers for tests
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    markers: Mutex<HashMap<DomainName, Marker>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, domain: &DomainName) -> bool {
        self.markers
            .lock()
            .get(domain)
            .map(|m| !m.is_expired(Utc::now()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        domain: &DomainName,
        holder: &AttemptId,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let mut markers = self.markers.lock();
        if let Some(existing) = markers.get(domain) {
            if !existing.is_expired(Utc::now()) {
                return Ok(false);
            }
        }
        markers.insert(domain.clone(), Marker::new(holder, ttl));
        Ok(true)
    }

    async fn release(&self, domain: &DomainName, holder: &AttemptId) -> Result<(), StateError> {
        let mut markers = self.markers.lock();
        if markers.get(domain).map(|m| &m.holder) == Some(holder) {
            markers.remove(domain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn test_file_lease_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let leases = FileLeaseStore::new(dir.path());
        let domain = DomainName::new("radius.example.com");
        let first = AttemptId::new();
        let second = AttemptId::new();

        assert!(leases.try_acquire(&domain, &first, TTL).await.unwrap());
        assert!(!leases.try_acquire(&domain, &second, TTL).await.unwrap());

        leases.release(&domain, &first).await.unwrap();
        assert!(leases.try_acquire(&domain, &second, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_file_lease_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let leases = FileLeaseStore::new(dir.path());
        let domain = DomainName::new("radius.example.com");

        assert!(leases
            .try_acquire(&domain, &AttemptId::new(), Duration::ZERO)
            .await
            .unwrap());
        assert!(leases
            .try_acquire(&domain, &AttemptId::new(), TTL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fresh_unreadable_marker_is_honoured() {
        let dir = TempDir::new().unwrap();
        let leases = FileLeaseStore::new(dir.path());
        let domain = DomainName::new("radius.example.com");
        // A holder that has created the file but not written it yet
        std::fs::write(dir.path().join("radius.example.com.lock"), b"").unwrap();

        assert!(!leases
            .try_acquire(&domain, &AttemptId::new(), TTL)
            .await
            .unwrap());
        assert!(dir.path().join("radius.example.com.lock").exists());
    }

    #[tokio::test]
    async fn test_old_unreadable_marker_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let leases = FileLeaseStore::new(dir.path());
        let domain = DomainName::new("radius.example.com");
        let path = dir.path().join("radius.example.com.lock");
        std::fs::write(&path, b"{trunc").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - TTL * 2)
            .unwrap();

        let holder = AttemptId::new();
        assert!(leases.try_acquire(&domain, &holder, TTL).await.unwrap());
        match FileLeaseStore::read(&path).unwrap() {
            OnDisk::Parsed(marker) => assert_eq!(marker.holder, holder),
            other => panic!("unexpected marker state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let leases = FileLeaseStore::new(dir.path());
        let domain = DomainName::new("radius.example.com");
        // Stale marker every contender will try to take over
        assert!(leases
            .try_acquire(&domain, &AttemptId::new(), Duration::ZERO)
            .await
            .unwrap());

        let attempts = (0..8).map(|_| {
            let leases = leases.clone();
            let domain = domain.clone();
            tokio::spawn(async move {
                leases
                    .try_acquire(&domain, &AttemptId::new(), TTL)
                    .await
                    .unwrap()
            })
        });
        let mut winners = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn test_release_by_other_holder_keeps_marker() {
        let dir = TempDir::new().unwrap();
        let leases = FileLeaseStore::new(dir.path());
        let domain = DomainName::new("radius.example.com");
        let holder = AttemptId::new();

        assert!(leases.try_acquire(&domain, &holder, TTL).await.unwrap());
        leases.release(&domain, &AttemptId::new()).await.unwrap();
        assert!(!leases
            .try_acquire(&domain, &AttemptId::new(), TTL)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_lease() {
        let leases = MemoryLeaseStore::new();
        let domain = DomainName::new("radius.example.com");
        let holder = AttemptId::new();

        assert!(leases.try_acquire(&domain, &holder, TTL).await.unwrap());
        assert!(leases.is_held(&domain));
        assert!(!leases
            .try_acquire(&domain, &AttemptId::new(), TTL)
            .await
            .unwrap());

        leases.release(&domain, &holder).await.unwrap();
        assert!(!leases.is_held(&domain));
    }
}
