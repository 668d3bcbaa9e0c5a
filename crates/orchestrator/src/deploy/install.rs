//! Temp-then-rename installation of the live certificate files.
//!
//! Every body is first written to a hidden sibling of its target
//! (`.server.pem.radcert-tmp-<tag>`), synced, given its final mode and
//! owner, and only then renamed over the target. A crash before the
//! renames leaves the live files untouched; the leftovers are swept at the
//! start of the next install.
//!
//! Before the renames each existing target is hard-linked to a backup
//! (`.server.pem.radcert-tmp-<tag>.prev`). If a rename fails part way, the
//! targets already replaced are restored from their backups, so the live
//! certificate and key always belong to the same set.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use radcert_common::{leaf_not_after, ArtifactKind, CertificateArtifactSet};
use radcert_config::DeployConfig;
use tracing::{debug, trace, warn};

use super::ApplyError;

const TEMP_MARKER: &str = ".radcert-tmp-";

const BACKUP_SUFFIX: &str = ".prev";

/// Live paths of the installed artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

impl InstallLayout {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            cert_path: config.cert_path.clone(),
            key_path: config.key_path.clone(),
            ca_path: config.ca_path.clone(),
        }
    }

    /// All three paths under one directory, with the store's file names
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join(ArtifactKind::LeafChain.file_name()),
            key_path: dir.join(ArtifactKind::PrivateKey.file_name()),
            ca_path: dir.join(ArtifactKind::TrustAnchor.file_name()),
        }
    }

    pub fn target(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::LeafChain => &self.cert_path,
            ArtifactKind::PrivateKey => &self.key_path,
            ArtifactKind::TrustAnchor => &self.ca_path,
        }
    }

    fn directories(&self) -> BTreeSet<PathBuf> {
        ArtifactKind::ALL
            .iter()
            .map(|kind| parent_dir(self.target(*kind)))
            .collect()
    }
}

/// Private key readable by the owner only; the rest world-readable
pub fn file_mode(kind: ArtifactKind) -> u32 {
    if kind.is_secret() {
        0o600
    } else {
        0o644
    }
}

/// Numeric owner applied to staged files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Ownership {
    /// Look up user and group names. `None` when neither is configured.
    #[cfg(unix)]
    pub fn resolve(owner: Option<&str>, group: Option<&str>) -> Result<Option<Self>, ApplyError> {
        use nix::unistd::{Group, User};

        if owner.is_none() && group.is_none() {
            return Ok(None);
        }

        let uid = match owner {
            Some(name) => Some(
                User::from_name(name)
                    .map_err(|e| ApplyError::Ownership {
                        path: PathBuf::new(),
                        message: format!("looking up user {}: {}", name, e),
                    })?
                    .ok_or_else(|| ApplyError::Ownership {
                        path: PathBuf::new(),
                        message: format!("no such user: {}", name),
                    })?
                    .uid
                    .as_raw(),
            ),
            None => None,
        };
        let gid = match group {
            Some(name) => Some(
                Group::from_name(name)
                    .map_err(|e| ApplyError::Ownership {
                        path: PathBuf::new(),
                        message: format!("looking up group {}: {}", name, e),
                    })?
                    .ok_or_else(|| ApplyError::Ownership {
                        path: PathBuf::new(),
                        message: format!("no such group: {}", name),
                    })?
                    .gid
                    .as_raw(),
            ),
            None => None,
        };

        Ok(Some(Self { uid, gid }))
    }

    #[cfg(not(unix))]
    pub fn resolve(owner: Option<&str>, group: Option<&str>) -> Result<Option<Self>, ApplyError> {
        match (owner, group) {
            (None, None) => Ok(None),
            _ => Err(ApplyError::Ownership {
                path: PathBuf::new(),
                message: "file ownership is not supported on this platform".to_string(),
            }),
        }
    }

    #[cfg(unix)]
    fn apply(&self, path: &Path) -> Result<(), ApplyError> {
        use nix::unistd::{chown, Gid, Uid};

        chown(path, self.uid.map(Uid::from_raw), self.gid.map(Gid::from_raw)).map_err(|e| {
            ApplyError::Ownership {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })
    }

    #[cfg(not(unix))]
    fn apply(&self, _path: &Path) -> Result<(), ApplyError> {
        Ok(())
    }
}

/// A body written next to its target, not yet live
#[derive(Debug, Clone)]
pub struct Staged {
    pub kind: ArtifactKind,
    pub temp: PathBuf,
    pub target: PathBuf,
}

impl Staged {
    fn backup(&self) -> PathBuf {
        let mut name = self.temp.clone().into_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ApplyError {
    ApplyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_path(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent_dir(target).join(format!(".{}{}{}", name, TEMP_MARKER, tag))
}

/// Remove temp files left by an interrupted install
pub fn sweep_stale_temps(layout: &InstallLayout) -> Result<usize, ApplyError> {
    let prefixes: Vec<String> = ArtifactKind::ALL
        .iter()
        .filter_map(|kind| layout.target(*kind).file_name())
        .map(|name| format!(".{}{}", name.to_string_lossy(), TEMP_MARKER))
        .collect();

    let mut removed = 0;
    for dir in layout.directories() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                let path = entry.path();
                fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
                warn!(path = %path.display(), "Removed leftover temporary file");
                removed += 1;
            }
        }
    }
    Ok(removed)
}

fn write_temp(
    path: &Path,
    body: &[u8],
    mode: u32,
    ownership: Option<&Ownership>,
) -> Result<(), ApplyError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| io_error(path, e))?;
    file.write_all(body)
        .and_then(|_| file.sync_all())
        .map_err(|e| io_error(path, e))?;

    if let Some(ownership) = ownership {
        ownership.apply(path)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| io_error(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Write every body to its temp path. On error, temps written so far are
/// removed and the live files are untouched.
pub fn stage(
    layout: &InstallLayout,
    set: &CertificateArtifactSet,
    tag: &str,
    ownership: Option<&Ownership>,
) -> Result<Vec<Staged>, ApplyError> {
    let mut staged = Vec::with_capacity(ArtifactKind::ALL.len());
    for kind in ArtifactKind::ALL {
        let target = layout.target(kind).to_path_buf();
        let temp = temp_path(&target, tag);
        if let Err(e) = fs::create_dir_all(parent_dir(&target))
            .map_err(|e| io_error(&target, e))
            .and_then(|_| write_temp(&temp, set.body(kind), file_mode(kind), ownership))
        {
            discard(&staged);
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        trace!(kind = %kind, temp = %temp.display(), "Staged artifact");
        staged.push(Staged { kind, temp, target });
    }
    Ok(staged)
}

fn discard(staged: &[Staged]) {
    for s in staged {
        if let Err(e) = fs::remove_file(&s.temp) {
            warn!(path = %s.temp.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

/// Rename staged files over their targets and sync the directories.
///
/// On error every target is back to what it was before the call.
pub fn commit(staged: &[Staged]) -> Result<(), ApplyError> {
    let had_previous = back_up(staged)?;

    for (done, s) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(&s.temp, &s.target) {
            warn!(
                kind = %s.kind,
                path = %s.target.display(),
                error = %e,
                "Install interrupted, restoring previous files"
            );
            restore(&staged[..done], &had_previous[..done]);
            drop_backups(staged);
            return Err(io_error(&s.target, e));
        }
        debug!(kind = %s.kind, path = %s.target.display(), "Installed artifact");
    }
    drop_backups(staged);

    let dirs: BTreeSet<PathBuf> = staged.iter().map(|s| parent_dir(&s.target)).collect();
    for dir in dirs {
        sync_dir(&dir)?;
    }
    Ok(())
}

/// Link every existing target to its backup path. Returns, per staged
/// file, whether there was a previous file.
fn back_up(staged: &[Staged]) -> Result<Vec<bool>, ApplyError> {
    let mut had_previous = Vec::with_capacity(staged.len());
    for s in staged {
        let backup = s.backup();
        let _ = fs::remove_file(&backup);
        let linked = fs::hard_link(&s.target, &backup).or_else(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Err(e),
            // Filesystems without hard links
            _ => fs::copy(&s.target, &backup).map(|_| ()),
        });
        match linked {
            Ok(()) => had_previous.push(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => had_previous.push(false),
            Err(e) => {
                drop_backups(staged);
                return Err(io_error(&backup, e));
            }
        }
    }
    Ok(had_previous)
}

/// Put back the targets of `replaced`, newest first
fn restore(replaced: &[Staged], had_previous: &[bool]) {
    for (s, had) in replaced.iter().zip(had_previous).rev() {
        let restored = if *had {
            fs::rename(s.backup(), &s.target)
        } else {
            fs::remove_file(&s.target)
        };
        match restored {
            Ok(()) => debug!(kind = %s.kind, path = %s.target.display(), "Restored previous file"),
            Err(e) => warn!(
                kind = %s.kind,
                path = %s.target.display(),
                error = %e,
                "Failed to restore previous file"
            ),
        }
    }
}

fn drop_backups(staged: &[Staged]) {
    for s in staged {
        let backup = s.backup();
        match fs::remove_file(&backup) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %backup.display(), error = %e, "Failed to remove backup file"),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), ApplyError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_error(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), ApplyError> {
    Ok(())
}

/// Sweep, stage and commit a set
pub fn install_set(
    layout: &InstallLayout,
    set: &CertificateArtifactSet,
    tag: &str,
    ownership: Option<&Ownership>,
) -> Result<(), ApplyError> {
    sweep_stale_temps(layout)?;
    let staged = stage(layout, set, tag, ownership)?;
    if let Err(e) = commit(&staged) {
        discard_remaining(&staged);
        return Err(e);
    }
    Ok(())
}

fn discard_remaining(staged: &[Staged]) {
    for s in staged.iter().filter(|s| s.temp.exists()) {
        let _ = fs::remove_file(&s.temp);
    }
}

/// `notAfter` of the installed leaf; `None` when missing or unreadable
pub fn installed_not_after(layout: &InstallLayout) -> Option<DateTime<Utc>> {
    let body = fs::read(&layout.cert_path).ok()?;
    match leaf_not_after(&body) {
        Ok(not_after) => Some(not_after),
        Err(e) => {
            warn!(
                path = %layout.cert_path.display(),
                error = %e,
                "Installed certificate is unreadable"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use radcert_common::DomainName;
    use rcgen::{CertificateParams, DistinguishedName, KeyPair};
    use tempfile::TempDir;

    fn set(valid_days: i64) -> CertificateArtifactSet {
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

    fn read(layout: &InstallLayout, kind: ArtifactKind) -> Vec<u8> {
        fs::read(layout.target(kind)).unwrap()
    }

    fn temps(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(TEMP_MARKER))
            .collect()
    }

    #[test]
    fn test_install_writes_all_files() {
        let dir = TempDir::new().unwrap();
        let layout = InstallLayout::in_dir(&dir.path().join("certs"));
        let set = set(90);

        install_set(&layout, &set, "a1", None).unwrap();

        for kind in ArtifactKind::ALL {
            assert_eq!(read(&layout, kind), set.body(kind).to_vec());
        }
        assert_eq!(installed_not_after(&layout), Some(set.not_after));
        assert!(temps(&dir.path().join("certs")).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let layout = InstallLayout::in_dir(dir.path());
        install_set(&layout, &set(90), "a1", None).unwrap();

        let mode = |kind| fs::metadata(layout.target(kind)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(ArtifactKind::PrivateKey), 0o600);
        assert_eq!(mode(ArtifactKind::LeafChain), 0o644);
        assert_eq!(mode(ArtifactKind::TrustAnchor), 0o644);
    }

    #[test]
    fn test_crash_between_stage_and_commit() {
        let dir = TempDir::new().unwrap();
        let layout = InstallLayout::in_dir(dir.path());
        let old = set(5);
        install_set(&layout, &old, "old", None).unwrap();

        // Crash: temps written, never renamed
        let new = set(90);
        let staged = stage(&layout, &new, "crashed", None).unwrap();
        assert_eq!(staged.len(), 3);
        drop(staged);

        for kind in ArtifactKind::ALL {
            assert_eq!(read(&layout, kind), old.body(kind).to_vec());
        }
        assert_eq!(temps(dir.path()).len(), 3);

        // Next run converges
        install_set(&layout, &new, "retry", None).unwrap();
        for kind in ArtifactKind::ALL {
            assert_eq!(read(&layout, kind), new.body(kind).to_vec());
        }
        assert!(temps(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_rename_restores_previous_set() {
        let dir = TempDir::new().unwrap();
        let layout = InstallLayout::in_dir(dir.path());
        let old = set(5);
        install_set(&layout, &old, "old", None).unwrap();

        // The key's temp vanishes after the certificate has been renamed
        let new = set(90);
        let staged = stage(&layout, &new, "broken", None).unwrap();
        assert_eq!(staged[1].kind, ArtifactKind::PrivateKey);
        fs::remove_file(&staged[1].temp).unwrap();

        assert!(matches!(commit(&staged), Err(ApplyError::Io { .. })));
        discard_remaining(&staged);

        for kind in ArtifactKind::ALL {
            assert_eq!(read(&layout, kind), old.body(kind).to_vec());
        }
        assert!(temps(dir.path()).is_empty(), "{:?}", temps(dir.path()));
    }

    #[test]
    fn test_failed_first_install_leaves_nothing_live() {
        let dir = TempDir::new().unwrap();
        let layout = InstallLayout::in_dir(dir.path());

        let staged = stage(&layout, &set(90), "first", None).unwrap();
        fs::remove_file(&staged[2].temp).unwrap();

        assert!(commit(&staged).is_err());
        discard_remaining(&staged);
        for kind in ArtifactKind::ALL {
            assert!(!layout.target(kind).exists(), "{} is live", kind);
        }
    }

    #[test]
    fn test_sweep_ignores_unrelated_files() {
        let dir = TempDir::new().unwrap();
        let layout = InstallLayout::in_dir(dir.path());
        fs::write(dir.path().join("dh"), "params").unwrap();
        fs::write(dir.path().join(".server.pem.radcert-tmp-x"), "partial").unwrap();
        fs::write(dir.path().join(".server.key.radcert-tmp-x.prev"), "backup").unwrap();

        assert_eq!(sweep_stale_temps(&layout).unwrap(), 2);
        assert!(dir.path().join("dh").exists());
    }

    #[test]
    fn test_installed_not_after_missing() {
        let dir = TempDir::new().unwrap();
        let layout = InstallLayout::in_dir(dir.path());
        assert_eq!(installed_not_after(&layout), None);

        fs::write(&layout.cert_path, "garbage").unwrap();
        assert_eq!(installed_not_after(&layout), None);
    }

    #[test]
    fn test_no_ownership_configured() {
        assert_eq!(Ownership::resolve(None, None).unwrap(), None);
    }
}
