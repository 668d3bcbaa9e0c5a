//! ACME account credential storage
//!
//! The account is created once with the configured contact and reused on
//! every later run. Credentials are opaque `instant_acme` JSON kept next to
//! a small metadata record.
//!
//! ```text
//! acme-account.json
//! {
//!   "contact": "mailto:admin@example.com",
//!   "directory": "https://acme-v02.api.letsencrypt.org/directory",
//!   "created": "2026-01-01T00:00:00Z",
//!   "credentials": { ...instant_acme::AccountCredentials... }
//! }
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::error::AcmeError;

/// Persisted account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    /// Contact URI registered with the CA
    pub contact: String,
    /// Directory the account belongs to
    pub directory: String,
    /// When the account was created
    pub created: DateTime<Utc>,
    /// Raw `instant_acme::AccountCredentials`
    pub credentials: serde_json::Value,
}

/// File holding the account record
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Load the stored account, if any
    pub fn load(&self) -> Result<Option<StoredAccount>, AcmeError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(path = %self.path.display(), "No stored ACME account found");
                return Ok(None);
            }
            Err(e) => return Err(self.storage_error(e)),
        };

        let account: StoredAccount =
            serde_json::from_str(&content).map_err(|e| self.storage_error(e))?;

        debug!(
            contact = %account.contact,
            created = %account.created,
            "Loaded ACME account credentials"
        );
        Ok(Some(account))
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Save the account record with mode 0600
    pub fn save(&self, account: &StoredAccount) -> Result<(), AcmeError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.storage_error(e))?;
        }

        let content = serde_json::to_vec_pretty(account).map_err(|e| self.storage_error(e))?;
        let tmp = self.path.with_extension("json.tmp");

        // A leftover temp keeps its old mode if opened in place
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.storage_error(e)),
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp).map_err(|e| self.storage_error(e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|e| self.storage_error(e))?;
        }
        file.write_all(&content)
            .and_then(|_| file.sync_all())
            .map_err(|e| self.storage_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.storage_error(e))?;

        info!(
            path = %self.path.display(),
            contact = %account.contact,
            "Saved ACME account credentials"
        );
        Ok(())
    }

    fn storage_error(&self, e: impl std::fmt::Display) -> AcmeError {
        AcmeError::AccountStorage(format!("{}: {}", self.path.display(), e))
    }
}

/// `mailto:` URI for a contact address
pub fn contact_uri(contact: &str) -> String {
    if contact.starts_with("mailto:") {
        contact.to_string()
    } else {
        format!("mailto:{}", contact)
    }
}
