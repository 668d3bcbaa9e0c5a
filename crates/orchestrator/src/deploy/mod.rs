//! Installing a fetched artifact set on the RADIUS host.
//!
//! [`DeploymentApplier`] validates the set, refuses expired or older
//! certificates, installs the three files with temp-then-rename and asks
//! the server to reload. A failed reload leaves the new files in place.

mod install;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radcert_common::{ArtifactError, AttemptId, CertificateArtifactSet, Classify, ErrorClass};
use radcert_config::DeployConfig;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use install::{
    commit, file_mode, install_set, installed_not_after, stage, sweep_stale_temps, InstallLayout,
    Ownership, Staged,
};

use crate::distribution::Applier;
use crate::reload::{ReloadError, ReloadSignal};

/// Errors installing an artifact set
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Refusing to install invalid set: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Refusing to install certificate that expired at {not_after}")]
    Expired { not_after: DateTime<Utc> },

    #[error("Refusing to replace certificate valid until {installed} with one valid until {candidate}")]
    Stale {
        installed: DateTime<Utc>,
        candidate: DateTime<Utc>,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set ownership of {path}: {message}")]
    Ownership { path: PathBuf, message: String },

    #[error("Files installed but reload failed: {0}")]
    Reload(#[from] ReloadError),
}

impl Classify for ApplyError {
    fn class(&self) -> ErrorClass {
        match self {
            ApplyError::Artifact(_) | ApplyError::Expired { .. } | ApplyError::Stale { .. } => {
                ErrorClass::Validation
            }
            ApplyError::Io { .. } | ApplyError::Ownership { .. } | ApplyError::Reload(_) => {
                ErrorClass::Apply
            }
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ApplyError::Artifact(e) => e.reason(),
            ApplyError::Expired { .. } => "certificate_expired",
            ApplyError::Stale { .. } => "certificate_older_than_installed",
            ApplyError::Io { .. } => "install_io",
            ApplyError::Ownership { .. } => "install_ownership",
            ApplyError::Reload(e) => e.reason(),
        }
    }
}

/// Installs sets into the live paths and triggers a reload
pub struct DeploymentApplier {
    layout: InstallLayout,
    ownership: Option<Ownership>,
    reload: Arc<dyn ReloadSignal>,
}

impl DeploymentApplier {
    pub fn new(layout: InstallLayout, reload: Arc<dyn ReloadSignal>) -> Self {
        Self {
            layout,
            ownership: None,
            reload,
        }
    }

    pub fn with_ownership(mut self, ownership: Option<Ownership>) -> Self {
        self.ownership = ownership;
        self
    }

    /// Applier for the configured layout, owner and reload method
    pub fn from_config(
        config: &DeployConfig,
        reload: Arc<dyn ReloadSignal>,
    ) -> Result<Self, ApplyError> {
        let ownership = Ownership::resolve(config.owner.as_deref(), config.group.as_deref())?;
        Ok(Self::new(InstallLayout::from_config(config), reload).with_ownership(ownership))
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    fn check(&self, set: &CertificateArtifactSet, now: DateTime<Utc>) -> Result<(), ApplyError> {
        set.validate()?;

        if set.not_after <= now {
            return Err(ApplyError::Expired {
                not_after: set.not_after,
            });
        }

        if let Some(installed) = installed_not_after(&self.layout) {
            if set.not_after < installed {
                return Err(ApplyError::Stale {
                    installed,
                    candidate: set.not_after,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Applier for DeploymentApplier {
    async fn apply(&self, set: &CertificateArtifactSet) -> Result<(), ApplyError> {
        self.check(set, Utc::now())?;

        let layout = self.layout.clone();
        let ownership = self.ownership;
        let owned = set.clone();
        let tag = AttemptId::new();
        tokio::task::spawn_blocking(move || {
            install_set(&layout, &owned, tag.short(), ownership.as_ref())
        })
        .await
        .map_err(|e| ApplyError::Io {
            path: self.layout.cert_path.clone(),
            source: std::io::Error::other(e),
        })??;

        info!(
            domain = %set.domain,
            not_after = %set.not_after,
            path = %self.layout.cert_path.display(),
            "Installed certificate set"
        );

        if let Err(e) = self.reload.reload().await {
            warn!(error = %e, "Reload failed, new files stay installed");
            return Err(e.into());
        }
        debug!("Reload requested");
        Ok(())
    }
}

impl std::fmt::Debug for DeploymentApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentApplier")
            .field("layout", &self.layout)
            .field("ownership", &self.ownership)
            .finish()
    }
}
