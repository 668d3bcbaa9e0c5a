//! Wiring for the three trigger entry points.
//!
//! Each function builds the collaborators its command needs from the
//! configuration, runs once, and turns the result into a
//! [`TriggerReport`]. Nothing here returns an error: every failure ends up
//! in the report.

use std::sync::Arc;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use chrono::Utc;
use radcert_common::{Classify, ErrorClass};
use radcert_config::validate::validate_installed_material;
use radcert_config::{Config, ConfigError, IssuerConfig, Purpose, StoreConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::acme::{
    AccountStore, ChallengePublisher, DnsError, HickoryTxtResolver, InstantAcmeAuthority,
    Issuer, IssuerSettings, PropagationProbe, RenewalOutcome, RenewalScheduler,
    Route53DnsProvider,
};
use crate::deploy::{ApplyError, DeploymentApplier};
use crate::distribution::{DistributionAgent, SyncOutcome};
use crate::outcome::TriggerReport;
use crate::reload;
use crate::state::{FileLeaseStore, FileStateStore};
use crate::store::{HttpArtifactSource, S3ArtifactStore, StoreError};

/// Errors building collaborators before a run
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl SetupError {
    fn is_config(&self) -> bool {
        matches!(
            self,
            SetupError::Config(_) | SetupError::Store(StoreError::Config(_))
        )
    }

    fn report(&self, command: &'static str) -> TriggerReport {
        if self.is_config() {
            TriggerReport::config_error(command, self)
        } else {
            TriggerReport::from_error(command, self)
        }
    }
}

impl Classify for SetupError {
    fn class(&self) -> ErrorClass {
        match self {
            SetupError::Config(_) => ErrorClass::Validation,
            SetupError::Store(e) => e.class(),
            SetupError::Dns(e) => e.class(),
            SetupError::Apply(e) => e.class(),
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            SetupError::Config(_) => "config_invalid",
            SetupError::Store(e) => e.reason(),
            SetupError::Dns(e) => e.reason(),
            SetupError::Apply(e) => e.reason(),
        }
    }
}

async fn aws_config(store: &StoreConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &store.region {
        loader = loader.region(Region::new(region.clone()));
    }
    loader.load().await
}

async fn build_scheduler(
    config: &Config,
) -> Result<RenewalScheduler<InstantAcmeAuthority>, SetupError> {
    let issuer_config: &IssuerConfig = config.issuer.as_ref().ok_or(ConfigError::Missing("issuer"))?;
    let store_config = config.store.as_ref().ok_or(ConfigError::Missing("store"))?;
    let domain = config.domain_name();
    let policy = config.retry.policy();
    let sdk_config = aws_config(store_config).await;

    let store = S3ArtifactStore::from_config(
        &sdk_config,
        store_config,
        store_config.effective_prefix(&domain),
    )?;

    let dns = &issuer_config.dns;
    let provider = Route53DnsProvider::new(&sdk_config, dns.hosted_zone_id.clone());
    let resolver = HickoryTxtResolver::new(&dns.propagation.nameservers)?;
    let probe = PropagationProbe::from_config(Arc::new(resolver), &dns.propagation);
    let publisher = ChallengePublisher::new(Arc::new(provider), probe, dns.ttl, policy.clone());

    let authority = InstantAcmeAuthority::new(
        issuer_config.directory_url()?,
        AccountStore::new(&issuer_config.account_path),
        policy.clone(),
    );

    let issuer = Issuer::new(
        authority,
        Arc::new(publisher),
        Arc::new(store),
        IssuerSettings {
            renew_before: issuer_config.renew_before(),
            validation_timeout: issuer_config.validation_timeout(),
            propagation_timeout: Duration::from_secs(dns.propagation.timeout_secs),
            retry: policy,
        },
    );

    let leases = FileLeaseStore::new(config.state.dir.join("leases"));
    Ok(
        RenewalScheduler::new(Arc::new(issuer), Arc::new(leases), domain, &issuer_config.contact)
            .with_lease_ttl(config.state.lease_ttl()),
    )
}

/// `renew`: one Renewal Scheduler firing
pub async fn renew(config: &Config, force: bool) -> TriggerReport {
    const COMMAND: &str = "renew";

    if let Err(e) = config.check(Purpose::Renew) {
        return TriggerReport::config_error(COMMAND, e);
    }
    let domain = config.domain_name();

    let scheduler = match build_scheduler(config).await {
        Ok(scheduler) => scheduler,
        Err(e) => return e.report(COMMAND).with_domain(&domain),
    };
    debug!(scheduler = ?scheduler, "Firing renewal scheduler");

    match scheduler.fire(force).await {
        Ok(RenewalOutcome::Renewed {
            not_after,
            attempt_id,
        }) => TriggerReport::success(COMMAND, "renewed")
            .with_domain(&domain)
            .with_not_after(not_after)
            .with_attempt(attempt_id),
        Ok(RenewalOutcome::NotDue { not_after }) => TriggerReport::noop(COMMAND, "not_due")
            .with_domain(&domain)
            .with_not_after(not_after),
        Err(e) => TriggerReport::from_error(COMMAND, &e).with_domain(&domain),
    }
}

fn build_agent(config: &Config) -> Result<DistributionAgent, SetupError> {
    let store_config = config.store.as_ref().ok_or(ConfigError::Missing("store"))?;
    let deploy = config.deploy.as_ref().ok_or(ConfigError::Missing("deploy"))?;
    let base_url = store_config
        .public_base_url
        .as_deref()
        .ok_or(ConfigError::Missing("store.public-base-url"))?;
    let domain = config.domain_name();

    let source = HttpArtifactSource::new(
        base_url,
        store_config.effective_prefix(&domain),
        store_config.request_timeout(),
    )?;
    let state = FileStateStore::new(config.state.dir.join(format!("cache-{}.json", domain)));
    let reload: Arc<dyn reload::ReloadSignal> = Arc::from(reload::from_config(&deploy.reload));
    let applier = DeploymentApplier::from_config(deploy, reload)?;

    Ok(DistributionAgent::new(
        Arc::new(source),
        Arc::new(applier),
        Arc::new(state),
        domain,
        config.retry.policy(),
    ))
}

/// `sync`: one Distribution Agent cycle
pub async fn sync(config: &Config, force: bool) -> TriggerReport {
    const COMMAND: &str = "sync";

    if let Err(e) = config.check(Purpose::Sync) {
        return TriggerReport::config_error(COMMAND, e);
    }
    let domain = config.domain_name();

    let agent = match build_agent(config) {
        Ok(agent) => agent,
        Err(e) => return e.report(COMMAND).with_domain(&domain),
    };

    match agent.sync(force).await {
        Ok(SyncOutcome::Applied { not_after, .. }) => TriggerReport::success(COMMAND, "deployed")
            .with_domain(&domain)
            .with_not_after(not_after),
        Ok(SyncOutcome::Unchanged) => TriggerReport::noop(COMMAND, "unchanged").with_domain(&domain),
        Err(e) => TriggerReport::from_error(COMMAND, &e).with_domain(&domain),
    }
}

/// `check`: configuration and, when deployed, the installed material
pub fn check(config: &Config) -> TriggerReport {
    const COMMAND: &str = "check";

    if let Err(e) = config.check(Purpose::Check) {
        return TriggerReport::config_error(COMMAND, e);
    }
    let domain = config.domain_name();

    if config.deploy.is_none() {
        info!("No deploy section, configuration only");
        return TriggerReport::success(COMMAND, "config_valid").with_domain(&domain);
    }

    let result = validate_installed_material(config, Utc::now());
    for warning in &result.warnings {
        warn!(warning = %warning, "Installed material");
    }

    if result.is_ok() {
        let report = TriggerReport::success(COMMAND, "installed_material_valid").with_domain(&domain);
        if result.warnings.is_empty() {
            report
        } else {
            report.with_message(
                result
                    .warnings
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    } else {
        TriggerReport::failure(
            COMMAND,
            "installed_material_invalid",
            ErrorClass::Validation,
            result
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
        .with_domain(&domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;

    #[test]
    fn test_check_without_deploy() {
        let config = Config::from_toml_str("domain = \"radius.example.com\"\n").unwrap();
        let report = check(&config);
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.reason, "config_valid");
    }

    #[test]
    fn test_check_missing_domain_is_config_error() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(check(&config).exit_code(), 2);
    }

    #[test]
    fn test_check_missing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::from_toml_str(&format!(
            r#"
domain = "radius.example.com"

[deploy]
cert-path = "{0}/server.pem"
key-path = "{0}/server.key"
ca-path = "{0}/ca.pem"
"#,
            dir.path().display()
        ))
        .unwrap();

        let report = check(&config);
        assert_eq!(report.outcome, Outcome::Failure);
        assert_eq!(report.reason, "installed_material_invalid");
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_renew_requires_issuer() {
        let config = Config::from_toml_str("domain = \"radius.example.com\"\n").unwrap();
        let report = renew(&config, false).await;
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.command, "renew");
    }

    #[tokio::test]
    async fn test_sync_requires_deploy() {
        let config = Config::from_toml_str(
            r#"
domain = "radius.example.com"

[store]
public-base-url = "https://radius-certs.s3.ap-northeast-1.amazonaws.com"
"#,
        )
        .unwrap();
        let report = sync(&config, false).await;
        assert_eq!(report.exit_code(), 2);
    }
}
