//! Configuration for radcert.
//!
//! Loaded from a TOML file, overlaid with the deployment environment
//! variables the hosted renewal function has always used, then checked for
//! the command about to run.
//!
//! # Example
//!
//! ```toml
//! domain = "radius.example.com"
//!
//! [issuer]
//! contact = "admin@example.com"
//! directory = "letsencrypt"
//! renew-before-days = 30
//!
//! [issuer.dns]
//! provider = "route53"
//! hosted-zone-id = "Z0123456789ABC"
//!
//! [store]
//! bucket = "radius-certs"
//! region = "ap-northeast-1"
//! public-base-url = "https://radius-certs.s3.ap-northeast-1.amazonaws.com"
//!
//! [deploy]
//! cert-path = "/etc/freeradius/3.0/certs/server.pem"
//! key-path = "/etc/freeradius/3.0/certs/server.key"
//! ca-path = "/etc/freeradius/3.0/certs/ca.pem"
//! reload = { method = "command", command = ["systemctl", "reload", "freeradius"] }
//! ```

mod error;
pub mod validate;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use radcert_common::{DomainName, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

pub use error::ConfigError;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Which command the configuration is being checked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Issuer side: renew and publish
    Renew,
    /// Consumer side: fetch and install
    Sync,
    /// Whatever sections are present
    Check,
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Server name the RADIUS endpoint presents
    #[serde(default)]
    #[validate(length(max = 253))]
    pub domain: String,

    /// Certificate issuance (issuer side only)
    #[serde(default)]
    #[validate(nested)]
    pub issuer: Option<IssuerConfig>,

    /// Artifact store
    #[serde(default)]
    #[validate(nested)]
    pub store: Option<StoreConfig>,

    /// Live file layout and reload (consumer side only)
    #[serde(default)]
    #[validate(nested)]
    pub deploy: Option<DeployConfig>,

    /// Persisted state
    #[serde(default)]
    #[validate(nested)]
    pub state: StateConfig,

    /// Retry policy for transient failures
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// ACME issuance settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IssuerConfig {
    /// ACME account contact email
    #[serde(default)]
    #[validate(email)]
    pub contact: String,

    /// `letsencrypt`, `letsencrypt-staging`, or a directory URL
    #[serde(default = "default_directory")]
    pub directory: String,

    /// Renew when the certificate has this many days left or fewer
    #[serde(default = "default_renew_before_days")]
    #[validate(range(min = 1, max = 89))]
    pub renew_before_days: u32,

    /// Where the ACME account credentials are kept
    #[serde(default = "default_account_path")]
    pub account_path: PathBuf,

    /// Upper bound for CA-side validation and certificate retrieval
    #[serde(default = "default_validation_timeout")]
    #[validate(range(min = 10))]
    pub validation_timeout_secs: u64,

    /// DNS-01 challenge settings
    #[validate(nested)]
    pub dns: DnsConfig,
}

fn default_directory() -> String {
    "letsencrypt".to_string()
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_account_path() -> PathBuf {
    PathBuf::from("/var/lib/radcert/acme-account.json")
}

fn default_validation_timeout() -> u64 {
    300
}

impl IssuerConfig {
    /// Resolve the configured directory to a URL
    pub fn directory_url(&self) -> Result<String, ConfigError> {
        match self.directory.as_str() {
            "letsencrypt" | "letsencrypt-production" => Ok(LETS_ENCRYPT_PRODUCTION.to_string()),
            "letsencrypt-staging" => Ok(LETS_ENCRYPT_STAGING.to_string()),
            other => {
                let url = url::Url::parse(other).map_err(|e| {
                    ConfigError::Invalid(format!("issuer.directory '{}': {}", other, e))
                })?;
                if url.scheme() != "https" {
                    return Err(ConfigError::Invalid(format!(
                        "issuer.directory must use https: {}",
                        other
                    )));
                }
                Ok(url.to_string())
            }
        }
    }

    pub fn renew_before(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.renew_before_days))
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

/// DNS provider used for DNS-01 challenges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    #[default]
    Route53,
}

/// DNS-01 challenge settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DnsConfig {
    #[serde(default)]
    pub provider: DnsProviderKind,

    /// Hosted zone holding the `_acme-challenge` record
    #[validate(length(min = 1))]
    pub hosted_zone_id: String,

    /// TTL of the challenge record
    #[serde(default = "default_record_ttl")]
    #[validate(range(min = 1, max = 86400))]
    pub ttl: u32,

    #[serde(default)]
    #[validate(nested)]
    pub propagation: PropagationConfig,
}

fn default_record_ttl() -> u32 {
    60
}

/// How long and how hard to look for the published record
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PropagationConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_check_interval")]
    #[validate(range(min = 1))]
    pub check_interval_secs: u64,

    #[serde(default = "default_propagation_timeout")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    /// Resolvers to query; system configuration when empty
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
}

fn default_initial_delay() -> u64 {
    10
}

fn default_check_interval() -> u64 {
    5
}

fn default_propagation_timeout() -> u64 {
    120
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            check_interval_secs: default_check_interval(),
            timeout_secs: default_propagation_timeout(),
            nameservers: Vec::new(),
        }
    }
}

/// Server-side encryption applied to stored artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    #[default]
    #[serde(rename = "AES256")]
    Aes256,
    #[serde(rename = "aws:kms")]
    AwsKms,
}

/// Artifact store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreConfig {
    /// Bucket written by the issuer
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix; defaults to `<domain>/`
    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (MinIO and friends)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub force_path_style: bool,

    #[serde(default)]
    pub encryption: Encryption,

    #[serde(default)]
    pub kms_key_id: Option<String>,

    /// Base URL of the credential-less read path used by the consumer
    #[serde(default)]
    #[validate(url)]
    pub public_base_url: Option<String>,

    /// Bound on every store request
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

impl StoreConfig {
    /// Key prefix without surrounding slashes
    pub fn effective_prefix(&self, domain: &DomainName) -> String {
        match &self.prefix {
            Some(prefix) => prefix.trim_matches('/').to_string(),
            None => domain.to_string(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Live file layout on the consumer host
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeployConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    #[serde(default = "default_ca_path")]
    pub ca_path: PathBuf,

    /// Diffie-Hellman parameters; checked by `check`, never written
    #[serde(default)]
    pub dh_path: Option<PathBuf>,

    /// User that should own the installed files
    #[serde(default)]
    pub owner: Option<String>,

    /// Group that should own the installed files
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub reload: ReloadConfig,
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/etc/freeradius/3.0/certs/server.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/freeradius/3.0/certs/server.key")
}

fn default_ca_path() -> PathBuf {
    PathBuf::from("/etc/freeradius/3.0/certs/ca.pem")
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_path: default_ca_path(),
            dh_path: None,
            owner: None,
            group: None,
            reload: ReloadConfig::default(),
        }
    }
}

/// How the consuming service is told to pick up new TLS material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum ReloadConfig {
    /// Run a command, e.g. `systemctl reload freeradius`
    Command {
        command: Vec<String>,
        #[serde(default = "default_reload_timeout", rename = "timeout-secs")]
        timeout_secs: u64,
    },
    /// Send SIGHUP to the PID in a pid file
    Signal {
        #[serde(rename = "pid-file")]
        pid_file: PathBuf,
    },
}

fn default_reload_timeout() -> u64 {
    30
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self::Command {
            command: vec![
                "systemctl".to_string(),
                "reload".to_string(),
                "freeradius".to_string(),
            ],
            timeout_secs: default_reload_timeout(),
        }
    }
}

/// Persisted state settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StateConfig {
    /// Directory for the fingerprint cache and in-progress markers
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,

    /// How long an in-progress marker blocks other attempts
    #[serde(default = "default_lease_ttl")]
    #[validate(range(min = 60))]
    pub lease_ttl_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/radcert")
}

fn default_lease_ttl() -> u64 {
    900
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

impl StateConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

/// Deployment environment variables of the hosted renewal function
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentEnv {
    pub radius_fqdn: Option<String>,
    pub email: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
}

impl DeploymentEnv {
    /// Read from the process environment
    pub fn from_process_env() -> Result<Self, ConfigError> {
        Ok(envy::from_env::<DeploymentEnv>()?)
    }

    /// Read from explicit key/value pairs
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::from_iter::<_, DeploymentEnv>(pairs)?)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay deployment environment variables
    pub fn apply_env(&mut self, env: DeploymentEnv) {
        if let Some(fqdn) = env.radius_fqdn {
            debug!(domain = %fqdn, "Domain taken from RADIUS_FQDN");
            self.domain = fqdn;
        }
        if let (Some(email), Some(issuer)) = (env.email, self.issuer.as_mut()) {
            issuer.contact = email;
        }
        if let Some(bucket) = env.s3_bucket {
            self.store.get_or_insert_with(StoreConfig::default).bucket = Some(bucket);
        }
        if let Some(prefix) = env.s3_prefix {
            self.store.get_or_insert_with(StoreConfig::default).prefix = Some(prefix);
        }
    }

    /// Normalized domain name
    pub fn domain_name(&self) -> DomainName {
        DomainName::new(&self.domain)
    }

    /// Check the configuration for the command about to run.
    ///
    /// Field rules come from the `validator` derives; cross-field rules
    /// and per-command required sections are checked here.
    pub fn check(&self, purpose: Purpose) -> Result<(), ConfigError> {
        Validate::validate(self)?;

        if self.domain.trim().is_empty() {
            return Err(ConfigError::Missing("domain"));
        }

        if let Some(store) = &self.store {
            if store.encryption == Encryption::AwsKms && store.kms_key_id.is_none() {
                return Err(ConfigError::Invalid(
                    "store.kms-key-id is required when encryption is aws:kms".to_string(),
                ));
            }
        }

        if let Some(deploy) = &self.deploy {
            validate::check_deploy_layout(deploy)?;
        }

        match purpose {
            Purpose::Renew => {
                let issuer = self.issuer.as_ref().ok_or(ConfigError::Missing("issuer"))?;
                if issuer.contact.is_empty() {
                    return Err(ConfigError::Missing("issuer.contact"));
                }
                issuer.directory_url()?;
                let store = self.store.as_ref().ok_or(ConfigError::Missing("store"))?;
                if store.bucket.is_none() {
                    return Err(ConfigError::Missing("store.bucket"));
                }
            }
            Purpose::Sync => {
                let store = self.store.as_ref().ok_or(ConfigError::Missing("store"))?;
                if store.public_base_url.is_none() {
                    return Err(ConfigError::Missing("store.public-base-url"));
                }
                if self.deploy.is_none() {
                    return Err(ConfigError::Missing("deploy"));
                }
            }
            Purpose::Check => {
                if let Some(issuer) = &self.issuer {
                    issuer.directory_url()?;
                }
            }
        }

        Ok(())
    }
}
