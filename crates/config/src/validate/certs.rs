//! Installed certificate validation
//!
//! Looks at the live files named in `[deploy]`: existence, expiry, key
//! permissions, and whether the key belongs to the certificate.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use radcert_common::{ArtifactError, CertificateArtifactSet};
use std::path::Path;

/// Warn when less than this is left and no renewal window is configured
const DEFAULT_WARN_DAYS: i64 = 30;

/// Validate the TLS material currently installed for the RADIUS server
pub fn validate_installed_material(config: &Config, now: DateTime<Utc>) -> ValidationResult {
    let mut result = ValidationResult::new();

    let Some(deploy) = &config.deploy else {
        return result;
    };

    let mut bodies = Vec::with_capacity(3);
    for path in [&deploy.cert_path, &deploy.key_path, &deploy.ca_path] {
        match std::fs::read(path) {
            Ok(body) => bodies.push(Bytes::from(body)),
            Err(e) => result.add_error(ValidationError::new(
                ErrorCategory::Files,
                format!("Cannot read {:?}: {}", path, e),
            )),
        }
    }

    if let Some(dh_path) = &deploy.dh_path {
        if !dh_path.exists() {
            result.add_error(ValidationError::new(
                ErrorCategory::Files,
                format!("DH parameters not found: {:?}", dh_path),
            ));
        }
    }

    check_key_permissions(&deploy.key_path, &mut result);

    let [leaf, key, ca]: [Bytes; 3] = match bodies.try_into() {
        Ok(bodies) => bodies,
        Err(_) => return result,
    };

    let set = match CertificateArtifactSet::from_parts(config.domain_name(), leaf, key, ca) {
        Ok(set) => set,
        Err(e) => {
            result.add_error(artifact_error(e));
            return result;
        }
    };

    if let Err(e) = set.validate() {
        result.add_error(artifact_error(e));
    }

    let warn_within = config
        .issuer
        .as_ref()
        .map(|issuer| issuer.renew_before())
        .unwrap_or_else(|| Duration::days(DEFAULT_WARN_DAYS));

    if set.not_after <= now {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "Certificate expired: {:?} (expired at {})",
                deploy.cert_path, set.not_after
            ),
        ));
    } else if set.needs_renewal(now, warn_within) {
        result.add_warning(ValidationWarning::new(format!(
            "Certificate expires soon: {:?} (expires at {})",
            deploy.cert_path, set.not_after
        )));
    }

    result
}

fn artifact_error(e: ArtifactError) -> ValidationError {
    let category = match e {
        ArtifactError::PrivateKey(_) | ArtifactError::KeyMismatch => ErrorCategory::PrivateKey,
        _ => ErrorCategory::Certificate,
    };
    ValidationError::new(category, e.to_string())
}

#[cfg(unix)]
fn check_key_permissions(key_path: &Path, result: &mut ValidationResult) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(key_path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            result.add_warning(ValidationWarning::new(format!(
                "Private key {:?} is accessible to group or others (mode {:o})",
                key_path, mode
            )));
        }
    }
}

#[cfg(not(unix))]
fn check_key_permissions(_key_path: &Path, _result: &mut ValidationResult) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeployConfig;
    use rcgen::{CertificateParams, DistinguishedName, KeyPair};
    use std::path::PathBuf;

    fn self_signed(domain: &str, valid_days: i64) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(valid_days);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    fn config_in(dir: &Path) -> Config {
        Config {
            domain: "radius.example.com".to_string(),
            deploy: Some(DeployConfig {
                cert_path: dir.join("server.pem"),
                key_path: dir.join("server.key"),
                ca_path: dir.join("ca.pem"),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn install(dir: &Path, cert: &str, key: &str) {
        std::fs::write(dir.join("server.pem"), cert).unwrap();
        std::fs::write(dir.join("server.key"), key).unwrap();
        std::fs::write(dir.join("ca.pem"), cert).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                dir.join("server.key"),
                std::fs::Permissions::from_mode(0o600),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_validate_missing_certificate() {
        let config = Config {
            domain: "radius.example.com".to_string(),
            deploy: Some(DeployConfig {
                cert_path: PathBuf::from("/nonexistent/server.pem"),
                key_path: PathBuf::from("/nonexistent/server.key"),
                ca_path: PathBuf::from("/nonexistent/ca.pem"),
                ..Default::default()
            }),
            ..Default::default()
        };

        let result = validate_installed_material(&config, Utc::now());

        assert!(!result.errors.is_empty());
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Cannot read")));
    }

    #[test]
    fn test_valid_material_passes() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cert, key) = self_signed("radius.example.com", 90);
        install(dir.path(), &cert, &key);

        let result = validate_installed_material(&config_in(dir.path()), Utc::now());
        assert!(result.is_ok(), "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_expiring_material_warns() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cert, key) = self_signed("radius.example.com", 5);
        install(dir.path(), &cert, &key);

        let result = validate_installed_material(&config_in(dir.path()), Utc::now());
        assert!(result.is_ok());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("expires soon")));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cert, _) = self_signed("radius.example.com", 90);
        let (_, other_key) = self_signed("radius.example.com", 90);
        install(dir.path(), &cert, &other_key);

        let result = validate_installed_material(&config_in(dir.path()), Utc::now());
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::PrivateKey));
    }

    #[test]
    fn test_missing_dh_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cert, key) = self_signed("radius.example.com", 90);
        install(dir.path(), &cert, &key);

        let mut config = config_in(dir.path());
        config.deploy.as_mut().unwrap().dh_path = Some(dir.path().join("dh"));

        let result = validate_installed_material(&config, Utc::now());
        assert!(result.errors.iter().any(|e| e.message.contains("DH")));
    }
}
