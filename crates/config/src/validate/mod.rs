//! Validation beyond field rules.
//!
//! [`check_deploy_layout`] runs as part of [`Config::check`]. The
//! [`certs`] checks look at the files on disk and back the `check`
//! command.
//!
//! [`Config::check`]: crate::Config::check

pub mod certs;

use std::fmt;
use std::path::Path;

use crate::{ConfigError, DeployConfig, ReloadConfig};

pub use certs::validate_installed_material;

/// Area a validation finding belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Certificate,
    PrivateKey,
    Files,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Certificate => write!(f, "certificate"),
            ErrorCategory::PrivateKey => write!(f, "private-key"),
            ErrorCategory::Files => write!(f, "files"),
        }
    }
}

/// A finding that makes the deployment unusable
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A finding worth reporting that does not block anything
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Collected findings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Cross-field rules for the live file layout
pub fn check_deploy_layout(deploy: &DeployConfig) -> Result<(), ConfigError> {
    let paths = [
        ("deploy.cert-path", &deploy.cert_path),
        ("deploy.key-path", &deploy.key_path),
        ("deploy.ca-path", &deploy.ca_path),
    ];

    for (name, path) in paths {
        if !path.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "{} must be absolute: {}",
                name,
                path.display()
            )));
        }
        if path.file_name().is_none() {
            return Err(ConfigError::Invalid(format!(
                "{} must name a file: {}",
                name,
                path.display()
            )));
        }
    }

    for (i, (a_name, a)) in paths.iter().enumerate() {
        for (b_name, b) in paths.iter().skip(i + 1) {
            if same_path(a, b) {
                return Err(ConfigError::Invalid(format!(
                    "{} and {} point at the same file",
                    a_name, b_name
                )));
            }
        }
    }

    match &deploy.reload {
        ReloadConfig::Command { command, .. } if command.is_empty() => Err(ConfigError::Invalid(
            "deploy.reload.command must not be empty".to_string(),
        )),
        ReloadConfig::Signal { pid_file } if !pid_file.is_absolute() => Err(ConfigError::Invalid(
            format!("deploy.reload.pid-file must be absolute: {}", pid_file.display()),
        )),
        _ => Ok(()),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}
