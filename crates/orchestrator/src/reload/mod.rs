//! Reloading the RADIUS server's TLS material.
//!
//! The server must pick up new certificate files without dropping
//! sessions. Two ways to ask it are supported: run a command
//! (`systemctl reload freeradius`) or send SIGHUP to a PID from a pid file.

mod signals;

use std::time::Duration;

use async_trait::async_trait;
use radcert_common::{Classify, ErrorClass};
use radcert_config::ReloadConfig;
use thiserror::Error;

pub use signals::{CommandReload, PidFileSignal};

/// Errors asking the server to reload
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("Failed to start reload command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Reload command {command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Reload command {command} did not finish within {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Cannot read pid file {path}: {message}")]
    PidFile { path: String, message: String },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: i32, message: String },
}

impl Classify for ReloadError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Apply
    }

    fn reason(&self) -> &'static str {
        match self {
            ReloadError::Timeout { .. } => "reload_timeout",
            ReloadError::PidFile { .. } => "reload_pid_file",
            _ => "reload_failed",
        }
    }
}

/// Something that makes the server reload its TLS material
#[async_trait]
pub trait ReloadSignal: Send + Sync {
    async fn reload(&self) -> Result<(), ReloadError>;
}

/// Build the configured reload method
pub fn from_config(config: &ReloadConfig) -> Box<dyn ReloadSignal> {
    match config {
        ReloadConfig::Command {
            command,
            timeout_secs,
        } => Box::new(CommandReload::new(
            command.clone(),
            Duration::from_secs(*timeout_secs),
        )),
        ReloadConfig::Signal { pid_file } => Box::new(PidFileSignal::new(pid_file.clone())),
    }
}
