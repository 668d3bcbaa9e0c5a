//! Reload methods: command and SIGHUP.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, trace};

use super::{ReloadError, ReloadSignal};

/// Runs a reload command; non-zero exit is a failure
#[derive(Debug, Clone)]
pub struct CommandReload {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandReload {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[async_trait]
impl ReloadSignal for CommandReload {
    async fn reload(&self) -> Result<(), ReloadError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ReloadError::Spawn {
                command: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Kill the child if the timeout drops the future
            .kill_on_drop(true);

        trace!(command = %self.display(), "Running reload command");
        let child = cmd.spawn().map_err(|source| ReloadError::Spawn {
            command: self.display(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ReloadError::Spawn {
                command: self.display(),
                source,
            })?,
            Err(_) => {
                return Err(ReloadError::Timeout {
                    command: self.display(),
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(ReloadError::Failed {
                command: self.display(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(command = %self.display(), "Reloaded RADIUS server");
        Ok(())
    }
}

/// Sends SIGHUP to the PID stored in a pid file
#[derive(Debug, Clone)]
pub struct PidFileSignal {
    pid_file: PathBuf,
}

impl PidFileSignal {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    async fn read_pid(&self) -> Result<i32, ReloadError> {
        let pid_error = |message: String| ReloadError::PidFile {
            path: self.pid_file.display().to_string(),
            message,
        };

        let content = tokio::fs::read_to_string(&self.pid_file)
            .await
            .map_err(|e| pid_error(e.to_string()))?;
        let pid: i32 = content
            .trim()
            .parse()
            .map_err(|e| pid_error(format!("{:?} is not a pid: {}", content.trim(), e)))?;
        if pid <= 0 {
            return Err(pid_error(format!("{} is not a pid", pid)));
        }
        Ok(pid)
    }
}

#[async_trait]
impl ReloadSignal for PidFileSignal {
    async fn reload(&self) -> Result<(), ReloadError> {
        let pid = self.read_pid().await?;
        debug!(pid, pid_file = %self.pid_file.display(), "Sending SIGHUP");
        send_hangup(pid)?;
        info!(pid, "Signalled RADIUS server to reload");
        Ok(())
    }
}

#[cfg(unix)]
fn send_hangup(pid: i32) -> Result<(), ReloadError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|e| ReloadError::Signal {
        pid,
        message: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_hangup(pid: i32) -> Result<(), ReloadError> {
    Err(ReloadError::Signal {
        pid,
        message: "signals are not supported on this platform".to_string(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandReload {
        CommandReload::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_successful_command() {
        sh("exit 0").reload().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_command() {
        let err = sh("echo 'unit not found' >&2; exit 5").reload().await.unwrap_err();
        match err {
            ReloadError::Failed { stderr, .. } => assert_eq!(stderr, "unit not found"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let reload = CommandReload::new(
            vec!["sleep".to_string(), "5".to_string()],
            Duration::from_millis(100),
        );
        assert!(matches!(
            reload.reload().await,
            Err(ReloadError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let reload = CommandReload::new(
            vec!["/nonexistent/radcert-reload".to_string()],
            Duration::from_secs(1),
        );
        assert!(matches!(reload.reload().await, Err(ReloadError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_bad_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("radiusd.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();

        let err = PidFileSignal::new(&path).reload().await.unwrap_err();
        assert!(matches!(err, ReloadError::PidFile { .. }));

        let err = PidFileSignal::new(dir.path().join("missing.pid"))
            .reload()
            .await
            .unwrap_err();
        assert!(matches!(err, ReloadError::PidFile { .. }));
    }

    #[tokio::test]
    async fn test_signal_child_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("radiusd.pid");
        std::fs::write(&path, format!("{}\n", pid)).unwrap();

        PidFileSignal::new(&path).reload().await.unwrap();

        // sleep has no SIGHUP handler and terminates
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
