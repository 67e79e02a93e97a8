//! Remote execution via SSH
//!
//! Runs privileged shell commands on the Redis hosts. Commands aimed at the
//! machine we are running on are executed locally instead of looping back
//! through SSH.
//!
//! ## Prerequisites
//!
//! Target hosts must have:
//! - An SSH login for the configured user (key-based, no password prompt)
//! - Passwordless `sudo` for `/sbin/ip` and `arping`

use crate::error::{Result, RoleSwapError};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Maximum time to wait for a remote command
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Executes shell commands on a host, over SSH or locally
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    ssh_user: Option<String>,
    identity_file: Option<PathBuf>,
    local_hostname: Option<String>,
    command_timeout: Duration,
}

impl ShellExecutor {
    /// Create an executor, detecting the local hostname
    pub async fn new(ssh_user: Option<String>, identity_file: Option<PathBuf>) -> Self {
        let local_hostname = detect_local_hostname().await;
        debug!(local_hostname = ?local_hostname, "Detected local hostname");

        Self {
            ssh_user,
            identity_file,
            local_hostname,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    /// Whether `host` is the machine we are running on
    pub fn is_local(&self, host: &str) -> bool {
        self.local_hostname.as_deref() == Some(host)
    }

    /// Build the argv that runs `script` on `host`
    pub fn command_line(&self, host: &str, script: &str) -> Vec<String> {
        if self.is_local(host) {
            return vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        }

        let mut argv = vec![
            "ssh".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        let target = match &self.ssh_user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        };
        argv.push(target);
        argv.push(script.to_string());
        argv
    }

    /// Run a shell command on a host and wait for it to finish
    pub async fn run_command(&self, host: &str, script: &str) -> Result<CommandResult> {
        let argv = self.command_line(host, script);
        info!(host = %host, command = %script, "Running command");

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RoleSwapError::remote("empty command line"))?;

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(result) => result.map_err(|e| {
                RoleSwapError::remote(format!("failed to spawn {}: {}", program, e))
            })?,
            Err(_) => {
                warn!(host = %host, command = %script, "Command timed out");
                return Err(RoleSwapError::Timeout(self.command_timeout));
            }
        };

        let result = CommandResult {
            host: host.to_string(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        debug!(
            host = %host,
            exit_code = ?result.exit_code,
            stderr = %result.stderr.trim(),
            "Command finished"
        );

        Ok(result)
    }
}

async fn detect_local_hostname() -> Option<String> {
    let output = Command::new("hostname").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Result of a shell command
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Target host
    pub host: String,

    /// Exit code (absent when killed by a signal)
    pub exit_code: Option<i32>,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,
}

impl CommandResult {
    /// Check if command succeeded
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}
