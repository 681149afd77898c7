//! Remote command execution.
//!
//! Controllers never spawn processes themselves: they build a [`RemoteCommand`]
//! and hand it to a [`RemoteExecutor`]. Production code uses [`SshExecutor`];
//! tests inject a scripted executor.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("command `{command}` on {host} exited with {exit_code}: {stderr}")]
    Failed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("command `{command}` on {host} timed out after {timeout:?}")]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },
    #[error("unable to spawn transport for {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command `{command}` on {host} produced no output")]
    NoOutput { host: String, command: String },
}

impl RemoteError {
    /// True when the remote side ran the command and it returned non-zero.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, RemoteError::Failed { .. })
    }
}

/// A command to run on a remote host, plus how its output is post-processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub argv: Vec<String>,
    /// Read-only commands are still executed in dry-run mode.
    pub is_safe: bool,
    /// Return the output of a failed command instead of an error.
    pub capture_errors: bool,
    /// Append stderr to the output (ceph reports most results there).
    pub merge_stderr: bool,
    pub last_line_only: bool,
    pub skip_first_line: bool,
}

impl RemoteCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            is_safe: false,
            capture_errors: false,
            merge_stderr: false,
            last_line_only: false,
            skip_first_line: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn safe(mut self) -> Self {
        self.is_safe = true;
        self
    }

    pub fn capture_errors(mut self) -> Self {
        self.capture_errors = true;
        self
    }

    pub fn merge_stderr(mut self) -> Self {
        self.merge_stderr = true;
        self
    }

    pub fn last_line_only(mut self) -> Self {
        self.last_line_only = true;
        self
    }

    pub fn skip_first_line(mut self) -> Self {
        self.skip_first_line = true;
        self
    }

    /// The command line as the remote shell will see it.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// Applies the line filters requested for this command.
    pub fn postprocess(&self, raw: &str) -> String {
        let mut lines: Vec<&str> = raw.lines().collect();
        if self.skip_first_line && !lines.is_empty() {
            lines.remove(0);
        }
        if self.last_line_only {
            return lines.last().map(|l| l.to_string()).unwrap_or_default();
        }
        lines.join("\n")
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` on `host` and returns its (post-processed) output.
    async fn run(&self, host: &str, command: &RemoteCommand) -> Result<String, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    pub user: Option<String>,
    pub options: Vec<String>,
    pub use_sudo: bool,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            user: None,
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ConnectTimeout=10".to_string(),
            ],
            use_sudo: true,
            command_timeout_secs: 600,
        }
    }
}

/// Runs commands through the system `ssh` client.
pub struct SshExecutor {
    config: SshConfig,
    dry_run: bool,
}

impl SshExecutor {
    pub fn new(config: SshConfig, dry_run: bool) -> Self {
        Self { config, dry_run }
    }

    fn target(&self, host: &str) -> String {
        match &self.config.user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        }
    }

    fn remote_line(&self, command: &RemoteCommand) -> String {
        if self.config.use_sudo {
            format!("sudo -i {}", command.command_line())
        } else {
            command.command_line()
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, command: &RemoteCommand) -> Result<String, RemoteError> {
        if self.dry_run && !command.is_safe {
            info!(host = host, "dry-run: skipping `{}`", command);
            return Ok(String::new());
        }

        debug!(host = host, "running `{}`", command);
        let child = tokio::process::Command::new(&self.config.binary)
            .args(&self.config.options)
            .arg(self.target(host))
            .arg("--")
            .arg(self.remote_line(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RemoteError::Spawn {
                host: host.to_string(),
                source,
            })?;

        let timeout = Duration::from_secs(self.config.command_timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout {
                host: host.to_string(),
                command: command.command_line(),
                timeout,
            })?
            .map_err(|source| RemoteError::Spawn {
                host: host.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            if command.capture_errors {
                return Ok(command.postprocess(&format!("{}{}", stdout, stderr)));
            }
            return Err(RemoteError::Failed {
                host: host.to_string(),
                command: command.command_line(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        if command.merge_stderr {
            return Ok(command.postprocess(&format!("{}{}", stdout, stderr)));
        }
        Ok(command.postprocess(&stdout))
    }
}

/// Short hostname of an FQDN (`cloudcephmon1001.eqiad.wmnet` -> `cloudcephmon1001`).
pub fn short_hostname(fqdn: &str) -> &str {
    fqdn.split('.').next().unwrap_or(fqdn)
}

/// Domain part of an FQDN, empty if there is none.
pub fn domain_of(fqdn: &str) -> &str {
    fqdn.split_once('.').map(|(_, domain)| domain).unwrap_or("")
}
