//! Host side effects behind capability traits.
//!
//! Remediation never spawns processes directly; it goes through
//! [`ServiceController`], [`PortController`] and [`PermissionController`].
//! [`SystemHost`] implements all three with fixed argument lists, so no rule
//! file value ever reaches a shell.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::HostConfig;

/// Errors produced by host commands.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The command exceeded its timeout and was killed.
    #[error("{program} timed out after {seconds}s")]
    Timeout {
        /// Program name.
        program: String,
        /// Timeout budget in seconds.
        seconds: u64,
    },
    /// The command exited unsuccessfully.
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        /// Program name.
        program: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Captured stderr, trimmed.
        stderr: String,
    },
}

/// Restarts OS services.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Restart the named service unit.
    async fn restart(&self, service: &str) -> Result<(), HostError>;
}

/// Inspects and frees TCP ports.
#[async_trait]
pub trait PortController: Send + Sync {
    /// Whether any process has the port open.
    async fn port_in_use(&self, port: u16) -> Result<bool, HostError>;
    /// PIDs of processes bound to the port.
    async fn pids_on_port(&self, port: u16) -> Result<Vec<u32>, HostError>;
    /// Send SIGKILL to a process.
    async fn kill(&self, pid: u32) -> Result<(), HostError>;
}

/// Changes file ownership and mode.
#[async_trait]
pub trait PermissionController: Send + Sync {
    /// Recursively change the owner of `path`.
    async fn chown_recursive(&self, path: &Path, owner: &str) -> Result<(), HostError>;
    /// Recursively change the mode of `path`.
    async fn chmod_recursive(&self, path: &Path, mode: &str) -> Result<(), HostError>;
}

/// Every host capability remediation needs.
pub trait Host: ServiceController + PortController + PermissionController {}

impl<T> Host for T where T: ServiceController + PortController + PermissionController {}

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout text.
    pub stdout: String,
    /// Captured stderr text.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a program with a fixed argument list and a timeout.
///
/// The child is killed if the timeout elapses.
///
/// # Errors
///
/// Returns [`HostError::Spawn`] or [`HostError::Timeout`]. A non-zero exit is
/// not an error here; inspect [`CommandOutput::exit_code`].
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, HostError> {
    debug!(program, ?args, "running host command");

    let child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HostError::Spawn {
            program: program.to_owned(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(HostError::Spawn {
                program: program.to_owned(),
                source,
            })
        }
        Err(_) => {
            return Err(HostError::Timeout {
                program: program.to_owned(),
                seconds: timeout.as_secs(),
            })
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Command-backed implementation of every host capability.
#[derive(Debug, Clone)]
pub struct SystemHost {
    use_sudo: bool,
    timeout: Duration,
}

impl SystemHost {
    /// Create a host from settings.
    pub fn new(config: &HostConfig) -> Self {
        Self {
            use_sudo: config.use_sudo,
            timeout: config.command_timeout(),
        }
    }

    /// Run a command that needs elevated privileges, prefixed with `sudo`
    /// when configured, and require exit code 0.
    async fn privileged(&self, program: &str, args: &[&str]) -> Result<(), HostError> {
        let output = if self.use_sudo {
            let mut full = Vec::with_capacity(args.len().saturating_add(1));
            full.push(program);
            full.extend_from_slice(args);
            run_command("sudo", &full, self.timeout).await?
        } else {
            run_command(program, args, self.timeout).await?
        };

        if output.success() {
            Ok(())
        } else {
            Err(HostError::Failed {
                program: program.to_owned(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }

    /// Run `lsof` with the given arguments.
    ///
    /// `lsof` exits 1 when nothing matches, so that is treated as an empty
    /// result rather than a failure. It also prints warnings about mounts it
    /// cannot stat on an otherwise ordinary run; those only reach the debug log.
    async fn lsof(&self, args: &[&str]) -> Result<Option<String>, HostError> {
        let output = run_command("lsof", args, self.timeout).await?;
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            debug!(?args, stderr, "lsof diagnostics");
        }
        match output.exit_code {
            Some(0) => Ok(Some(output.stdout)),
            Some(1) => Ok(None),
            code => Err(HostError::Failed {
                program: "lsof".to_owned(),
                code,
                stderr: stderr.to_owned(),
            }),
        }
    }
}

#[async_trait]
impl ServiceController for SystemHost {
    async fn restart(&self, service: &str) -> Result<(), HostError> {
        self.privileged("systemctl", &["restart", service]).await
    }
}

#[async_trait]
impl PortController for SystemHost {
    async fn port_in_use(&self, port: u16) -> Result<bool, HostError> {
        let spec = format!(":{port}");
        Ok(self
            .lsof(&["-i", &spec])
            .await?
            .is_some_and(|out| !out.trim().is_empty()))
    }

    async fn pids_on_port(&self, port: u16) -> Result<Vec<u32>, HostError> {
        let spec = format!(":{port}");
        let stdout = self.lsof(&["-t", "-i", &spec]).await?.unwrap_or_default();
        Ok(parse_pid_list(&stdout))
    }

    async fn kill(&self, pid: u32) -> Result<(), HostError> {
        let pid = pid.to_string();
        self.privileged("kill", &["-9", &pid]).await
    }
}

#[async_trait]
impl PermissionController for SystemHost {
    async fn chown_recursive(&self, path: &Path, owner: &str) -> Result<(), HostError> {
        let path = path.to_string_lossy();
        self.privileged("chown", &["-R", owner, "--", &path]).await
    }

    async fn chmod_recursive(&self, path: &Path, mode: &str) -> Result<(), HostError> {
        let path = path.to_string_lossy();
        self.privileged("chmod", &["-R", mode, "--", &path]).await
    }
}

/// Parse `lsof -t` output: one PID per line, duplicates removed, order kept.
pub fn parse_pid_list(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = Vec::new();
    for pid in stdout.lines().filter_map(|l| l.trim().parse::<u32>().ok()) {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}
