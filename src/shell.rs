//! Bounded execution of external commands.
//!
//! Every command the daemon runs (`rbd`, `mount`, `mkfs.*`, ...) goes
//! through [`run`], which enforces a deadline so a wedged tool cannot hang
//! the daemon and, transitively, the Docker engine. Stdout is returned
//! trimmed; stderr is captured into the error for diagnostics.

use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Deadline applied by helpers that do not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// mkfs on a large image is legitimately slow.
pub const MKFS_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("'{command}' did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("invalid command timeout: must be positive")]
    InvalidTimeout,

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[error("failed to run '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShellError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShellError::Timeout { .. })
    }
}

/// Run `name args...` with the given deadline, returning trimmed stdout.
///
/// The child is killed if the deadline elapses. A zero timeout is a
/// programmer error and fails before anything is spawned.
pub async fn run(timeout: Duration, name: &str, args: &[&str]) -> Result<String, ShellError> {
    if timeout.is_zero() {
        return Err(ShellError::InvalidTimeout);
    }

    let command = if args.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", name, args.join(" "))
    };
    debug!(%command, timeout = ?timeout, "running command");

    let mut child = Command::new(name);
    child
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, child.output()).await {
        Err(_) => return Err(ShellError::Timeout { command, timeout }),
        Ok(Err(source)) => return Err(ShellError::Io { command, source }),
        Ok(Ok(output)) => output,
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(ShellError::Failed {
            command,
            status: output.status,
            stdout,
            stderr,
        });
    }

    Ok(stdout)
}

/// Run with [`DEFAULT_TIMEOUT`].
pub async fn run_default(name: &str, args: &[&str]) -> Result<String, ShellError> {
    run(DEFAULT_TIMEOUT, name, args).await
}

/// Command deadline as a CLI argument.
///
/// Defaults to seconds if no unit is specified, otherwise uses humantime
/// parsing ("2m30s").
#[derive(Debug, Clone, Copy)]
pub struct ShellTimeout(pub Duration);

impl FromStr for ShellTimeout {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(ShellTimeout(Duration::from_secs(secs)));
        }
        let duration = humantime::parse_duration(s)?;
        Ok(ShellTimeout(duration))
    }
}

impl std::fmt::Display for ShellTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl From<ShellTimeout> for Duration {
    fn from(val: ShellTimeout) -> Self {
        val.0
    }
}

impl Default for ShellTimeout {
    fn default() -> Self {
        ShellTimeout(DEFAULT_TIMEOUT)
    }
}
