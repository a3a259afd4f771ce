//! Elevated helper subprocess
//!
//! Some counters need privileges the observer does not hold itself. A small
//! helper binary carrying the required capabilities is run with a single pid
//! argument and prints one number. If its capabilities have been stripped it
//! exits non-zero with "permission denied" on stderr, which is surfaced as
//! [`ObserverError::CapabilitiesLost`] so the agent restarts.

use crate::error::{ObserverError, Result, SENTINEL};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

/// Hard bound on a single helper run
pub const HELPER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ElevatedHelper {
    path: PathBuf,
    timeout: Duration,
}

impl ElevatedHelper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: HELPER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the helper for `pid`. A hung helper is killed at the timeout.
    pub async fn query(&self, pid: u32) -> Result<f64> {
        let child = Command::new(&self.path)
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(helper = %self.path.display(), error = %e, "Failed to start elevated helper");
                return Ok(SENTINEL);
            }
        };

        // dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(helper = %self.path.display(), pid, error = %e, "Elevated helper failed");
                return Ok(SENTINEL);
            }
            Err(_) => {
                warn!(
                    helper = %self.path.display(),
                    pid,
                    timeout_secs = self.timeout.as_secs(),
                    "Elevated helper hung and was killed"
                );
                return Ok(SENTINEL);
            }
        };

        interpret_output(
            output.status.success(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }
}

/// Map a helper run to a value, the sentinel, or capability loss
pub fn interpret_output(success: bool, stdout: &str, stderr: &str) -> Result<f64> {
    if !success {
        if stderr.to_ascii_lowercase().contains("permission denied") {
            return Err(ObserverError::CapabilitiesLost(stderr.trim().to_string()));
        }
        return Ok(SENTINEL);
    }
    Ok(stdout.trim().parse::<f64>().unwrap_or(SENTINEL))
}
