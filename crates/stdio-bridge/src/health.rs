//! Health and status types for the bridge.

use std::fmt;
use std::process::ExitStatus;

use serde::Serialize;

use crate::stats::StatsSnapshot;

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lifecycle state of the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Running,
    /// Exited or killed; the bridge does not restart it
    Exited,
}

/// How the subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Signal name (e.g. `SIGTERM`) when the process was killed by a signal.
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: signal_name(&status),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.signal) {
            (Some(code), None) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by {signal}"),
            (Some(code), Some(signal)) => write!(f, "exit code {code}, signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal()?;
    Some(
        nix::sys::signal::Signal::try_from(signal)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("signal {signal}")),
    )
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

/// Subprocess status as reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct SubprocessStatus {
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the process was launched (RFC 3339).
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
}

impl SubprocessStatus {
    pub fn running(pid: Option<u32>) -> Self {
        Self {
            state: ProcessState::Running,
            pid,
            started_at: chrono::Utc::now().to_rfc3339(),
            exit: None,
        }
    }

    pub fn exited(mut self, exit: ExitInfo) -> Self {
        self.state = ProcessState::Exited;
        self.exit = Some(exit);
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }
}

/// Version information for the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub bridge: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
        }
    }
}

/// Snapshot of bridge health for transports to report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub ok: bool,
    pub subprocess: SubprocessStatus,
    /// Requests written to the subprocess and still awaiting a reply.
    pub pending: usize,
    pub stats: StatsSnapshot,
    pub version: VersionInfo,
}
