//! The terminal value of a finished execution.

use crate::errors::XecError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Which substrate produced a [`ExecResult`]. Carried on every result so
/// logs and `--json` output can attribute a run without the caller having
/// to thread it through separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// The local host.
    Local,
    /// A remote host over SSH.
    Ssh,
    /// A Docker container.
    Docker,
    /// A Kubernetes pod.
    K8s,
    /// A Docker container reached over SSH.
    RemoteDocker,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterKind::Local => "local",
            AdapterKind::Ssh => "ssh",
            AdapterKind::Docker => "docker",
            AdapterKind::K8s => "k8s",
            AdapterKind::RemoteDocker => "remote-docker",
        };
        write!(f, "{s}")
    }
}

/// The outcome of one finished execution.
///
/// A `ExecResult` is always produced, even on failure; whether a failure also
/// raises an error depends on `throw_on_non_zero_exit`/`nothrow`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecResult {
    /// Captured standard output, decoded per the command's configured
    /// encoding (currently always UTF-8, replacing invalid sequences).
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code, `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any. Mutually exclusive with
    /// `exit_code` being `Some`.
    pub signal: Option<i32>,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Which substrate produced this result.
    pub adapter: AdapterKind,
    /// A structured cause, populated when the underlying adapter classified
    /// a failure (kept separate from `ok` so a caller can inspect why a
    /// `nothrow` execution failed without catching an exception).
    #[serde(skip)]
    pub cause: Option<std::sync::Arc<XecError>>,
}

impl ExecResult {
    /// `result.ok == (result.exit_code == 0 && result.signal == none)`
    ///.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    /// Build a successful (or plain non-zero-exit) result with no cause.
    #[must_use]
    pub fn new(
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        adapter: AdapterKind,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            stdout,
            stderr,
            exit_code,
            signal,
            duration_ms,
            started_at,
            finished_at,
            adapter,
            cause: None,
        }
    }

    /// Attach a classified cause (used when `ok()` is false and the caller
    /// asked for `nothrow`, so the cause is still inspectable).
    #[must_use]
    pub fn with_cause(mut self, cause: XecError) -> Self {
        self.cause = Some(std::sync::Arc::new(cause));
        self
    }

    /// Stdout with trailing whitespace trimmed, the common case for
    /// single-line command output.
    #[must_use]
    pub fn text(&self) -> &str {
        self.stdout.trim_end()
    }

    /// Parse stdout as JSON.
    ///
    /// # Errors
    /// Returns a [`serde_json::Error`] if stdout is not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.stdout)
    }

    /// The duration as a [`Duration`].
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(exit_code: Option<i32>, signal: Option<i32>) -> ExecResult {
        let now = Utc::now();
        ExecResult::new(String::new(), String::new(), exit_code, signal, now, now, AdapterKind::Local)
    }

    #[test]
    fn ok_identity_holds() {
        assert!(sample(Some(0), None).ok());
        assert!(!sample(Some(1), None).ok());
        assert!(!sample(None, Some(9)).ok());
        assert!(!sample(Some(0), Some(9)).ok());
    }

    #[test]
    fn text_trims_trailing_newline() {
        let mut r = sample(Some(0), None);
        r.stdout = "hello\n".to_string();
        assert_eq!(r.text(), "hello");
    }
}
