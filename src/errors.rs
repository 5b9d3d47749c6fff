//! Error types for the execution engine.
//!
//! This module provides a single, comprehensive error enum covering every
//! substrate (local, SSH, Docker, Kubernetes) and every layer (command
//! construction, the SSH pool, the configuration loader, the CLI). Adapters
//! classify substrate-native failures into one of these variants and carry
//! the original error text along for diagnostics.

use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type XecResult<T> = Result<T, XecError>;

/// Comprehensive error type for all engine operations.
///
/// Every variant is plain data (no non-`Clone` source error is embedded
/// directly; I/O failures are captured as their rendered message) so a
/// finished [`crate::process::ProcessHandle`] can cache and replay its
/// terminal outcome verbatim on repeated awaits.
#[derive(Debug, Clone, Error)]
pub enum XecError {
    /// A value could not be rendered into a shell template.
    #[error("unsupported interpolation value: {0}")]
    UnsupportedValue(String),

    /// `shell(false)` was combined with a raw/templated command.
    #[error("raw shell string requires shell mode to be enabled")]
    RawWithoutShell,

    /// The local child process could not be spawned.
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed {
        /// Program that failed to start.
        program: String,
        /// Rendered message from the underlying OS error.
        reason: String,
    },

    /// The command ran and returned a non-zero exit code.
    #[error("command failed with exit code {exit_code}: {command}")]
    CommandFailed {
        /// The command line that was executed (for diagnostics only).
        command: String,
        /// Exit code returned by the process.
        exit_code: i32,
        /// Captured stdout, last 20 lines unless verbose.
        stdout: String,
        /// Captured stderr, last 20 lines unless verbose.
        stderr: String,
    },

    /// A command exceeded its configured timeout.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The process was terminated by a signal.
    #[error("command was killed by signal {0}")]
    KilledBySignal(i32),

    /// The user cancelled an in-flight handle.
    #[error("operation was cancelled")]
    Cancelled,

    /// Captured output exceeded `max_buffer_bytes`.
    #[error("output exceeded buffer limit of {limit_bytes} bytes")]
    BufferOverflow {
        /// The configured limit that was exceeded.
        limit_bytes: u64,
    },

    /// SSH/Docker daemon could not be reached.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// SSH authentication was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The remote host key did not match the expected/pinned key.
    #[error("host key mismatch for {host}")]
    HostKeyMismatch {
        /// Host whose key did not match.
        host: String,
    },

    /// Could not borrow a session from the SSH pool within the acquisition
    /// timeout.
    #[error("timed out acquiring an SSH session for {destination} after {waited:?}")]
    PoolAcquisitionTimeout {
        /// Destination key the caller was waiting on.
        destination: String,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The remote side refused to open a channel on an otherwise healthy
    /// session.
    #[error("remote refused to open channel: {0}")]
    ChannelOpenFailed(String),

    /// The remote command exited; carried separately from `CommandFailed`
    /// because SSH distinguishes exit status from signal termination.
    #[error("remote command exited with code {code:?}, signal {signal:?}")]
    RemoteExit {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Signal name, if terminated by a signal.
        signal: Option<String>,
    },

    /// SFTP operation failed for one file in a (possibly multi-file)
    /// transfer.
    #[error("sftp error transferring {path}: {reason}")]
    SftpError {
        /// Path that failed.
        path: String,
        /// Reason reported by the SFTP subsystem.
        reason: String,
    },

    /// A tunnel/port-forward failed to bind or bridge.
    #[error("tunnel error: {0}")]
    TunnelError(String),

    /// An operation was attempted on a tunnel whose owning session was
    /// evicted.
    #[error("tunnel is closed")]
    TunnelClosed,

    /// Docker daemon is unreachable.
    #[error("docker daemon unreachable: {0}")]
    DaemonUnreachable(String),

    /// `docker pull` (explicit or implicit, via ephemeral run) failed.
    #[error("failed to pull image {image}: {reason}")]
    ImagePullFailed {
        /// Image reference that failed to pull.
        image: String,
        /// Reason reported by the daemon.
        reason: String,
    },

    /// Referenced container does not exist.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Referenced pod does not exist.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// Referenced container inside a pod does not exist.
    #[error("container {container} not found in pod {pod}")]
    PodContainerNotFound {
        /// Pod name.
        pod: String,
        /// Container name that was not found.
        container: String,
    },

    /// `docker exec` failed to start or complete.
    #[error("exec failed: {0}")]
    ExecFailed(String),

    /// Container did not reach a healthy status before the deadline.
    #[error("container {id} did not become healthy within {timeout:?}")]
    HealthCheckTimeout {
        /// Container id or name.
        id: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// A configuration-resolved target token did not match anything.
    #[error("target not found: {token}{}", suggestion_suffix(.suggestion))]
    TargetNotFound {
        /// The token the user supplied.
        token: String,
        /// The closest known target name, if any, by edit distance.
        suggestion: Option<String>,
    },

    /// `profiles` formed a cycle via `extends`.
    #[error("profile cycle detected: {0}")]
    ProfileCycle(String),

    /// Configuration failed to parse or did not pass validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Required binary (`ssh`, `docker`, `kubectl`) was not found on `PATH`.
    #[error("required binary not found: {binary}")]
    BinaryNotFound {
        /// Name of the missing binary.
        binary: String,
    },

    /// `kubectl` context was not found in kubeconfig.
    #[error("kubernetes context not found: {0}")]
    ContextNotFound(String),

    /// `kubectl exec`/`logs` exited non-zero.
    #[error("kubectl exited non-zero: {0}")]
    ExecNonZero(String),

    /// A `kubectl port-forward` subprocess exited unexpectedly.
    #[error("port-forward process exited unexpectedly: {0}")]
    PortForwardExited(String),

    /// An adapter method was invoked after `dispose()`.
    #[error("adapter already disposed")]
    AlreadyDisposed,

    /// A `Future` resolved through a `.pipe()` chain whose producer failed.
    #[error("pipeline aborted: producer failed")]
    PipelineAborted {
        /// The producer's own result, for diagnostics.
        producer_exit_code: Option<i32>,
    },

    /// Feature intentionally delegated to an out-of-scope collaborator
    /// (the script-runner transpiler/evaluator, the REPL).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An I/O error that does not fit a more specific variant above.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for XecError {
    fn from(e: std::io::Error) -> Self {
        XecError::Io(e.to_string())
    }
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{s}'?)"),
        None => String::new(),
    }
}

impl XecError {
    /// Whether the default retry predicate should retry this error.
    ///
    /// Retry on exit code != 0 (`CommandFailed`) and on transient
    /// `ConnectFailed`/`Timeout`/`PoolAcquisitionTimeout`/`ChannelOpenFailed`;
    /// never on `AuthFailed`, `HostKeyMismatch`, `ContainerNotFound`/`PodNotFound`,
    /// or anything else classified as terminal.
    #[must_use]
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(
            self,
            XecError::CommandFailed { .. }
                | XecError::Timeout(_)
                | XecError::ConnectFailed(_)
                | XecError::PoolAcquisitionTimeout { .. }
                | XecError::ChannelOpenFailed(_)
                | XecError::DaemonUnreachable(_)
        )
    }

    /// The stable CLI exit code this error kind maps to.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            XecError::CommandFailed { exit_code, .. } => *exit_code,
            XecError::Timeout(_) => 124,
            XecError::BinaryNotFound { .. } | XecError::SpawnFailed { .. } => 127,
            XecError::AuthFailed(_) | XecError::HostKeyMismatch { .. } => 126,
            XecError::Cancelled => 130,
            XecError::ConfigInvalid(_) | XecError::ProfileCycle(_) | XecError::TargetNotFound { .. } => 2,
            _ => 1,
        }
    }

    /// A stable, machine-readable identifier for this error's kind, used in
    /// `--json` error output (distinct from the `Display` message, which is
    /// free text meant for humans).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            XecError::UnsupportedValue(_) => "UnsupportedValue",
            XecError::RawWithoutShell => "RawWithoutShell",
            XecError::SpawnFailed { .. } => "SpawnFailed",
            XecError::CommandFailed { .. } => "CommandFailed",
            XecError::Timeout(_) => "Timeout",
            XecError::KilledBySignal(_) => "KilledBySignal",
            XecError::Cancelled => "Cancelled",
            XecError::BufferOverflow { .. } => "BufferOverflow",
            XecError::ConnectFailed(_) => "ConnectFailed",
            XecError::AuthFailed(_) => "AuthFailed",
            XecError::HostKeyMismatch { .. } => "HostKeyMismatch",
            XecError::PoolAcquisitionTimeout { .. } => "PoolAcquisitionTimeout",
            XecError::ChannelOpenFailed(_) => "ChannelOpenFailed",
            XecError::RemoteExit { .. } => "RemoteExit",
            XecError::SftpError { .. } => "SftpError",
            XecError::TunnelError(_) => "TunnelError",
            XecError::TunnelClosed => "TunnelClosed",
            XecError::DaemonUnreachable(_) => "DaemonUnreachable",
            XecError::ImagePullFailed { .. } => "ImagePullFailed",
            XecError::ContainerNotFound(_) => "ContainerNotFound",
            XecError::PodNotFound(_) => "PodNotFound",
            XecError::PodContainerNotFound { .. } => "PodContainerNotFound",
            XecError::ExecFailed(_) => "ExecFailed",
            XecError::HealthCheckTimeout { .. } => "HealthCheckTimeout",
            XecError::TargetNotFound { .. } => "TargetNotFound",
            XecError::ProfileCycle(_) => "ProfileCycle",
            XecError::ConfigInvalid(_) => "ConfigInvalid",
            XecError::BinaryNotFound { .. } => "BinaryNotFound",
            XecError::ContextNotFound(_) => "ContextNotFound",
            XecError::ExecNonZero(_) => "ExecNonZero",
            XecError::PortForwardExited(_) => "PortForwardExited",
            XecError::AlreadyDisposed => "AlreadyDisposed",
            XecError::PipelineAborted { .. } => "PipelineAborted",
            XecError::Unsupported(_) => "Unsupported",
            XecError::Io(_) => "Io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_exit_code_passes_through() {
        let err = XecError::CommandFailed {
            command: "false".to_string(),
            exit_code: 7,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(err.exit_code(), 7);
        assert_eq!(err.kind(), "CommandFailed");
    }

    #[test]
    fn timeout_maps_to_124() {
        assert_eq!(XecError::Timeout(Duration::from_secs(30)).exit_code(), 124);
    }

    #[test]
    fn cancelled_maps_to_130() {
        assert_eq!(XecError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn target_not_found_is_bad_usage() {
        let err = XecError::TargetNotFound { token: "nope".to_string(), suggestion: None };
        assert_eq!(err.exit_code(), 2);
        assert!(!err.is_retryable_by_default());
    }

    #[test]
    fn retryable_kinds_are_transient() {
        assert!(XecError::Timeout(Duration::from_secs(1)).is_retryable_by_default());
        assert!(XecError::ConnectFailed("refused".to_string()).is_retryable_by_default());
        assert!(!XecError::AuthFailed("bad key".to_string()).is_retryable_by_default());
        assert!(!XecError::HostKeyMismatch { host: "db.internal".to_string() }.is_retryable_by_default());
        assert!(!XecError::ContainerNotFound("web".to_string()).is_retryable_by_default());
    }
}
