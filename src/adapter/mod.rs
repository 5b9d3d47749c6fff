//! The substrate-abstracting adapter layer and the [`Target`] values
//! that select which adapter a command runs against.

pub mod docker;
pub mod k8s;
pub mod local;
pub mod remote_docker;
pub mod ssh;

pub use docker::{DockerAdapter, DockerSpec};
pub use k8s::{K8sAdapter, K8sSpec};
pub use local::LocalAdapter;
pub use remote_docker::RemoteDockerAdapter;
pub use ssh::{SshAdapter, SshSpec};

use crate::command::Command;
use crate::errors::XecResult;
use crate::result::ExecResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

/// A named execution destination. `Local` carries no
/// parameters; the other variants wrap the connection parameters for their
/// substrate.
#[derive(Debug, Clone)]
pub enum Target {
    /// The local host.
    Local,
    /// A remote host over SSH.
    Ssh(SshSpec),
    /// A Docker container or ephemeral image run.
    Docker(DockerSpec),
    /// A Kubernetes pod.
    K8s(K8sSpec),
    /// A Docker container reached through an SSH-borrowed session.
    RemoteDocker(SshSpec, DockerSpec),
}

impl Target {
    /// A short, stable label for diagnostics and `--json` output.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Target::Local => "local".to_string(),
            Target::Ssh(spec) => format!("ssh:{}@{}", spec.user, spec.host),
            Target::Docker(spec) => format!("docker:{}", spec.container_or_image()),
            Target::K8s(spec) => format!("pod:{}/{}", spec.namespace.as_deref().unwrap_or("default"), spec.pod),
            Target::RemoteDocker(ssh, docker) => {
                format!("docker:{}@{}:{}", ssh.user, ssh.host, docker.container_or_image())
            }
        }
    }
}

/// One chunk of a streamed output: either a byte chunk tagged by which
/// stream it came from, or the terminal result once the process exits.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Bytes read from stdout.
    Stdout(Vec<u8>),
    /// Bytes read from stderr.
    Stderr(Vec<u8>),
}

/// Output of [`Adapter::stream`]: a lazy sequence of tagged chunks plus a
/// future that resolves to the terminal [`ExecResult`] once the underlying
/// process exits.
pub struct StreamHandle {
    /// Lazily-produced stdout/stderr chunks, in emission order.
    pub chunks: BoxStream<'static, XecResult<StreamChunk>>,
    /// Resolves once the process has exited.
    pub wait: futures::future::BoxFuture<'static, XecResult<ExecResult>>,
}

/// Progress callback invoked during file transfer: `(bytes_done, bytes_total)`.
/// `bytes_total` is `None` when the size cannot be determined up front
/// (e.g. a directory tree whose size has not been pre-walked).
pub type ProgressFn = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Which resources remain live after a partially-failed [`Adapter::dispose`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DisposeReport {
    /// Resources (session ids, sockets, pids) that could not be released.
    pub remaining: Vec<String>,
}

impl DisposeReport {
    /// No resources remain; the common, successful case.
    #[must_use]
    pub fn clean() -> Self {
        Self::default()
    }

    /// Whether every resource was released.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// The contract every substrate must satisfy: `execute`, `stream`,
/// `copy_in`/`copy_out`, `dispose`. Adapters must be safe to share across
/// concurrent callers — implementations hold their own interior
/// mutability (pools, client handles) rather than requiring external
/// synchronization.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Which substrate this adapter implements.
    fn kind(&self) -> crate::result::AdapterKind;

    /// Run `cmd` to completion and return its buffered result. The default
    /// buffered path; adapters that only support streaming (Docker logs,
    /// `kubectl logs -f`) implement this in terms of `stream`.
    async fn execute(&self, cmd: &Command) -> XecResult<ExecResult>;

    /// Start `cmd` and return a lazy, tagged byte stream plus a future for
    /// the terminal result. Used for long-running or log-follow commands
    /// where buffering the whole output is undesirable.
    async fn stream(&self, cmd: &Command) -> XecResult<StreamHandle>;

    /// Copy a local path into the substrate.
    async fn copy_in(&self, src: &Path, dst: &str, progress: Option<&ProgressFn>) -> XecResult<()>;

    /// Copy a path out of the substrate to a local destination.
    async fn copy_out(&self, src: &str, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()>;

    /// Release all resources this adapter owns. Idempotent; a second call
    /// after a clean dispose returns `Ok(DisposeReport::clean())` immediately
    /// without attempting further teardown.
    async fn dispose(&self) -> XecResult<DisposeReport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ssh::SshAuth;

    #[test]
    fn local_target_label_is_stable() {
        assert_eq!(Target::Local.label(), "local");
    }

    #[test]
    fn ssh_target_label_includes_user_and_host() {
        let spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        assert_eq!(Target::Ssh(spec).label(), "ssh:deploy@db.internal");
    }

    #[test]
    fn docker_target_label_prefers_container_over_image() {
        let spec = DockerSpec::container("web-1");
        assert_eq!(Target::Docker(spec).label(), "docker:web-1");
    }

    #[test]
    fn k8s_target_label_defaults_namespace() {
        let spec = K8sSpec::new("api-7f8");
        assert_eq!(Target::K8s(spec).label(), "pod:default/api-7f8");
    }

    #[test]
    fn clean_dispose_report_is_clean() {
        let report = DisposeReport::clean();
        assert!(report.is_clean());
        assert!(report.remaining.is_empty());
    }

    #[test]
    fn dispose_report_with_remaining_is_not_clean() {
        let report = DisposeReport { remaining: vec!["session:1".to_string()] };
        assert!(!report.is_clean());
    }
}
