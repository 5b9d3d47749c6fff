//! The top-level entry point: an immutable `Engine` value with builder
//! methods returning new `Engine` values, resolving a [`Target`] to the
//! right [`Adapter`] and producing a [`ProcessHandle`]. Owns the shared
//! [`SshPool`] and Docker clients lazily so the common case (one-off local
//! commands) never pays for a pool it doesn't use.
//!
//! A single struct callers construct once, hand configuration to via
//! builder methods, and use to produce request handles — generalized
//! across four substrates instead of one.

use crate::adapter::docker::compose::ComposeRunner;
use crate::adapter::{Adapter, DockerSpec, K8sSpec, RemoteDockerAdapter, SshSpec, Target};
use crate::adapter::{DockerAdapter, K8sAdapter, LocalAdapter};
use crate::adapter::ssh::{PoolConfig, SshAdapter, SshPool};
use crate::command::{Command, Options};
use crate::errors::XecResult;
use crate::process::ProcessHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keys a cached per-target adapter by its resolved identity, so repeated
/// calls against the same host/container/pod reuse one adapter (and, for
/// SSH, share the pool) instead of reconnecting every time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AdapterKey {
    Local,
    Ssh(String, u16, String),
    Docker(String),
    K8s(String, String),
    RemoteDocker(String, u16, String, String),
}

impl AdapterKey {
    fn for_target(target: &Target) -> Self {
        match target {
            Target::Local => AdapterKey::Local,
            Target::Ssh(spec) => AdapterKey::Ssh(spec.host.clone(), spec.port, spec.user.clone()),
            Target::Docker(spec) => AdapterKey::Docker(spec.container_or_image().to_string()),
            Target::K8s(spec) => {
                AdapterKey::K8s(spec.namespace.clone().unwrap_or_else(|| "default".to_string()), spec.pod.clone())
            }
            Target::RemoteDocker(ssh, docker) => AdapterKey::RemoteDocker(
                ssh.host.clone(),
                ssh.port,
                ssh.user.clone(),
                docker.container_or_image().to_string(),
            ),
        }
    }
}

/// Shared state behind every `Engine` handle: the adapter cache and the
/// lazily-constructed SSH pool. Cloning an `Engine` clones the `Arc`, so
/// every clone of a builder chain shares the same live connections.
struct Inner {
    pool_config: PoolConfig,
    ssh_pool: Mutex<Option<Arc<SshPool>>>,
    adapters: Mutex<HashMap<AdapterKey, Arc<dyn Adapter>>>,
}

/// The engine resolves targets to adapters and produces [`ProcessHandle`]s.
/// `Engine` is cheap to clone (an `Arc` around shared pool/adapter state);
/// builder methods like [`Engine::with_pool_config`] consume `self` and
/// return a new value, matching the rest of the crate's cascade style.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Build an engine with default pool settings. Nothing is connected yet;
    /// adapters (and the SSH pool) are constructed lazily on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool_config(PoolConfig::default())
    }

    /// Build an engine whose SSH pool uses `config` instead of the default.
    #[must_use]
    pub fn with_pool_config(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool_config: config,
                ssh_pool: Mutex::new(None),
                adapters: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn ssh_pool(&self) -> Arc<SshPool> {
        let mut guard = self.inner.ssh_pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return pool.clone();
        }
        let pool = Arc::new(SshPool::new(self.inner.pool_config.clone()));
        *guard = Some(pool.clone());
        pool
    }

    /// Resolve `target` to its cached (or freshly constructed) adapter,
    /// without producing a [`ProcessHandle`]. Exposed for callers — chiefly
    /// the CLI's `copy` command — that need to drive an adapter's
    /// `copy_in`/`copy_out` directly rather than through `run`.
    ///
    /// # Errors
    /// Propagates from the adapter's constructor, same as [`Engine::run`].
    pub async fn adapter_for(&self, target: &Target) -> XecResult<Arc<dyn Adapter>> {
        let key = AdapterKey::for_target(target);
        if let Some(adapter) = self.inner.adapters.lock().await.get(&key) {
            return Ok(adapter.clone());
        }
        let adapter: Arc<dyn Adapter> = match target {
            Target::Local => Arc::new(LocalAdapter::new()),
            Target::Ssh(spec) => Arc::new(SshAdapter::new(spec.clone(), self.ssh_pool().await)),
            Target::Docker(spec) => Arc::new(DockerAdapter::new(spec.clone())?),
            Target::K8s(spec) => Arc::new(K8sAdapter::new(spec.clone())?),
            Target::RemoteDocker(ssh, docker) => {
                Arc::new(RemoteDockerAdapter::new(ssh.clone(), docker.clone(), self.ssh_pool().await))
            }
        };
        self.inner.adapters.lock().await.insert(key, adapter.clone());
        Ok(adapter)
    }

    /// Produce a [`ProcessHandle`] that will run `command` against `target`
    /// once driven. This is the engine's central operation; every
    /// convenience method below is a thin wrapper over it.
    ///
    /// # Errors
    /// Returns an error if the adapter for `target` could not be constructed
    /// (e.g. the Docker daemon is unreachable, or `kubectl` is missing).
    pub async fn run(&self, target: Target, command: Command) -> XecResult<ProcessHandle> {
        let adapter = self.adapter_for(&target).await?;
        Ok(ProcessHandle::new(adapter, command))
    }

    /// Convenience: run `command` on the local host.
    ///
    /// # Errors
    /// Infallible in practice (the local adapter never fails to construct)
    /// but kept `Result`-shaped to match [`Engine::run`].
    pub async fn local(&self, command: Command) -> XecResult<ProcessHandle> {
        self.run(Target::Local, command).await
    }

    /// Convenience: run `command` on a remote host over SSH.
    ///
    /// # Errors
    /// Propagates from [`Engine::run`].
    pub async fn ssh(&self, spec: SshSpec, command: Command) -> XecResult<ProcessHandle> {
        self.run(Target::Ssh(spec), command).await
    }

    /// Convenience: run `command` against a Docker container or ephemeral
    /// image run.
    ///
    /// # Errors
    /// Propagates from [`Engine::run`], including `DaemonUnreachable`.
    pub async fn docker(&self, spec: DockerSpec, command: Command) -> XecResult<ProcessHandle> {
        self.run(Target::Docker(spec), command).await
    }

    /// Convenience: run `command` against a Kubernetes pod via `kubectl`.
    ///
    /// # Errors
    /// Propagates from [`Engine::run`], including `BinaryNotFound` if
    /// `kubectl` is not on `PATH`.
    pub async fn k8s(&self, spec: K8sSpec, command: Command) -> XecResult<ProcessHandle> {
        self.run(Target::K8s(spec), command).await
    }

    /// Convenience: run `command` against a container reached through an
    /// SSH-borrowed session.
    ///
    /// # Errors
    /// Propagates from [`Engine::run`].
    pub async fn remote_docker(&self, ssh: SshSpec, docker: DockerSpec, command: Command) -> XecResult<ProcessHandle> {
        self.run(Target::RemoteDocker(ssh, docker), command).await
    }

    /// Build a `docker compose` wrapper for `compose up`/`down`/`ps`/`logs`
    /// against the given compose files. Compose calls shell
    /// out directly rather than going through an `Adapter`, so this does not
    /// touch the engine's adapter cache.
    #[must_use]
    pub fn compose(&self, files: Vec<std::path::PathBuf>, project_name: Option<String>) -> ComposeRunner {
        ComposeRunner { files, project_name }
    }

    /// Apply `options` onto a freshly-built shell-string command, the path
    /// the task runner uses before calling [`Engine::run`].
    #[must_use]
    pub fn command_from(options: &Options, shell_string: impl Into<String>) -> Command {
        options.apply(Command::shell_string(shell_string))
    }

    /// Release every adapter and the SSH pool this engine has constructed,
    /// in reverse order: adapters first (each `dispose()`d individually, so
    /// a failure on one does not prevent the others from being attempted),
    /// then the pool.
    ///
    /// # Errors
    /// Returns the first adapter-disposal error encountered, after every
    /// adapter (and the pool) has still been given a chance to dispose.
    pub async fn dispose(&self) -> XecResult<()> {
        let adapters: Vec<Arc<dyn Adapter>> = self.inner.adapters.lock().await.drain().map(|(_, v)| v).collect();
        let mut first_err = None;
        for adapter in adapters {
            if let Err(e) = adapter.dispose().await {
                tracing::warn!(error = %e, "adapter failed to dispose cleanly");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if let Some(pool) = self.inner.ssh_pool.lock().await.take() {
            let remaining = pool.dispose().await;
            if !remaining.is_empty() {
                tracing::warn!(remaining = remaining.len(), "ssh pool left sessions undisposed");
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_round_trip_runs_and_disposes() {
        let engine = Engine::new();
        let handle = engine.local(Command::shell_string("echo hi")).await.unwrap();
        let result = handle.output().await.unwrap();
        assert_eq!(result.text(), "hi");
        engine.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_local_calls_reuse_the_cached_adapter() {
        let engine = Engine::new();
        let _ = engine.local(Command::shell_string("true")).await.unwrap();
        let _ = engine.local(Command::shell_string("true")).await.unwrap();
        assert_eq!(engine.inner.adapters.lock().await.len(), 1);
    }
}
