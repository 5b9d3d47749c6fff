//! Docker adapter: container lifecycle, exec, log streaming, and
//! archive-based copy against a Docker daemon.
//!
//! Keeps the same container/exec/logs/health split used by the rest of
//! this crate's Docker surface, but talks to the daemon's HTTP API via
//! `bollard` instead of shelling out to the `docker` binary — the Engine
//! HTTP API is the wire contract for this adapter. The CLI-wrapping style
//! used for the rest of Docker's surface is kept for `compose` in
//! `compose.rs`, which remains a thin subprocess wrapper.

pub mod compose;

use crate::adapter::{Adapter, DisposeReport, ProgressFn, StreamChunk, StreamHandle};
use crate::command::{Command, Program};
use crate::errors::{XecError, XecResult};
use crate::result::{AdapterKind, ExecResult};
use async_trait::async_trait;
use bollard::container::{LogsOptions, UploadToContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Which container (or ephemeral image) a [`DockerAdapter`] targets.
#[derive(Debug, Clone)]
pub struct DockerSpec {
    /// An existing container id or name, if operating on one.
    pub container: Option<String>,
    /// An image reference, if commands should run in a fresh, optionally
    /// auto-removed container.
    pub image: Option<String>,
    /// Environment to apply to the exec/run.
    pub env: std::collections::HashMap<String, String>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// User to run as inside the container.
    pub user: Option<String>,
    /// Allocate a TTY.
    pub tty: bool,
    /// Remove the ephemeral container after execution.
    pub auto_remove: bool,
}

impl DockerSpec {
    /// Target an existing container by id or name.
    #[must_use]
    pub fn container(name: impl Into<String>) -> Self {
        Self {
            container: Some(name.into()),
            image: None,
            env: std::collections::HashMap::new(),
            workdir: None,
            user: None,
            tty: false,
            auto_remove: false,
        }
    }

    /// Target an ephemeral container run from `image`.
    #[must_use]
    pub fn ephemeral(image: impl Into<String>) -> Self {
        Self {
            container: None,
            image: Some(image.into()),
            env: std::collections::HashMap::new(),
            workdir: None,
            user: None,
            tty: false,
            auto_remove: true,
        }
    }

    /// A short label for diagnostics: the container name if set, else the
    /// image reference.
    #[must_use]
    pub fn container_or_image(&self) -> &str {
        self.container.as_deref().or(self.image.as_deref()).unwrap_or("?")
    }
}

/// Options accepted by [`DockerAdapter::logs`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Keep streaming new lines as they are produced.
    pub follow: bool,
    /// Only return the last N lines.
    pub tail: Option<u64>,
    /// Include RFC3339 timestamps on each line.
    pub timestamps: bool,
    /// Only return lines since this Unix timestamp.
    pub since: Option<i64>,
}

/// Executes against containers (existing or ephemeral) through the Docker
/// Engine HTTP API.
pub struct DockerAdapter {
    spec: DockerSpec,
    client: Docker,
    /// Set once an ephemeral container has been created, so `dispose()` (or
    /// a second call) can remove it.
    ephemeral_id: tokio::sync::Mutex<Option<String>>,
    disposed: AtomicBool,
}

impl DockerAdapter {
    /// Connect to the local Docker daemon (honoring `DOCKER_HOST`) and
    /// build an adapter for `spec`.
    pub fn new(spec: DockerSpec) -> XecResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| XecError::DaemonUnreachable(e.to_string()))?;
        Ok(Self {
            spec,
            client,
            ephemeral_id: tokio::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Build an adapter from an already-connected client (used by the
    /// remote-docker adapter, which tunnels the socket over SSH).
    #[must_use]
    pub fn from_client(spec: DockerSpec, client: Docker) -> Self {
        Self {
            spec,
            client,
            ephemeral_id: tokio::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_disposed(&self) -> XecResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(XecError::AlreadyDisposed);
        }
        Ok(())
    }

    /// Resolve the container id to exec against, creating and starting an
    /// ephemeral one from `spec.image` on first use if no existing
    /// container was configured.
    async fn resolve_container(&self) -> XecResult<String> {
        if let Some(id) = &self.spec.container {
            return Ok(id.clone());
        }
        let mut guard = self.ephemeral_id.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }
        let image = self
            .spec
            .image
            .as_ref()
            .ok_or_else(|| XecError::ContainerNotFound("no container or image configured".to_string()))?;

        self.pull_if_missing(image).await?;

        let config = bollard::container::Config {
            image: Some(image.clone()),
            tty: Some(self.spec.tty),
            env: Some(
                self.spec
                    .env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            working_dir: self.spec.workdir.clone(),
            user: self.spec.user.clone(),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };
        let created = self
            .client
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))?;
        self.client
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))?;
        debug!(container = %created.id, %image, "started ephemeral container");
        *guard = Some(created.id.clone());
        Ok(created.id)
    }

    async fn pull_if_missing(&self, image: &str) -> XecResult<()> {
        use bollard::image::CreateImageOptions;
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let mut stream = self.client.create_image(
            Some(CreateImageOptions { from_image: image.to_string(), ..Default::default() }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                return Err(XecError::ImagePullFailed { image: image.to_string(), reason: e.to_string() });
            }
        }
        Ok(())
    }

    /// Container lifecycle: create from `image` without starting.
    pub async fn create(&self, image: &str, config: bollard::container::Config<String>) -> XecResult<String> {
        self.pull_if_missing(image).await?;
        let created = self
            .client
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))?;
        Ok(created.id)
    }

    /// Start a previously created container.
    pub async fn start(&self, id: &str) -> XecResult<()> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))
    }

    /// Stop a running container, sending `SIGTERM` then `SIGKILL` after
    /// `timeout_sec`.
    pub async fn stop(&self, id: &str, timeout_sec: Option<i64>) -> XecResult<()> {
        use bollard::container::StopContainerOptions;
        self.client
            .stop_container(id, timeout_sec.map(|t| StopContainerOptions { t }))
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))
    }

    /// Remove a container, optionally forcing removal of a running one.
    pub async fn remove(&self, id: &str, force: bool) -> XecResult<()> {
        use bollard::container::RemoveContainerOptions;
        self.client
            .remove_container(id, Some(RemoveContainerOptions { force, ..Default::default() }))
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    XecError::ContainerNotFound(id.to_string())
                } else {
                    XecError::ExecFailed(e.to_string())
                }
            })
    }

    /// Inspect a container's current state.
    pub async fn inspect(&self, id: &str) -> XecResult<bollard::models::ContainerInspectResponse> {
        self.client
            .inspect_container(id, None)
            .await
            .map_err(|e| XecError::ContainerNotFound(format!("{id}: {e}")))
    }

    /// Poll a container's health status until `healthy` or `timeout` elapses
    ///.
    pub async fn wait_for_healthy(&self, id: &str, timeout: Duration) -> XecResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let inspect = self.inspect(id).await?;
            let status = inspect
                .state
                .as_ref()
                .and_then(|s| s.health.as_ref())
                .and_then(|h| h.status);
            if matches!(status, Some(bollard::models::HealthStatusEnum::HEALTHY)) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(XecError::HealthCheckTimeout { id: id.to_string(), timeout });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Return a lazy log stream. Restartable by calling
    /// again; not seekable mid-stream.
    pub fn logs(&self, id: &str, opts: LogOptions) -> impl futures::Stream<Item = XecResult<StreamChunk>> + '_ {
        let options = LogsOptions::<String> {
            follow: opts.follow,
            stdout: true,
            stderr: true,
            timestamps: opts.timestamps,
            tail: opts.tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
            since: opts.since.unwrap_or(0),
            ..Default::default()
        };
        self.client.logs(id, Some(options)).map(|item| match item {
            Ok(bollard::container::LogOutput::StdOut { message }) => Ok(StreamChunk::Stdout(message.to_vec())),
            Ok(bollard::container::LogOutput::StdErr { message }) => Ok(StreamChunk::Stderr(message.to_vec())),
            Ok(bollard::container::LogOutput::Console { message }) => Ok(StreamChunk::Stdout(message.to_vec())),
            Ok(bollard::container::LogOutput::StdIn { .. }) => Ok(StreamChunk::Stdout(Vec::new())),
            Err(e) => Err(XecError::ExecFailed(e.to_string())),
        })
    }

    async fn exec_command(&self, cmd: &Command) -> XecResult<(String, XecResult<ExecResult>)> {
        self.check_disposed()?;
        let container_id = self.resolve_container().await?;

        let cmd_vec = match cmd.program() {
            Program::ShellString(s) => vec!["sh".to_string(), "-c".to_string(), s.clone()],
            Program::Argv(p) => {
                let mut v = vec![p.clone()];
                v.extend(cmd.args.iter().cloned());
                v
            }
        };

        let exec = self
            .client
            .create_exec(
                &container_id,
                CreateExecOptions {
                    cmd: Some(cmd_vec),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(matches!(cmd.stdin, crate::command::Stdin::Bytes(_))),
                    tty: Some(self.spec.tty),
                    env: Some(cmd.env().iter().map(|(k, v)| format!("{k}={v}")).collect()),
                    working_dir: cmd.cwd().map(|p| p.display().to_string()).or_else(|| self.spec.workdir.clone()),
                    user: self.spec.user.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))?;

        let started_at = Utc::now();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))?
        {
            StartExecResults::Attached { mut output, mut input } => {
                if let crate::command::Stdin::Bytes(bytes) = &cmd.stdin {
                    use tokio::io::AsyncWriteExt;
                    let _ = input.write_all(bytes).await;
                    let _ = input.shutdown().await;
                }
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| XecError::ExecFailed(e.to_string()))? {
                        bollard::container::LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        bollard::container::LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        bollard::container::LogOutput::Console { message } => stdout.extend_from_slice(&message),
                        bollard::container::LogOutput::StdIn { .. } => {}
                    }
                    if (stdout.len() as u64) > cmd.max_buffer_bytes() || (stderr.len() as u64) > cmd.max_buffer_bytes() {
                        return Ok((container_id, Err(XecError::BufferOverflow { limit_bytes: cmd.max_buffer_bytes() })));
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))?;
        let finished_at = Utc::now();
        let exit_code = inspect.exit_code.map(|c| c as i32);

        let result = ExecResult::new(
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            None,
            started_at,
            finished_at,
            AdapterKind::Docker,
        );

        if cmd.throw_on_non_zero_exit() && !result.ok() {
            return Ok((
                container_id,
                Err(XecError::CommandFailed {
                    command: cmd.display(),
                    exit_code: exit_code.unwrap_or(-1),
                    stdout: result.stdout.clone(),
                    stderr: result.stderr.clone(),
                }),
            ));
        }

        Ok((container_id, Ok(result)))
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Docker
    }

    async fn execute(&self, cmd: &Command) -> XecResult<ExecResult> {
        let (container_id, result) = self.exec_command(cmd).await?;
        let result = result?;
        if self.spec.auto_remove && self.spec.container.is_none() {
            if let Err(e) = self.remove(&container_id, true).await {
                warn!(error = %e, container = %container_id, "failed to auto-remove ephemeral container");
            }
        }
        Ok(result)
    }

    async fn stream(&self, cmd: &Command) -> XecResult<StreamHandle> {
        self.check_disposed()?;
        let cmd = cmd.clone();
        let (_, result) = self.exec_command(&cmd).await?;
        let result = result?;
        let stdout = result.stdout.clone().into_bytes();
        let stderr = result.stderr.clone().into_bytes();
        let chunks = stream::iter(vec![Ok(StreamChunk::Stdout(stdout)), Ok(StreamChunk::Stderr(stderr))]);
        Ok(StreamHandle {
            chunks: Box::pin(chunks),
            wait: Box::pin(async move { Ok(result) }),
        })
    }

    async fn copy_in(&self, src: &Path, dst: &str, progress: Option<&ProgressFn>) -> XecResult<()> {
        self.check_disposed()?;
        let container_id = self.resolve_container().await?;
        let (archive, total) = crate::adapter::docker::compose::tar_path(src)?;
        self.client
            .upload_to_container(
                &container_id,
                Some(UploadToContainerOptions { path: dst.to_string(), ..Default::default() }),
                archive.into(),
            )
            .await
            .map_err(|e| XecError::ExecFailed(e.to_string()))?;
        if let Some(cb) = progress {
            cb(total, Some(total));
        }
        Ok(())
    }

    async fn copy_out(&self, src: &str, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
        self.check_disposed()?;
        let container_id = self.resolve_container().await?;
        let mut stream = self.client.download_from_container(&container_id, Some(bollard::container::DownloadFromContainerOptions { path: src.to_string() }));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(|e| XecError::ExecFailed(e.to_string()))?);
        }
        let total = buf.len() as u64;
        crate::adapter::docker::compose::untar_to(&buf, dst)?;
        if let Some(cb) = progress {
            cb(total, Some(total));
        }
        Ok(())
    }

    async fn dispose(&self) -> XecResult<DisposeReport> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(DisposeReport::clean());
        }
        let mut remaining = Vec::new();
        let mut guard = self.ephemeral_id.lock().await;
        if let Some(id) = guard.take() {
            if self.remove(&id, true).await.is_err() {
                remaining.push(format!("container:{id}"));
            }
        }
        Ok(DisposeReport { remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_spec_label_prefers_container_over_image() {
        let spec = DockerSpec::container("web-1");
        assert_eq!(spec.container_or_image(), "web-1");
    }

    #[test]
    fn ephemeral_spec_auto_removes_by_default() {
        let spec = DockerSpec::ephemeral("redis:7.2-alpine");
        assert!(spec.auto_remove);
        assert_eq!(spec.container_or_image(), "redis:7.2-alpine");
    }
}
