//! Remote-docker adapter: Docker operations on a remote host, composed
//! from the SSH adapter and the `docker` CLI on that host.
//!
//! Docker operations could either shell `docker` through the SSH session
//! or tunnel the remote Docker socket and reuse the HTTP-API adapter. This
//! implementation takes the former path: it is the one with no new moving
//! parts beyond what [`SshAdapter`] already provides, and it naturally
//! generalizes the CLI-wrapping style used elsewhere in this crate
//! (spawning `docker <args>`) to "somewhere other than the local host".

use crate::adapter::ssh::{SshAdapter, SshSpec};
use crate::adapter::{Adapter, DisposeReport, DockerSpec, ProgressFn, StreamChunk, StreamHandle};
use crate::command::{Command, Options, Program};
use crate::errors::{XecError, XecResult};
use crate::result::{AdapterKind, ExecResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Executes Docker operations against a container on a remote host reached
/// over SSH. Its destination key (for pool purposes) is the
/// composition of the SSH destination and the container identity.
pub struct RemoteDockerAdapter {
    ssh: SshAdapter,
    docker: DockerSpec,
    disposed: AtomicBool,
}

impl RemoteDockerAdapter {
    /// Build an adapter targeting `docker` on the host described by `ssh_spec`.
    #[must_use]
    pub fn new(ssh_spec: SshSpec, docker: DockerSpec, pool: std::sync::Arc<crate::adapter::ssh::SshPool>) -> Self {
        Self { ssh: SshAdapter::new(ssh_spec, pool), docker, disposed: AtomicBool::new(false) }
    }

    fn check_disposed(&self) -> XecResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(XecError::AlreadyDisposed);
        }
        Ok(())
    }

    /// Render the inner command as a `docker exec`/`docker run` invocation
    /// to be executed remotely.
    fn wrap_docker_command(&self, cmd: &Command) -> XecResult<Command> {
        let inner = match cmd.program() {
            Program::ShellString(s) => s.clone(),
            Program::Argv(p) => {
                let mut parts = vec![p.clone()];
                parts.extend(cmd.args.iter().cloned());
                parts.join(" ")
            }
        };

        let mut docker_args = Vec::new();
        if let Some(container) = &self.docker.container {
            docker_args.push("exec".to_string());
            for (k, v) in &self.docker.env {
                docker_args.push("-e".to_string());
                docker_args.push(format!("{k}={v}"));
            }
            if let Some(wd) = &self.docker.workdir {
                docker_args.push("-w".to_string());
                docker_args.push(wd.clone());
            }
            if let Some(user) = &self.docker.user {
                docker_args.push("-u".to_string());
                docker_args.push(user.clone());
            }
            docker_args.push(container.clone());
            docker_args.push("sh".to_string());
            docker_args.push("-c".to_string());
            docker_args.push(inner);
        } else if let Some(image) = &self.docker.image {
            docker_args.push("run".to_string());
            if self.docker.auto_remove {
                docker_args.push("--rm".to_string());
            }
            for (k, v) in &self.docker.env {
                docker_args.push("-e".to_string());
                docker_args.push(format!("{k}={v}"));
            }
            docker_args.push(image.clone());
            docker_args.push("sh".to_string());
            docker_args.push("-c".to_string());
            docker_args.push(inner);
        } else {
            return Err(XecError::ContainerNotFound("no container or image configured".to_string()));
        }

        let values: Vec<crate::shell::Value> = docker_args.into_iter().map(crate::shell::Value::from).collect();
        let fragments: Vec<&str> = std::iter::once("docker ").chain(std::iter::repeat(" ").take(values.len())).collect();
        let rendered = crate::shell::render(&fragments, &values, crate::shell::ShellDialect::Posix)?;

        let opts = Options::new();
        Ok(opts.build_from_template(&["", ""], &[crate::shell::raw(rendered)])?)
    }
}

#[async_trait]
impl Adapter for RemoteDockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::RemoteDocker
    }

    async fn execute(&self, cmd: &Command) -> XecResult<ExecResult> {
        self.check_disposed()?;
        let wrapped = self.wrap_docker_command(cmd)?;
        let mut result = self.ssh.execute(&wrapped).await?;
        result.adapter = AdapterKind::RemoteDocker;
        Ok(result)
    }

    async fn stream(&self, cmd: &Command) -> XecResult<StreamHandle> {
        self.check_disposed()?;
        let wrapped = self.wrap_docker_command(cmd)?;
        let mut handle = self.ssh.stream(&wrapped).await?;
        handle.wait = Box::pin(async move {
            let mut result = handle.wait.await?;
            result.adapter = AdapterKind::RemoteDocker;
            Ok(result)
        });
        Ok(StreamHandle { chunks: handle.chunks, wait: handle.wait })
    }

    async fn copy_in(&self, src: &Path, dst: &str, progress: Option<&ProgressFn>) -> XecResult<()> {
        self.check_disposed()?;
        let staged = format!("/tmp/xec-stage-{}", uuid_like());
        self.ssh.copy_in(src, &staged, progress).await?;
        let container = self.docker.container.as_deref().ok_or_else(|| {
            XecError::ContainerNotFound("remote-docker copy requires an existing container".to_string())
        })?;
        let cp_cmd = crate::shell::render(
            &["docker cp ", " ", ":", ""],
            &[
                crate::shell::Value::from(staged.clone()),
                crate::shell::Value::from(container.to_string()),
                crate::shell::Value::from(dst.to_string()),
            ],
            crate::shell::ShellDialect::Posix,
        )?;
        self.ssh.execute(&Command::shell_string(cp_cmd)).await?;
        Ok(())
    }

    async fn copy_out(&self, src: &str, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
        self.check_disposed()?;
        let container = self.docker.container.as_deref().ok_or_else(|| {
            XecError::ContainerNotFound("remote-docker copy requires an existing container".to_string())
        })?;
        let staged = format!("/tmp/xec-stage-{}", uuid_like());
        let cp_cmd = crate::shell::render(
            &["docker cp ", ":", " ", ""],
            &[
                crate::shell::Value::from(container.to_string()),
                crate::shell::Value::from(src.to_string()),
                crate::shell::Value::from(staged.clone()),
            ],
            crate::shell::ShellDialect::Posix,
        )?;
        self.ssh.execute(&Command::shell_string(cp_cmd)).await?;
        self.ssh.copy_out(&staged, dst, progress).await
    }

    async fn dispose(&self) -> XecResult<DisposeReport> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(DisposeReport::clean());
        }
        self.ssh.dispose().await
    }
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    format!("{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ssh::{PoolConfig, SshAuth, SshPool};

    fn adapter(docker: DockerSpec) -> RemoteDockerAdapter {
        let ssh_spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        RemoteDockerAdapter::new(ssh_spec, docker, std::sync::Arc::new(SshPool::new(PoolConfig::default())))
    }

    #[test]
    fn wrap_docker_command_execs_into_an_existing_container() {
        let a = adapter(DockerSpec::container("web-1"));
        let wrapped = a.wrap_docker_command(&Command::shell_string("echo hi")).unwrap();
        assert_eq!(wrapped.display(), "docker 'exec' 'web-1' 'sh' '-c' 'echo hi'");
    }

    #[test]
    fn wrap_docker_command_runs_an_ephemeral_image_with_auto_remove() {
        let a = adapter(DockerSpec::ephemeral("redis:7.2-alpine"));
        let wrapped = a.wrap_docker_command(&Command::shell_string("redis-cli ping")).unwrap();
        assert_eq!(wrapped.display(), "docker 'run' '--rm' 'redis:7.2-alpine' 'sh' '-c' 'redis-cli ping'");
    }

    #[test]
    fn wrap_docker_command_rejects_a_spec_with_neither_container_nor_image() {
        let docker = DockerSpec { container: None, image: None, ..DockerSpec::ephemeral("unused") };
        let a = adapter(docker);
        let err = a.wrap_docker_command(&Command::shell_string("echo hi")).unwrap_err();
        assert!(matches!(err, XecError::ContainerNotFound(_)));
    }
}
