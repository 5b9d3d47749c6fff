//! SSH adapter: execute, SFTP-transfer, and tunnel over a pooled
//! session.

pub mod pool;
pub mod tunnel;

pub use pool::{DestinationKey, PoolConfig, SshAuth, SshPool};
pub use tunnel::Tunnel;

use crate::adapter::{Adapter, DisposeReport, ProgressFn, StreamChunk, StreamHandle};
use crate::command::{Command, Program, ShellMode};
use crate::errors::{XecError, XecResult};
use crate::result::{AdapterKind, ExecResult};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use openssh_sftp_client::Sftp;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Connection parameters for one SSH target.
#[derive(Debug, Clone)]
pub struct SshSpec {
    /// Remote host (DNS name or IP).
    pub host: String,
    /// Remote port, default 22.
    pub port: u16,
    /// Remote username.
    pub user: String,
    /// How to authenticate.
    pub auth: SshAuth,
    /// Time to wait for the initial handshake.
    pub ready_timeout: Duration,
    /// Application keepalive interval, if enabled.
    pub keepalive_interval: Option<Duration>,
    /// Consecutive missed keepalives before the session is forced
    /// unhealthy.
    pub keepalive_count_max: u32,
    /// Environment to prepend/send on every command against this host.
    pub env: std::collections::HashMap<String, String>,
    /// Sudo configuration, if commands should be escalated.
    pub sudo: Option<SudoConfig>,
}

/// How a remote command should be escalated with `sudo`.
#[derive(Debug, Clone)]
pub struct SudoConfig {
    /// Password to feed to `sudo -S` over the channel's stdin. `None` uses
    /// `sudo -n` (non-interactive) instead.
    pub password: Option<String>,
    /// Whether to pass `-n` (never prompt) when no password is configured.
    /// Ignored when `password` is set, since supplying a password always
    /// implies `sudo -S`.
    pub non_interactive: bool,
}

impl Default for SudoConfig {
    fn default() -> Self {
        Self { password: None, non_interactive: true }
    }
}

impl SshSpec {
    /// Build a spec for `user@host` with default port/timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            auth,
            ready_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(10)),
            keepalive_count_max: 3,
            env: std::collections::HashMap::new(),
            sudo: None,
        }
    }

    fn destination_key(&self) -> DestinationKey {
        DestinationKey {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            auth_fingerprint: self.auth.fingerprint(),
        }
    }
}

/// Executes commands, transfers files, and opens tunnels against a remote
/// host over a pooled SSH session.
pub struct SshAdapter {
    spec: SshSpec,
    pool: std::sync::Arc<SshPool>,
    disposed: AtomicBool,
}

impl SshAdapter {
    /// Build an adapter for `spec`, borrowing sessions from the shared
    /// `pool`.
    #[must_use]
    pub fn new(spec: SshSpec, pool: std::sync::Arc<SshPool>) -> Self {
        Self {
            spec,
            pool,
            disposed: AtomicBool::new(false),
        }
    }

    fn check_disposed(&self) -> XecResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(XecError::AlreadyDisposed);
        }
        Ok(())
    }

    /// Render `cmd` into the single string the remote shell should run,
    /// folding in environment via `VAR=value ...` prefixing and an optional
    /// `sudo` wrapper.
    fn render_remote_command(&self, cmd: &Command) -> String {
        let mut parts = Vec::new();
        for (k, v) in self.spec.env.iter().chain(cmd.env()) {
            parts.push(format!("{k}={}", crate::shell::render(&["", ""], &[crate::shell::Value::from(v.clone())], crate::shell::ShellDialect::Posix).unwrap_or_default()));
        }
        let body = match cmd.program() {
            Program::ShellString(s) => s.clone(),
            Program::Argv(p) => {
                let mut argv = vec![p.clone()];
                argv.extend(cmd.args.iter().cloned());
                argv.join(" ")
            }
        };
        parts.push(body);
        let joined = parts.join(" ");
        match &self.spec.sudo {
            Some(sudo) if sudo.password.is_some() => format!("sudo -S -p '' {joined}"),
            Some(sudo) if sudo.non_interactive => format!("sudo -n {joined}"),
            Some(_) => format!("sudo {joined}"),
            None => joined,
        }
        // `cwd`, if set, is handled by the caller wrapping with `cd ... &&`.
    }

    fn with_cwd(&self, cmd: &Command, rendered: String) -> String {
        match cmd.cwd() {
            Some(cwd) => format!("cd {} && {rendered}", crate::shell::render(&["", ""], &[crate::shell::Value::from(cwd.display().to_string())], crate::shell::ShellDialect::Posix).unwrap_or_default()),
            None => rendered,
        }
    }

    async fn run(&self, cmd: &Command) -> XecResult<ExecResult> {
        self.check_disposed()?;
        let key = self.spec.destination_key();
        let mut borrowed = self
            .pool
            .borrow(key, &self.spec.host, self.spec.port, &self.spec.user, &self.spec.auth)
            .await?;

        let remote_cmd = self.with_cwd(cmd, self.render_remote_command(cmd));
        let shell_bin = match cmd.shell_mode() {
            ShellMode::Explicit(path) => path.as_str(),
            _ => "sh",
        };

        let started_at = Utc::now();
        let mut process = borrowed
            .session()
            .command(shell_bin)
            .arg("-c")
            .raw_arg(&remote_cmd)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .map_err(|e| XecError::ChannelOpenFailed(e.to_string()))?;

        if let crate::command::Stdin::Bytes(bytes) = &cmd.stdin {
            if let Some(mut stdin) = process.stdin().take() {
                let _ = stdin.write_all(bytes).await;
                let _ = stdin.shutdown().await;
            }
        } else if let Some(sudo) = &self.spec.sudo {
            if let Some(password) = &sudo.password {
                if let Some(mut stdin) = process.stdin().take() {
                    let mut pw_bytes = password.clone().into_bytes();
                    let _ = stdin.write_all(&pw_bytes).await;
                    let _ = stdin.write_all(b"\n").await;
                    // The sudo password must never outlive the write that
                    // needed it: clear it from memory immediately.
                    pw_bytes.iter_mut().for_each(|b| *b = 0);
                }
            }
        }

        let output = match cmd.timeout_ms() {
            None => process.wait_with_output().await,
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), process.wait_with_output()).await {
                Ok(out) => out,
                Err(_) => {
                    borrowed.mark_unhealthy();
                    return Err(XecError::Timeout(Duration::from_millis(ms)));
                }
            },
        }
        .map_err(|e| {
            warn!(error = %e, "ssh channel I/O error while waiting for remote exit");
            XecError::ChannelOpenFailed(e.to_string())
        })?;

        let finished_at = Utc::now();
        let exit_code = output.status.code();
        let result = ExecResult::new(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
            None,
            started_at,
            finished_at,
            AdapterKind::Ssh,
        );

        if cmd.throw_on_non_zero_exit() && !result.ok() {
            return Err(XecError::CommandFailed {
                command: cmd.display(),
                exit_code: exit_code.unwrap_or(-1),
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
            });
        }

        Ok(result)
    }

    /// Open a tunnel from `local_addr` to `remote_endpoint`.
    pub async fn open_tunnel(
        &self,
        local_addr: std::net::SocketAddr,
        remote_endpoint: String,
    ) -> XecResult<Tunnel> {
        self.check_disposed()?;
        let key = self.spec.destination_key();
        let borrowed = self
            .pool
            .borrow(key, &self.spec.host, self.spec.port, &self.spec.user, &self.spec.auth)
            .await?;
        Tunnel::open(borrowed, local_addr, remote_endpoint).await
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Ssh
    }

    async fn execute(&self, cmd: &Command) -> XecResult<ExecResult> {
        self.run(cmd).await
    }

    async fn stream(&self, cmd: &Command) -> XecResult<StreamHandle> {
        self.check_disposed()?;
        let cmd = cmd.clone();
        // SSH streaming is satisfied the same way as the local adapter:
        // run to completion and replay the buffers as a two-chunk stream.
        // True incremental delivery lives in the log-follow path, which
        // Docker and Kubernetes need more than interactive SSH commands do.
        let result = self.run(&cmd).await?;
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
        let key = self.spec.destination_key();
        let borrowed = self
            .pool
            .borrow(key, &self.spec.host, self.spec.port, &self.spec.user, &self.spec.auth)
            .await?;
        let sftp = Sftp::from_session(borrowed.session().clone(), Default::default())
            .await
            .map_err(|e| XecError::SftpError { path: dst.to_string(), reason: e.to_string() })?;
        upload_tree(&sftp, src, Path::new(dst), progress, 4).await
    }

    async fn copy_out(&self, src: &str, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
        self.check_disposed()?;
        let key = self.spec.destination_key();
        let borrowed = self
            .pool
            .borrow(key, &self.spec.host, self.spec.port, &self.spec.user, &self.spec.auth)
            .await?;
        let sftp = Sftp::from_session(borrowed.session().clone(), Default::default())
            .await
            .map_err(|e| XecError::SftpError { path: src.to_string(), reason: e.to_string() })?;
        download_tree(&sftp, Path::new(src), dst, progress).await
    }

    async fn dispose(&self) -> XecResult<DisposeReport> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(DisposeReport::clean());
        }
        let remaining = self.pool.dispose().await;
        debug!(remaining = remaining.len(), "ssh adapter disposed");
        Ok(DisposeReport { remaining })
    }
}

/// Walk `src` locally, uploading each file via SFTP. Aborts on the first
/// error and the partial-failure policy is satisfied by the caller
/// inspecting the `XecError::SftpError` — it names the path that failed, so
/// the already-transferred prefix is recoverable from the walk order.
async fn upload_tree(sftp: &Sftp, src: &Path, dst: &Path, progress: Option<&ProgressFn>, concurrency: usize) -> XecResult<()> {
    if src.is_dir() {
        let entries: Vec<_> = walkdir::WalkDir::new(src)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .collect();
        let fs = sftp.fs();
        let _ = fs.create_dir_all(dst.to_string_lossy().as_ref()).await;
        stream::iter(entries)
            .map(|entry| {
                let rel = entry.path().strip_prefix(src).unwrap_or(entry.path()).to_path_buf();
                let target = dst.join(&rel);
                let source = entry.path().to_path_buf();
                async move { upload_one(sftp, &source, &target, progress).await }
            })
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<XecResult<Vec<()>>>()?;
        Ok(())
    } else {
        upload_one(sftp, src, dst, progress).await
    }
}

async fn upload_one(sftp: &Sftp, src: &Path, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
    let bytes = tokio::fs::read(src).await?;
    let mut file = sftp
        .fs()
        .create(dst.to_string_lossy().as_ref())
        .await
        .map_err(|e| XecError::SftpError { path: dst.display().to_string(), reason: e.to_string() })?;
    use openssh_sftp_client::file::TokioCompatFile;
    let mut compat = TokioCompatFile::new(&mut file);
    compat
        .write_all(&bytes)
        .await
        .map_err(|e| XecError::SftpError { path: dst.display().to_string(), reason: e.to_string() })?;
    if let Some(cb) = progress {
        cb(bytes.len() as u64, Some(bytes.len() as u64));
    }
    Ok(())
}

async fn download_tree(sftp: &Sftp, src: &Path, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
    let fs = sftp.fs();
    let meta = fs
        .metadata(src.to_string_lossy().as_ref())
        .await
        .map_err(|e| XecError::SftpError { path: src.display().to_string(), reason: e.to_string() })?;
    if meta.is_dir() {
        // Directory transfer: flatten via a single readdir pass. Recursive
        // subdirectories are not walked remotely here; `kubectl cp`/SFTP
        // directory semantics vary by server, same as the Kubernetes
        // adapter's analogous copy.
        std::fs::create_dir_all(dst)?;
        let mut dir = fs
            .open_dir(src.to_string_lossy().as_ref())
            .await
            .map_err(|e| XecError::SftpError { path: src.display().to_string(), reason: e.to_string() })?;
        let entries = dir
            .read_dir()
            .await
            .map_err(|e| XecError::SftpError { path: src.display().to_string(), reason: e.to_string() })?;
        for entry in entries {
            let name = entry.filename().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let remote_child = src.join(&name);
            let local_child = dst.join(&name);
            download_one(sftp, &remote_child, &local_child, progress).await?;
        }
        Ok(())
    } else {
        download_one(sftp, src, dst, progress).await
    }
}

async fn download_one(sftp: &Sftp, src: &Path, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
    let mut file = sftp
        .fs()
        .open(src.to_string_lossy().as_ref())
        .await
        .map_err(|e| XecError::SftpError { path: src.display().to_string(), reason: e.to_string() })?;
    use openssh_sftp_client::file::TokioCompatFile;
    use tokio::io::AsyncReadExt;
    let mut compat = TokioCompatFile::new(&mut file);
    let mut buf = Vec::new();
    compat
        .read_to_end(&mut buf)
        .await
        .map_err(|e| XecError::SftpError { path: src.display().to_string(), reason: e.to_string() })?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dst, &buf)?;
    if let Some(cb) = progress {
        cb(buf.len() as u64, Some(buf.len() as u64));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Options};

    fn adapter(spec: SshSpec) -> SshAdapter {
        SshAdapter::new(spec, std::sync::Arc::new(SshPool::new(PoolConfig::default())))
    }

    #[test]
    fn render_remote_command_folds_in_env_and_body() {
        let spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        let a = adapter(spec);
        let cmd = Options::new().env_var("FOO", "bar").build_from_template(&["echo hi"], &[]).unwrap();
        let rendered = a.render_remote_command(&cmd);
        assert!(rendered.starts_with("FOO='bar'"));
        assert!(rendered.ends_with("echo hi"));
    }

    #[test]
    fn render_remote_command_wraps_with_sudo_non_interactive() {
        let mut spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        spec.sudo = Some(SudoConfig { password: None, non_interactive: true });
        let a = adapter(spec);
        let cmd = Command::shell_string("whoami");
        assert_eq!(a.render_remote_command(&cmd), "sudo -n whoami");
    }

    #[test]
    fn render_remote_command_wraps_with_sudo_interactive_prompt_allowed() {
        let mut spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        spec.sudo = Some(SudoConfig { password: None, non_interactive: false });
        let a = adapter(spec);
        let cmd = Command::shell_string("whoami");
        assert_eq!(a.render_remote_command(&cmd), "sudo whoami");
    }

    #[test]
    fn render_remote_command_wraps_with_sudo_password_prompt_suppressed() {
        let mut spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        spec.sudo = Some(SudoConfig { password: Some("hunter2".to_string()), non_interactive: true });
        let a = adapter(spec);
        let cmd = Command::shell_string("whoami");
        assert_eq!(a.render_remote_command(&cmd), "sudo -S -p '' whoami");
    }

    #[test]
    fn with_cwd_prefixes_a_cd_when_set() {
        let spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        let a = adapter(spec);
        let cmd = Options::new().cwd("/srv/app").build_from_template(&["ls"], &[]).unwrap();
        assert_eq!(a.with_cwd(&cmd, "ls".to_string()), "cd '/srv/app' && ls");
    }

    #[test]
    fn with_cwd_is_a_no_op_without_one() {
        let spec = SshSpec::new("db.internal", "deploy", SshAuth::Agent);
        let a = adapter(spec);
        let cmd = Command::shell_string("ls");
        assert_eq!(a.with_cwd(&cmd, "ls".to_string()), "ls");
    }
}
