//! Local adapter: spawns a child process of the host OS.
//!
//! Async spawn via `tokio::process`, piped stdio, a timeout wrapped around
//! the wait, and a uniform result shape — generalized to cover argv vs.
//! shell string dispatch, the `SIGTERM`-then-`SIGKILL` escalation ladder,
//! and a buffer-overflow ceiling on captured output.

use crate::adapter::{Adapter, DisposeReport, ProgressFn, StreamChunk, StreamHandle};
use crate::command::{Command, Program, ShellMode, Stdin};
use crate::errors::{XecError, XecResult};
use crate::result::{AdapterKind, ExecResult};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Grace period between `SIGTERM` and `SIGKILL` when a command exceeds its
/// timeout.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Spawns processes on the local host. Stateless beyond its
/// `disposed` flag: there is no pooled resource to release, so `dispose()`
/// exists only to satisfy the uniform [`Adapter`] contract.
#[derive(Debug, Default)]
pub struct LocalAdapter {
    disposed: std::sync::atomic::AtomicBool,
}

impl LocalAdapter {
    /// Construct a new local adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_disposed(&self) -> XecResult<()> {
        if self.disposed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(XecError::AlreadyDisposed);
        }
        Ok(())
    }

    fn build_tokio_command(cmd: &Command) -> XecResult<tokio::process::Command> {
        let mut tc = match (cmd.program(), cmd.shell_mode()) {
            (Program::Argv(program), ShellMode::Direct) => {
                let mut tc = tokio::process::Command::new(program);
                tc.args(&cmd.args);
                tc
            }
            (Program::Argv(program), shell) => {
                // argv form but shell requested: join into a single string
                // and let the shell re-split it.
                let mut parts = vec![program.clone()];
                parts.extend(cmd.args.iter().cloned());
                let joined = parts.join(" ");
                Self::shell_wrapped(shell, &joined)?
            }
            (Program::ShellString(s), ShellMode::Direct) => {
                return Err(XecError::Unsupported(format!(
                    "shell string command {s:?} requires shell mode to be enabled"
                )));
            }
            (Program::ShellString(s), shell) => Self::shell_wrapped(shell, s)?,
        };
        if let Some(cwd) = cmd.cwd() {
            tc.current_dir(cwd);
        }
        for (k, v) in cmd.env() {
            tc.env(k, v);
        }
        Ok(tc)
    }

    fn shell_wrapped(shell: &ShellMode, script: &str) -> XecResult<tokio::process::Command> {
        let shell_bin = match shell {
            ShellMode::Default => default_shell(),
            ShellMode::Explicit(path) => path.clone(),
            ShellMode::Direct => unreachable!("caller only passes Default/Explicit"),
        };
        let mut tc = tokio::process::Command::new(shell_bin);
        tc.arg("-c").arg(script);
        Ok(tc)
    }

    async fn run_to_completion(cmd: &Command) -> XecResult<ExecResult> {
        let started_at = Utc::now();
        let mut tc = Self::build_tokio_command(cmd)?;
        tc.stdin(match cmd.stdin {
            Stdin::Bytes(_) => Stdio::piped(),
            Stdin::Inherit => Stdio::inherit(),
            Stdin::Null => Stdio::null(),
        });
        tc.stdout(Stdio::piped());
        tc.stderr(Stdio::piped());

        debug!(command = %cmd.display(), "spawning local command");
        let mut child = tc.spawn().map_err(|e| XecError::SpawnFailed {
            program: cmd.display(),
            reason: e.to_string(),
        })?;

        if let Stdin::Bytes(bytes) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = bytes.clone();
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&bytes).await {
                        warn!(error = %e, "failed writing to child stdin");
                    }
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let max_buffer = cmd.max_buffer_bytes();
        let wait_fut = Self::collect_output(&mut child, max_buffer);

        let (stdout, stderr, status) = match cmd.timeout_ms() {
            None => wait_fut.await?,
            Some(ms) => match timeout(Duration::from_millis(ms), wait_fut).await {
                Ok(result) => result?,
                Err(_) => {
                    Self::escalate_kill(&mut child).await;
                    return Err(XecError::Timeout(Duration::from_millis(ms)));
                }
            },
        };

        let finished_at = Utc::now();
        let exit_code = status.code();
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal: Option<i32> = None;

        let result = ExecResult::new(stdout, stderr, exit_code, signal, started_at, finished_at, AdapterKind::Local);

        if cmd.throw_on_non_zero_exit() && !result.ok() {
            if let Some(sig) = signal {
                return Err(XecError::KilledBySignal(sig));
            }
            return Err(XecError::CommandFailed {
                command: cmd.display(),
                exit_code: exit_code.unwrap_or(-1),
                stdout: last_lines(&result.stdout, 20),
                stderr: last_lines(&result.stderr, 20),
            });
        }

        Ok(result)
    }

    async fn collect_output(
        child: &mut Child,
        max_buffer: u64,
    ) -> XecResult<(String, String, std::process::ExitStatus)> {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let stdout_task = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                read_capped(pipe, max_buffer).await
            } else {
                Ok(Vec::new())
            }
        };
        let stderr_task = async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                read_capped(pipe, max_buffer).await
            } else {
                Ok(Vec::new())
            }
        };

        let (stdout_res, stderr_res) = tokio::join!(stdout_task, stderr_task);
        stdout_buf.extend(stdout_res?);
        stderr_buf.extend(stderr_res?);

        let status = child.wait().await.map_err(|e| XecError::Io(e.to_string()))?;
        trace!(?status, "local child exited");

        Ok((
            String::from_utf8_lossy(&stdout_buf).into_owned(),
            String::from_utf8_lossy(&stderr_buf).into_owned(),
            status,
        ))
    }

    async fn escalate_kill(child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc_kill(pid as i32, SIGTERM);
                }
                if timeout(KILL_GRACE, child.wait()).await.is_err() {
                    unsafe {
                        libc_kill(pid as i32, SIGKILL);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
const SIGTERM: i32 = 15;
#[cfg(unix)]
const SIGKILL: i32 = 9;

#[cfg(unix)]
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig);
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(reader: &mut R, max_buffer: u64) -> XecResult<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.map_err(|e| XecError::Io(e.to_string()))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() as u64 > max_buffer {
            return Err(XecError::BufferOverflow { limit_bytes: max_buffer });
        }
    }
    Ok(buf)
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= n {
        s.to_string()
    } else {
        lines[lines.len() - n..].join("\n")
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        "cmd".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Local
    }

    async fn execute(&self, cmd: &Command) -> XecResult<ExecResult> {
        self.check_disposed()?;
        Self::run_to_completion(cmd).await
    }

    async fn stream(&self, cmd: &Command) -> XecResult<StreamHandle> {
        self.check_disposed()?;
        // The local adapter buffers eagerly and exposes it as a one-shot
        // stream; true incremental streaming is only load-bearing for the
        // remote substrates' log-follow paths.
        let cmd = cmd.clone();
        let result = Self::run_to_completion(&cmd).await?;
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
        copy_local(src, Path::new(dst), progress)
    }

    async fn copy_out(&self, src: &str, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
        self.check_disposed()?;
        copy_local(Path::new(src), dst, progress)
    }

    async fn dispose(&self) -> XecResult<DisposeReport> {
        self.disposed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(DisposeReport::clean())
    }
}

fn copy_local(src: &Path, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
    if src.is_dir() {
        for entry in walkdir::WalkDir::new(src) {
            let entry = entry.map_err(|e| XecError::SftpError {
                path: src.display().to_string(),
                reason: e.to_string(),
            })?;
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let target = dst.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
                if let Some(cb) = progress {
                    cb(std::fs::metadata(entry.path())?.len(), None);
                }
            }
        }
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = std::fs::copy(src, dst)?;
        if let Some(cb) = progress {
            cb(bytes, Some(bytes));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[tokio::test]
    async fn echo_round_trip() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell_string("echo hello");
        let result = adapter.execute(&cmd).await.unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.ok());
    }

    #[tokio::test]
    async fn non_zero_exit_throws_by_default() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell_string("exit 3");
        let err = adapter.execute(&cmd).await.unwrap_err();
        assert!(matches!(err, XecError::CommandFailed { exit_code: 3, .. }));
    }

    #[tokio::test]
    async fn dispose_rejects_further_use() {
        let adapter = LocalAdapter::new();
        adapter.dispose().await.unwrap();
        let cmd = Command::shell_string("echo hi");
        let err = adapter.execute(&cmd).await.unwrap_err();
        assert!(matches!(err, XecError::AlreadyDisposed));
    }
}
