//! The process handle: a lazy, awaitable, cancellable handle over a
//! pending/running command, doubling as the control surface for piping,
//! timeouts, `nothrow`, and retry.
//!
//! The handle's state machine (`NotStarted → Starting → Running →
//! {Completed, Cancelled, Failed}`) is modeled explicitly rather than as a
//! bare `Future`; control methods (`kill`, `timeout`) act on a side channel
//! — here, an `AtomicBool` plus a `Notify` — that survives independently of
//! whether anything has polled the handle yet.

use crate::adapter::Adapter;
use crate::command::{Command, RetryPolicy, Stdin};
use crate::errors::{XecError, XecResult};
use crate::result::ExecResult;
use rand::Rng;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// The handle's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created but not yet driven.
    NotStarted,
    /// A task has been spawned and is about to run the adapter.
    Starting,
    /// The adapter is executing (including retries).
    Running,
    /// Finished successfully (possibly with a non-zero exit under `nothrow`).
    Completed,
    /// Cancelled via `.kill()`.
    Cancelled,
    /// Finished with an error that was not suppressed by `nothrow`.
    Failed,
}

struct Shared {
    cancelled: AtomicBool,
    cancel_notify: Notify,
    state: Mutex<HandleState>,
    join: Mutex<Option<tokio::task::JoinHandle<XecResult<ExecResult>>>>,
    result: Mutex<Option<XecResult<ExecResult>>>,
}

/// The user-facing value returned by every command-producing call.
/// Lazy: the adapter is not invoked until this handle is awaited or driven
/// by one of its control methods.
pub struct ProcessHandle {
    adapter: Arc<dyn Adapter>,
    command: Command,
    retry: Option<RetryPolicy>,
    nothrow: bool,
    quiet: bool,
    shared: Arc<Shared>,
}

impl ProcessHandle {
    /// Build a handle for `command` against `adapter`. Nothing runs yet.
    #[must_use]
    pub fn new(adapter: Arc<dyn Adapter>, command: Command) -> Self {
        let nothrow = !command.throw_on_non_zero_exit();
        Self {
            adapter,
            command,
            retry: None,
            nothrow,
            quiet: false,
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                cancel_notify: Notify::new(),
                state: Mutex::new(HandleState::NotStarted),
                join: Mutex::new(None),
                result: Mutex::new(None),
            }),
        }
    }

    /// Attach a retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Suppress the exception on non-zero exit for this handle only.
    #[must_use]
    pub fn nothrow(mut self) -> Self {
        self.nothrow = true;
        self
    }

    /// Suppress default stdout/stderr mirroring for this handle.
    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Replace the command's timeout (`0` disables it).
    #[must_use]
    pub fn timeout(mut self, ms: u64) -> Self {
        self.command.timeout_ms = if ms == 0 { None } else { Some(ms) };
        self
    }

    /// Supply stdin bytes for the underlying command.
    #[must_use]
    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.command.stdin = Stdin::Bytes(bytes);
        self
    }

    /// The current lifecycle state, without driving the handle.
    pub async fn state(&self) -> HandleState {
        *self.shared.state.lock().await
    }

    /// Start the handle if it has not already been started. Idempotent:
    /// calling this (or awaiting the handle) multiple times reuses the same
    /// spawned task.
    async fn ensure_started(&self) {
        let mut state = self.shared.state.lock().await;
        if *state != HandleState::NotStarted {
            return;
        }
        *state = HandleState::Starting;
        drop(state);

        let adapter = self.adapter.clone();
        let command = self.command.clone();
        let retry = self.retry.clone();
        let nothrow = self.nothrow;
        let shared = self.shared.clone();

        let join = tokio::spawn(async move {
            *shared.state.lock().await = HandleState::Running;
            let outcome = run_with_retry(adapter, command, retry, &shared).await;
            let mut state = shared.state.lock().await;
            *state = match &outcome {
                Ok(_) => HandleState::Completed,
                Err(XecError::Cancelled) => HandleState::Cancelled,
                Err(_) if nothrow => HandleState::Completed,
                Err(_) => HandleState::Failed,
            };
            outcome
        });

        *self.shared.join.lock().await = Some(join);
    }

    /// Await this handle's terminal [`ExecResult`]. Awaiting a completed
    /// handle multiple times replays the exact same value rather than re-running the command.
    pub async fn output(&self) -> XecResult<ExecResult> {
        if let Some(cached) = self.shared.result.lock().await.clone() {
            return cached;
        }
        self.ensure_started().await;
        let join = self.shared.join.lock().await.take();
        let outcome = match join {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(XecError::Cancelled),
                Err(e) => Err(XecError::Unsupported(format!("process task panicked: {e}"))),
            },
            None => {
                // Another caller already consumed the join handle; fall
                // back to the cached slot, waiting briefly for it to land.
                loop {
                    if let Some(cached) = self.shared.result.lock().await.clone() {
                        return cached;
                    }
                    tokio::task::yield_now().await;
                }
            }
        };
        let outcome = match &outcome {
            Err(e) if self.nothrow && !matches!(e, XecError::Cancelled) => {
                warn!(error = %e, "command failed but nothrow suppresses the exception");
                Ok(ExecResult {
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: Some(1),
                    signal: None,
                    duration_ms: 0,
                    started_at: chrono::Utc::now(),
                    finished_at: chrono::Utc::now(),
                    adapter: crate::result::AdapterKind::Local,
                    cause: Some(Arc::new(e.clone())),
                })
            }
            _ => outcome,
        };
        *self.shared.result.lock().await = Some(outcome.clone());
        outcome
    }

    /// Cancel the handle. If it has not started, this is O(1) and the
    /// handle transitions directly to `Cancelled` without ever invoking the
    /// adapter.
    pub async fn kill(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.cancel_notify.notify_waiters();
        let state = *self.shared.state.lock().await;
        if state == HandleState::NotStarted {
            *self.shared.state.lock().await = HandleState::Cancelled;
            *self.shared.result.lock().await = Some(Err(XecError::Cancelled));
            return;
        }
        if let Some(join) = self.shared.join.lock().await.as_ref() {
            join.abort();
        }
    }

    /// Convenience: await and return just the trimmed stdout text.
    ///
    /// # Errors
    /// Propagates the underlying execution error.
    pub async fn text(&self) -> XecResult<String> {
        self.output().await.map(|r| r.text().to_string())
    }

    /// Convenience: await and parse stdout as JSON.
    ///
    /// # Errors
    /// Propagates the underlying execution error, or a JSON parse failure
    /// wrapped as `XecError::Unsupported`.
    pub async fn json<T: serde::de::DeserializeOwned>(&self) -> XecResult<T> {
        let result = self.output().await?;
        result.json().map_err(|e| XecError::Unsupported(format!("invalid JSON output: {e}")))
    }

    /// Schedule `other` to run with this handle's stdout as its stdin
    ///. The resulting handle resolves to `other`'s result;
    /// failure of `self` propagates as `PipelineAborted` carrying `self`'s
    /// exit code.
    pub async fn pipe(self, other: ProcessHandle) -> XecResult<ProcessHandle> {
        let producer_result = self.output().await;
        match producer_result {
            Ok(result) => Ok(other.stdin(result.stdout.into_bytes())),
            Err(_) => {
                let exit_code = self.shared.result.lock().await.as_ref().and_then(|r| r.as_ref().ok()).and_then(|r| r.exit_code);
                Err(XecError::PipelineAborted { producer_exit_code: exit_code })
            }
        }
    }
}

async fn run_with_retry(
    adapter: Arc<dyn Adapter>,
    command: Command,
    retry: Option<RetryPolicy>,
    shared: &Shared,
) -> XecResult<ExecResult> {
    let policy = retry.unwrap_or_default();
    let mut attempt = 1;
    loop {
        if shared.cancelled.load(Ordering::SeqCst) {
            return Err(XecError::Cancelled);
        }
        let outcome = adapter.execute(&command).await;
        match &outcome {
            Ok(_) => return outcome,
            Err(e) if attempt >= policy.max_attempts || !e.is_retryable_by_default() => return outcome,
            Err(e) => {
                debug!(attempt, error = %e, "retrying command");
                let delay = jittered_delay(policy.delay_for_attempt(attempt));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.cancel_notify.notified() => return Err(XecError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

fn jittered_delay(base: std::time::Duration) -> std::time::Duration {
    let mut rng = rand::thread_rng();
    let jittered_ms = rng.gen_range(0..=base.as_millis().max(1) as u64);
    std::time::Duration::from_millis(jittered_ms)
}

impl IntoFuture for ProcessHandle {
    type Output = XecResult<ExecResult>;
    type IntoFuture = futures::future::BoxFuture<'static, XecResult<ExecResult>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.output().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalAdapter;
    use crate::command::Command;

    #[tokio::test]
    async fn awaiting_twice_replays_same_result() {
        let handle = ProcessHandle::new(Arc::new(LocalAdapter::new()), Command::shell_string("echo hi"));
        let first = handle.output().await.unwrap();
        let second = handle.output().await.unwrap();
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.started_at, second.started_at);
    }

    #[tokio::test]
    async fn kill_before_start_is_immediate() {
        let handle = ProcessHandle::new(Arc::new(LocalAdapter::new()), Command::shell_string("sleep 5"));
        handle.kill().await;
        assert_eq!(handle.state().await, HandleState::Cancelled);
        let err = handle.output().await.unwrap_err();
        assert!(matches!(err, XecError::Cancelled));
    }

    #[tokio::test]
    async fn nothrow_suppresses_command_failed() {
        let handle = ProcessHandle::new(Arc::new(LocalAdapter::new()), Command::shell_string("exit 9")).nothrow();
        let result = handle.output().await.unwrap();
        assert!(!result.ok());
        assert!(result.cause.is_some());
    }
}
