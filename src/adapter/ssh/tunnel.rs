//! Port forwarding over an SSH session.

use crate::adapter::ssh::pool::Borrowed;
use crate::errors::{XecError, XecResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// How long `close()` waits for in-flight bridged connections to drain
/// before forcing the listener closed.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// An active local↔remote port forward. The tunnel owns its local
/// listener and bridges each accepted connection to the remote endpoint
/// itself, rather than delegating to the system `ssh` binary's own `-L`
/// forwarding, so it can report real per-direction byte counts.
///
/// `close()` stops accepting and drains in-flight connections up to
/// [`DRAIN_GRACE`] before aborting stragglers. Dropping the tunnel without
/// calling `close()` stops accepting immediately but does not wait for a
/// drain, since `Drop` cannot await.
pub struct Tunnel {
    local_addr: SocketAddr,
    remote_endpoint: String,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    drain_notify: Arc<Notify>,
    inflight: Arc<AtomicUsize>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    accept_task: tokio::task::JoinHandle<()>,
    connections: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl Tunnel {
    /// Bind a local listener and forward accepted connections to
    /// `remote_endpoint` (`host:port`) through `borrowed`'s session.
    /// `local_addr`'s port `0` requests dynamic allocation.
    pub async fn open(borrowed: Borrowed, local_addr: SocketAddr, remote_endpoint: String) -> XecResult<Self> {
        let listener = TcpListener::bind(local_addr)
            .await
            .map_err(|e| XecError::TunnelError(format!("failed to bind local listener on {local_addr}: {e}")))?;
        let actual_addr = listener.local_addr().unwrap_or(local_addr);

        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());
        let drain_notify = Arc::new(Notify::new());
        let inflight = Arc::new(AtomicUsize::new(0));
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));
        let connections = Arc::new(Mutex::new(Vec::new()));

        // Holding the borrowed session for as long as any task below keeps
        // a clone of it alive returns it to the pool only once the
        // listener and every bridged connection have gone away.
        let session = Arc::new(borrowed);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            session,
            remote_endpoint.clone(),
            closed.clone(),
            close_notify.clone(),
            drain_notify.clone(),
            inflight.clone(),
            bytes_sent.clone(),
            bytes_received.clone(),
            connections.clone(),
        ));

        debug!(%actual_addr, %remote_endpoint, "opened ssh tunnel");
        Ok(Self {
            local_addr: actual_addr,
            remote_endpoint,
            closed,
            close_notify,
            drain_notify,
            inflight,
            bytes_sent,
            bytes_received,
            accept_task,
            connections,
        })
    }

    /// The local address the tunnel is bound to (useful after a dynamic
    /// `:0` bind to learn the assigned port).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The remote endpoint this tunnel forwards to.
    #[must_use]
    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    /// Bytes forwarded local→remote so far.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes forwarded remote→local so far.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Whether the tunnel has been closed (explicitly or because its owning
    /// session was evicted).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections and tear the forward down, waiting up
    /// to [`DRAIN_GRACE`] for bridged connections to finish before aborting
    /// any still running.
    pub async fn close(self) -> XecResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(XecError::TunnelClosed);
        }
        self.close_notify.notify_waiters();
        self.accept_task.abort();

        if self.inflight.load(Ordering::SeqCst) > 0 {
            let _ = tokio::time::timeout(DRAIN_GRACE, self.drain_notify.notified()).await;
        }

        let mut handles = self.connections.lock().await;
        for handle in handles.drain(..) {
            if !handle.is_finished() {
                handle.abort();
            }
        }
        Ok(())
    }

    /// Fail fast if the tunnel is no longer usable.
    pub fn ensure_open(&self) -> XecResult<()> {
        if self.is_closed() {
            warn!("operation attempted on a closed tunnel");
            return Err(XecError::TunnelClosed);
        }
        Ok(())
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
            self.accept_task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    session: Arc<Borrowed>,
    remote_endpoint: String,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    drain_notify: Arc<Notify>,
    inflight: Arc<AtomicUsize>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    connections: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
) {
    loop {
        tokio::select! {
            _ = close_notify.notified() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept tunnel connection");
                        continue;
                    }
                };
                if closed.load(Ordering::SeqCst) {
                    return;
                }

                inflight.fetch_add(1, Ordering::SeqCst);
                let session = session.clone();
                let remote_endpoint = remote_endpoint.clone();
                let bytes_sent = bytes_sent.clone();
                let bytes_received = bytes_received.clone();
                let inflight_done = inflight.clone();
                let drain_notify = drain_notify.clone();
                let handle = tokio::spawn(async move {
                    if let Err(e) = bridge(&session, stream, &remote_endpoint, &bytes_sent, &bytes_received).await {
                        debug!(%peer, error = %e, "tunnel connection ended with an error");
                    }
                    if inflight_done.fetch_sub(1, Ordering::SeqCst) == 1 {
                        drain_notify.notify_one();
                    }
                });
                connections.lock().await.push(handle);
            }
        }
    }
}

/// Bridge one accepted local connection to `remote_endpoint` through
/// `borrowed`'s session.
///
/// `openssh::Session` multiplexes over the system `ssh` binary's own
/// control socket and exposes no raw direct-tcpip channel API, only
/// remote command execution — so each connection is proxied through a
/// remote `nc host port`, the same recipe OpenSSH's own manual describes
/// for jump hosts (`ProxyCommand ssh gateway nc %h %p`).
async fn bridge(
    borrowed: &Borrowed,
    local: TcpStream,
    remote_endpoint: &str,
    bytes_sent: &AtomicU64,
    bytes_received: &AtomicU64,
) -> XecResult<()> {
    let (host, port) = remote_endpoint
        .rsplit_once(':')
        .ok_or_else(|| XecError::TunnelError(format!("invalid remote endpoint '{remote_endpoint}'")))?;

    let mut remote = borrowed
        .session()
        .command("nc")
        .arg(host)
        .arg(port)
        .stdin(openssh::Stdio::piped())
        .stdout(openssh::Stdio::piped())
        .stderr(openssh::Stdio::piped())
        .spawn()
        .await
        .map_err(|e| XecError::ChannelOpenFailed(e.to_string()))?;

    let mut remote_stdin = remote
        .stdin()
        .take()
        .ok_or_else(|| XecError::ChannelOpenFailed("remote proxy stdin unavailable".to_string()))?;
    let mut remote_stdout = remote
        .stdout()
        .take()
        .ok_or_else(|| XecError::ChannelOpenFailed("remote proxy stdout unavailable".to_string()))?;
    if let Some(mut remote_stderr) = remote.stderr().take() {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut remote_stderr, &mut tokio::io::sink()).await;
        });
    }

    let (mut local_read, mut local_write) = local.into_split();

    let upload = async {
        let n = tokio::io::copy(&mut local_read, &mut remote_stdin).await?;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut remote_stdin).await;
        Ok::<u64, std::io::Error>(n)
    };
    let download = tokio::io::copy(&mut remote_stdout, &mut local_write);

    let (sent, received) = tokio::try_join!(upload, download).map_err(|e| XecError::TunnelError(e.to_string()))?;
    bytes_sent.fetch_add(sent, Ordering::Relaxed);
    bytes_received.fetch_add(received, Ordering::Relaxed);

    let _ = remote.wait().await;
    Ok(())
}

