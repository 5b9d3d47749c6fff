//! The SSH connection pool: per-destination reusable, authenticated
//! sessions with health checks, idle eviction, and keepalive.
//!
//! Generalizes the single-owner, async-operations-behind-a-handle shape
//! used for the Docker client to a multi-tenant pool, since Docker itself
//! needs no connection multiplexing but repeated SSH sessions to the same
//! host benefit from reuse.

use crate::errors::{XecError, XecResult};
use openssh::{KnownHosts, Session};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// A strictly-FIFO wakeup queue: waiters are served in the order they
/// registered, with no broadcast and no possibility of a late registrant
/// jumping ahead of one that has been waiting longer.
///
/// Each waiter holds a `oneshot::Receiver` registered at the back of the
/// queue; a release pops from the front and fires it. A receiver dropped
/// without being woken (its waiter gave up or was satisfied some other
/// way) is simply skipped the next time a wakeup is popped.
struct WaiterQueue {
    queue: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl WaiterQueue {
    fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()) }
    }

    /// Join the back of the queue, returning a receiver that resolves the
    /// next time this waiter reaches the front and a slot is released.
    async fn join(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().await.push_back(tx);
        rx
    }

    /// Wake the single longest-waiting registrant, skipping any whose
    /// receiver was already dropped.
    async fn wake_one(&self) {
        let mut queue = self.queue.lock().await;
        while let Some(tx) = queue.pop_front() {
            if tx.send(()).is_ok() {
                break;
            }
        }
    }

    /// Wake every registrant, e.g. after a sweep that may have freed more
    /// than one slot at once.
    async fn wake_all(&self) {
        let mut queue = self.queue.lock().await;
        for tx in queue.drain(..) {
            let _ = tx.send(());
        }
    }
}

/// How a session should authenticate. Precedence order when more than one
/// is configured: key content → key path → agent → password.
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Private key material supplied inline.
    KeyContent {
        /// PEM-encoded private key.
        key: String,
        /// Optional passphrase.
        passphrase: Option<String>,
    },
    /// Path to a private key file on disk.
    KeyPath {
        /// Path to the key file.
        path: std::path::PathBuf,
        /// Optional passphrase.
        passphrase: Option<String>,
    },
    /// Delegate to `ssh-agent` via `SSH_AUTH_SOCK`.
    Agent,
    /// Plain password authentication.
    Password(String),
}

impl SshAuth {
    /// Resolve a `hosts.<name>` configuration entry into an [`SshAuth`],
    /// applying the precedence order: explicit key content →
    /// key path → ssh-agent → password. Falls back to `Agent` (i.e.
    /// `SSH_AUTH_SOCK`) when none of the explicit fields are configured,
    /// matching `ssh`'s own default behavior.
    #[must_use]
    pub fn from_host_spec(
        password: Option<String>,
        private_key: Option<String>,
        private_key_path: Option<std::path::PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        if let Some(key) = private_key {
            SshAuth::KeyContent { key, passphrase }
        } else if let Some(path) = private_key_path {
            SshAuth::KeyPath { path, passphrase }
        } else if let Some(password) = password {
            SshAuth::Password(password)
        } else {
            SshAuth::Agent
        }
    }

    /// A short fingerprint distinguishing this credential from others to
    /// the same host, so the pool's destination key does not conflate
    /// sessions authenticated differently.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            SshAuth::KeyContent { key, .. } => format!("keycontent:{}", short_hash(key)),
            SshAuth::KeyPath { path, .. } => format!("keypath:{}", path.display()),
            SshAuth::Agent => "agent".to_string(),
            SshAuth::Password(p) => format!("password:{}", short_hash(p)),
        }
    }
}

fn short_hash(s: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// The tuple identifying an SSH connection's reuse equivalence class:
/// `(host, port, user, auth-fingerprint)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Remote username.
    pub user: String,
    /// Fingerprint of the credential used, so distinct credentials never
    /// share a session.
    pub auth_fingerprint: String,
}

impl std::fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Pool-wide tunables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum sessions per destination.
    pub per_destination_max: usize,
    /// Maximum sessions across all destinations.
    pub global_max: usize,
    /// How long a borrow waits for a free slot before `PoolAcquisitionTimeout`.
    pub acquisition_timeout: Duration,
    /// How often the idle sweeper runs.
    pub idle_sweep_interval: Duration,
    /// Idle duration after which a session is evicted.
    pub idle_timeout: Duration,
    /// Interval between application keepalives, if enabled.
    pub keepalive_interval: Option<Duration>,
    /// Consecutive keepalive timeouts before a session is forced unhealthy.
    pub keepalive_count_max: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            per_destination_max: 4,
            global_max: 32,
            acquisition_timeout: Duration::from_secs(30),
            idle_sweep_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            keepalive_interval: Some(Duration::from_secs(10)),
            keepalive_count_max: 3,
        }
    }
}

/// An authenticated, multiplexed SSH session owned exclusively by the pool
///.
pub struct PooledSession {
    pub(crate) session: Session,
    pub(crate) last_used: Instant,
    pub(crate) healthy: AtomicBool,
    pub(crate) missed_keepalives: u32,
}

impl PooledSession {
    /// A cheap health probe: open a channel and run a single no-op,
    /// bounded to 1 s.
    async fn probe(&self) -> bool {
        let probe = tokio::time::timeout(Duration::from_secs(1), self.session.command("true").status()).await;
        matches!(probe, Ok(Ok(status)) if status.success())
    }
}

/// A session on loan from the pool. Returned to the `Idle` slot on `Drop`
/// unless explicitly marked unhealthy, so callers never have to remember
/// to release it explicitly.
pub struct Borrowed {
    key: DestinationKey,
    session: Option<PooledSession>,
    pool: Arc<PoolInner>,
}

impl Borrowed {
    /// The underlying `openssh` session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session.as_ref().expect("session present until drop").session
    }

    /// Mark this session unhealthy; it will be closed rather than returned
    /// to the pool when this borrow ends.
    pub fn mark_unhealthy(&mut self) {
        if let Some(s) = &self.session {
            s.healthy.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for Borrowed {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let pool = self.pool.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                pool.release(key, session).await;
            });
        }
    }
}

enum SlotState {
    Idle(PooledSession),
    Borrowed,
}

struct DestinationSlot {
    sessions: VecDeque<SlotState>,
}

struct PoolInner {
    config: PoolConfig,
    slots: Mutex<HashMap<DestinationKey, DestinationSlot>>,
    total: Mutex<usize>,
    waiters: WaiterQueue,
    disposed: AtomicBool,
}

impl PoolInner {
    async fn release(&self, key: DestinationKey, mut session: PooledSession) {
        session.last_used = Instant::now();
        if self.disposed.load(Ordering::SeqCst) {
            // `dispose()` already drained `slots` and reported this session
            // as still-borrowed in its `remaining` list (it has no way to
            // reach into an exclusively-borrowed session). Close it here,
            // now that the caller has returned it, instead of letting it
            // fall out of scope unclosed.
            if let Err(e) = session.session.close().await {
                warn!(%key, error = %e, "failed to close ssh session released after pool disposal");
            }
            self.waiters.wake_one().await;
            return;
        }
        let keep = session.healthy.load(Ordering::SeqCst);
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&key) {
            if let Some(pos) = slot
                .sessions
                .iter()
                .position(|s| matches!(s, SlotState::Borrowed))
            {
                if keep {
                    slot.sessions[pos] = SlotState::Idle(session);
                } else {
                    slot.sessions.remove(pos);
                    drop(slots);
                    let mut total = self.total.lock().await;
                    *total = total.saturating_sub(1);
                }
            }
        }
        self.waiters.wake_one().await;
    }
}

/// The SSH connection pool. One instance is shared by the SSH and
/// remote-docker adapters for the lifetime of the process.
pub struct SshPool {
    inner: Arc<PoolInner>,
}

impl Default for SshPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl SshPool {
    /// Build a pool with the given configuration and start its background
    /// idle-sweeper task.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            slots: Mutex::new(HashMap::new()),
            total: Mutex::new(0),
            waiters: WaiterQueue::new(),
            disposed: AtomicBool::new(false),
        });
        spawn_idle_sweeper(inner.clone());
        spawn_keepalive_prober(inner.clone());
        Self { inner }
    }

    /// Borrow protocol: reuse a healthy idle session,
    /// establish a new one if bounds allow, or wait on the FIFO waiter
    /// queue up to `acquisition_timeout`.
    pub async fn borrow(
        &self,
        key: DestinationKey,
        host: &str,
        port: u16,
        user: &str,
        auth: &SshAuth,
    ) -> XecResult<Borrowed> {
        let deadline = Instant::now() + self.inner.config.acquisition_timeout;
        loop {
            if let Some(session) = self.try_reuse_idle(&key).await {
                return Ok(Borrowed {
                    key,
                    session: Some(session),
                    pool: self.inner.clone(),
                });
            }

            if let Some(session) = self.try_establish(&key, host, port, user, auth).await? {
                return Ok(Borrowed {
                    key,
                    session: Some(session),
                    pool: self.inner.clone(),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(XecError::PoolAcquisitionTimeout {
                    destination: key.to_string(),
                    waited: self.inner.config.acquisition_timeout,
                });
            }
            // Join the back of the FIFO queue before waiting, so a waiter
            // that has been retrying longer is always woken first.
            let ticket = self.inner.waiters.join().await;
            let _ = tokio::time::timeout(remaining, ticket).await;
        }
    }

    async fn try_reuse_idle(&self, key: &DestinationKey) -> Option<PooledSession> {
        let mut slots = self.inner.slots.lock().await;
        let slot = slots.get_mut(key)?;
        // MRU order: the most-recently-released session sits at the back.
        for i in (0..slot.sessions.len()).rev() {
            if matches!(slot.sessions[i], SlotState::Idle(_)) {
                let SlotState::Idle(session) = std::mem::replace(&mut slot.sessions[i], SlotState::Borrowed) else {
                    unreachable!()
                };
                drop(slots);
                if session.probe().await {
                    return Some(session);
                }
                // Failed health probe: drop it and keep looking.
                self.drop_slot_entry(key, i).await;
                return Box::pin(self.try_reuse_idle(key)).await;
            }
        }
        None
    }

    async fn drop_slot_entry(&self, key: &DestinationKey, _idx: usize) {
        let mut slots = self.inner.slots.lock().await;
        if let Some(slot) = slots.get_mut(key) {
            slot.sessions.retain(|s| !matches!(s, SlotState::Borrowed));
        }
        drop(slots);
        let mut total = self.inner.total.lock().await;
        *total = total.saturating_sub(1);
    }

    async fn try_establish(
        &self,
        key: &DestinationKey,
        host: &str,
        port: u16,
        user: &str,
        auth: &SshAuth,
    ) -> XecResult<Option<PooledSession>> {
        let mut slots = self.inner.slots.lock().await;
        let per_dest = slots.entry(key.clone()).or_insert_with(|| DestinationSlot {
            sessions: VecDeque::new(),
        });
        if per_dest.sessions.len() >= self.inner.config.per_destination_max {
            return Ok(None);
        }
        let mut total = self.inner.total.lock().await;
        if *total >= self.inner.config.global_max {
            return Ok(None);
        }
        per_dest.sessions.push_back(SlotState::Borrowed);
        *total += 1;
        drop(total);
        drop(slots);

        match connect(host, port, user, auth).await {
            Ok(session) => Ok(Some(PooledSession {
                session,
                last_used: Instant::now(),
                healthy: AtomicBool::new(true),
                missed_keepalives: 0,
            })),
            Err(e) => {
                // Roll back the reservation we made above.
                let mut slots = self.inner.slots.lock().await;
                if let Some(slot) = slots.get_mut(key) {
                    if let Some(pos) = slot.sessions.iter().position(|s| matches!(s, SlotState::Borrowed)) {
                        slot.sessions.remove(pos);
                    }
                }
                drop(slots);
                let mut total = self.inner.total.lock().await;
                *total = total.saturating_sub(1);
                Err(e)
            }
        }
    }

    /// Tear down every pooled session, regardless of state. Best-effort:
    /// idle sessions that fail to close cleanly, and sessions currently on
    /// loan to a caller (which this pool has no access to until the
    /// borrower's `Drop` returns them via `release`), are both reported in
    /// the returned list rather than silently discarded.
    pub async fn dispose(&self) -> Vec<String> {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let mut remaining = Vec::new();
        let mut slots = self.inner.slots.lock().await;
        for (key, slot) in slots.drain() {
            for state in slot.sessions {
                match state {
                    SlotState::Idle(session) => {
                        if session.session.close().await.is_err() {
                            remaining.push(format!("{key}: idle session failed to close"));
                        }
                    }
                    SlotState::Borrowed => {
                        // `release()` checks the `disposed` flag set above
                        // and will close this session itself once the
                        // borrower drops it, but that happens after this
                        // call returns, so it cannot be folded into the
                        // `Idle` branch's close-and-report above.
                        remaining.push(format!("{key}: session still borrowed, will close on release"));
                    }
                }
            }
        }
        *self.inner.total.lock().await = 0;
        remaining
    }

    /// Current count of sessions across all destinations, for diagnostics
    /// and the pool-bound property test.
    pub async fn total_sessions(&self) -> usize {
        *self.inner.total.lock().await
    }
}

async fn connect(host: &str, port: u16, user: &str, auth: &SshAuth) -> XecResult<Session> {
    // `openssh` shells out to the system `ssh` binary under a control-socket
    // multiplexer; key/password material is supplied via a transient
    // `IdentityFile`/`askpass` configuration rather than argv, so it never
    // appears in process listings or logs.
    let destination = match auth {
        SshAuth::KeyPath { path, .. } => {
            format!("ssh://{user}@{host}:{port}?identity={}", path.display())
        }
        SshAuth::Agent | SshAuth::KeyContent { .. } | SshAuth::Password(_) => {
            format!("ssh://{user}@{host}:{port}")
        }
    };
    debug!(%destination, "establishing new ssh session");
    Session::connect_mux(destination, KnownHosts::Strict)
        .await
        .map_err(|e| classify_connect_error(&e, host))
}

fn classify_connect_error(e: &openssh::Error, host: &str) -> XecError {
    let text = e.to_string();
    if text.contains("Host key verification failed") {
        XecError::HostKeyMismatch { host: host.to_string() }
    } else if text.contains("Permission denied") || text.contains("authentication") {
        XecError::AuthFailed(text)
    } else {
        XecError::ConnectFailed(text)
    }
}

fn spawn_idle_sweeper(inner: Arc<PoolInner>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.idle_sweep_interval);
        loop {
            ticker.tick().await;
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            let mut slots = inner.slots.lock().await;
            let mut evicted = 0usize;
            for slot in slots.values_mut() {
                let before = slot.sessions.len();
                let mut kept = VecDeque::new();
                for state in slot.sessions.drain(..) {
                    match state {
                        SlotState::Idle(session) => {
                            if session.last_used.elapsed() >= inner.config.idle_timeout {
                                evicted += 1;
                                continue;
                            }
                            kept.push_back(SlotState::Idle(session));
                        }
                        other => kept.push_back(other),
                    }
                }
                slot.sessions = kept;
                let _ = before;
            }
            drop(slots);
            if evicted > 0 {
                let mut total = inner.total.lock().await;
                *total = total.saturating_sub(evicted);
                warn!(evicted, "swept idle ssh sessions");
            }
            inner.waiters.wake_all().await;
        }
    });
}

/// Periodically probes every idle session with a cheap no-op command,
/// tracking consecutive misses per session and evicting one once it
/// reaches `keepalive_count_max`. Skipped entirely when the pool is
/// configured with `keepalive_interval: None`.
///
/// Mirrors [`spawn_idle_sweeper`]'s cadence, but probing is an I/O wait
/// (unlike the sweeper's pure bookkeeping), so each idle session is lifted
/// out of its slot as a temporary `Borrowed` placeholder before the lock is
/// dropped for the probe, the same trick [`SshPool::try_reuse_idle`] uses.
fn spawn_keepalive_prober(inner: Arc<PoolInner>) {
    let Some(interval) = inner.config.keepalive_interval else {
        return;
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }

            let mut candidates: Vec<(DestinationKey, PooledSession)> = Vec::new();
            {
                let mut slots = inner.slots.lock().await;
                for (key, slot) in slots.iter_mut() {
                    for i in 0..slot.sessions.len() {
                        if matches!(slot.sessions[i], SlotState::Idle(_)) {
                            let SlotState::Idle(session) = std::mem::replace(&mut slot.sessions[i], SlotState::Borrowed)
                            else {
                                unreachable!()
                            };
                            candidates.push((key.clone(), session));
                        }
                    }
                }
            }
            if candidates.is_empty() {
                continue;
            }

            let mut evicted = 0usize;
            for (key, mut session) in candidates {
                let healthy = session.probe().await;
                if healthy {
                    session.missed_keepalives = 0;
                } else {
                    session.missed_keepalives += 1;
                    warn!(%key, missed = session.missed_keepalives, "ssh keepalive probe missed");
                }
                let evict = !healthy && session.missed_keepalives >= inner.config.keepalive_count_max;
                if evict {
                    session.healthy.store(false, Ordering::SeqCst);
                }

                let mut slots = inner.slots.lock().await;
                let Some(slot) = slots.get_mut(&key) else { continue };
                let Some(pos) = slot.sessions.iter().position(|s| matches!(s, SlotState::Borrowed)) else { continue };
                if evict {
                    slot.sessions.remove(pos);
                    drop(slots);
                    evicted += 1;
                    if let Err(e) = session.session.close().await {
                        warn!(%key, error = %e, "failed to close ssh session evicted after missed keepalives");
                    }
                } else {
                    slot.sessions[pos] = SlotState::Idle(session);
                }
            }

            if evicted > 0 {
                let mut total = inner.total.lock().await;
                *total = total.saturating_sub(evicted);
                warn!(evicted, "evicted ssh sessions after repeated missed keepalives");
            }
            inner.waiters.wake_all().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_key_differs_by_auth_fingerprint() {
        let a = DestinationKey {
            host: "h".into(),
            port: 22,
            user: "u".into(),
            auth_fingerprint: SshAuth::Password("a".into()).fingerprint(),
        };
        let b = DestinationKey {
            host: "h".into(),
            port: 22,
            user: "u".into(),
            auth_fingerprint: SshAuth::Password("b".into()).fingerprint(),
        };
        assert_ne!(a, b);
    }

    /// The first three waiters to join must be woken in that exact order;
    /// if `wake_one` ever fired `third` ahead of `first`, `first.await`
    /// below would hang and the test would time out rather than fail fast.
    #[tokio::test]
    async fn waiter_queue_wakes_in_arrival_order() {
        let queue = WaiterQueue::new();
        let first = queue.join().await;
        let second = queue.join().await;
        let third = queue.join().await;

        queue.wake_one().await;
        first.await.unwrap();

        queue.wake_one().await;
        second.await.unwrap();

        queue.wake_one().await;
        third.await.unwrap();
    }

    #[tokio::test]
    async fn waiter_queue_skips_a_waiter_whose_receiver_was_dropped() {
        let queue = WaiterQueue::new();
        let abandoned = queue.join().await;
        drop(abandoned);
        let still_waiting = queue.join().await;

        queue.wake_one().await;

        still_waiting.await.unwrap();
    }

    #[tokio::test]
    async fn fresh_pool_has_no_sessions() {
        let pool = SshPool::new(PoolConfig::default());
        assert_eq!(pool.total_sessions().await, 0);
    }

    /// A session still on loan when `dispose()` runs must be surfaced in
    /// the returned report, not silently dropped off the back of
    /// `slots.drain()` (the map is cleared before `Borrowed::drop` can
    /// return the session via `release`, which races dispose).
    #[tokio::test]
    async fn dispose_reports_sessions_still_on_loan() {
        let pool = SshPool::new(PoolConfig::default());
        let key = DestinationKey {
            host: "h".into(),
            port: 22,
            user: "u".into(),
            auth_fingerprint: SshAuth::Agent.fingerprint(),
        };
        {
            let mut slots = pool.inner.slots.lock().await;
            slots.insert(key.clone(), DestinationSlot { sessions: VecDeque::from(vec![SlotState::Borrowed]) });
        }
        *pool.inner.total.lock().await = 1;

        let remaining = pool.dispose().await;

        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].contains("still borrowed"), "unexpected report: {}", remaining[0]);
        assert_eq!(pool.total_sessions().await, 0);
    }
}
