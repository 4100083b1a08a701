//! Bounded connection pool with fair waiters and background health sweeps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    action::{Action, ActionResponse},
    config::{BalanceStrategy, ManagerConfig},
    connection::{AmiEventStream, ManagerConnection},
    error::{AmiError, AmiResult},
};

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Healthy and available for acquisition.
    Idle,
    /// Checked out by a caller.
    InUse,
    /// Failed; awaiting recycling.
    Error,
    /// Closed. Terminal.
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Idle => "idle",
            ConnectionState::InUse => "in_use",
            ConnectionState::Error => "error",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A connection plus its pool bookkeeping.
#[derive(Debug)]
pub struct PooledConnection {
    id: Uuid,
    connection: ManagerConnection,
    state: ConnectionState,
    created_at: Instant,
    last_used: Instant,
    consecutive_failures: u32,
    total_requests: u64,
}

impl PooledConnection {
    fn new(connection: ManagerConnection) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            connection,
            state: ConnectionState::Idle,
            created_at: now,
            last_used: now,
            consecutive_failures: 0,
            total_requests: 0,
        }
    }

    /// Pool-assigned connection id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether this connection must be recycled instead of reused.
    fn should_recycle(&self, config: &ManagerConfig) -> bool {
        !self.connection.is_connected()
            || self.state == ConnectionState::Error
            || self.created_at.elapsed() > config.pool.max_connection_age
            || self.consecutive_failures >= config.pool.max_consecutive_failures
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            state: self.state,
            age: self.created_at.elapsed(),
            idle_for: self.last_used.elapsed(),
            consecutive_failures: self.consecutive_failures,
            total_requests: self.total_requests,
        }
    }
}

/// Snapshot of one connection's bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Pool-assigned id.
    pub id: Uuid,
    /// State at snapshot time.
    pub state: ConnectionState,
    /// Time since the connection was established.
    pub age: Duration,
    /// Time since the connection last carried a request.
    pub idle_for: Duration,
    /// Failures since the last successful request.
    pub consecutive_failures: u32,
    /// Requests carried over the connection's lifetime.
    pub total_requests: u64,
}

/// Point-in-time pool statistics, readable without the pool lock.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections currently open or being opened.
    pub total: usize,
    /// Connections available for acquisition.
    pub idle: usize,
    /// Connections checked out.
    pub in_use: usize,
    /// Callers blocked waiting for a connection.
    pub waiting: usize,
    /// Connections created over the pool's lifetime.
    pub created_total: u64,
    /// Connections retired by health, age, or failure checks.
    pub recycled_total: u64,
    /// Connections closed over the pool's lifetime, including at
    /// shutdown.
    pub destroyed_total: u64,
    /// Successful acquisitions.
    pub acquired_total: u64,
    /// Acquisitions that timed out.
    pub acquire_timeouts: u64,
    /// Connection attempts that failed.
    pub create_failures: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<PooledConnection>,
}

/// State guarded by the pool mutex.
struct PoolCore {
    idle: Vec<PooledConnection>,
    waiters: VecDeque<Waiter>,
    /// Open connections plus reserved creation slots. Never exceeds
    /// `pool.max_size`.
    total: usize,
    rr_cursor: usize,
    next_waiter_id: u64,
}

struct PoolInner {
    config: ManagerConfig,
    core: Mutex<PoolCore>,
    shutdown: AtomicBool,
    /// New connections' event streams go here when a processor is
    /// attached; otherwise they are drained and discarded.
    stream_tx: Option<mpsc::UnboundedSender<AmiEventStream>>,
    maintenance: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,

    // Stats mirrors, readable without the core lock.
    total_count: AtomicUsize,
    idle_count: AtomicUsize,
    in_use_count: AtomicUsize,
    waiting_count: AtomicUsize,
    created_total: AtomicU64,
    recycled_total: AtomicU64,
    destroyed_total: AtomicU64,
    acquired_total: AtomicU64,
    acquire_timeouts: AtomicU64,
    create_failures: AtomicU64,
}

/// Bounded pool of authenticated manager connections.
///
/// `acquire` hands out idle connections first, creates new ones while
/// below `max_size`, and otherwise queues the caller FIFO until a
/// connection is released or the acquire timeout elapses.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Build a pool, warm it to `min_size`, and start the maintenance
    /// task.
    ///
    /// Warm-up tolerates a total outage: handshake failures are logged
    /// and the pool is still constructed, to be replenished by the
    /// maintenance sweep once the server comes back.
    pub async fn new(config: ManagerConfig) -> AmiResult<Self> {
        Self::with_event_sink(config, None).await
    }

    /// Like [`new`](Self::new), but forwards each new connection's event
    /// stream to `stream_tx` (used by the event processor).
    pub async fn with_event_sink(
        config: ManagerConfig,
        stream_tx: Option<mpsc::UnboundedSender<AmiEventStream>>,
    ) -> AmiResult<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            core: Mutex::new(PoolCore {
                idle: Vec::with_capacity(config.pool.max_size),
                waiters: VecDeque::new(),
                total: 0,
                rr_cursor: 0,
                next_waiter_id: 0,
            }),
            shutdown: AtomicBool::new(false),
            stream_tx,
            maintenance: parking_lot::Mutex::new(None),
            total_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            in_use_count: AtomicUsize::new(0),
            waiting_count: AtomicUsize::new(0),
            created_total: AtomicU64::new(0),
            recycled_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
            acquired_total: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            create_failures: AtomicU64::new(0),
            config,
        });

        let pool = Self { inner };
        pool.warm_up().await;
        pool.start_maintenance();
        Ok(pool)
    }

    async fn warm_up(&self) {
        let min = self.inner.config.pool.min_size;
        for _ in 0..min {
            if !self.inner.reserve_slot().await {
                break;
            }
            match self.inner.create_connection().await {
                Ok(conn) => {
                    let mut core = self.inner.core.lock().await;
                    self.inner.idle_count.fetch_add(1, Ordering::Relaxed);
                    core.idle.push(conn);
                }
                Err(e) => {
                    warn!("Warm-up connection failed: {}", e);
                    self.inner.unreserve_slot().await;
                    break;
                }
            }
        }
        info!(
            idle = self.inner.idle_count.load(Ordering::Relaxed),
            min, "Pool warm-up complete"
        );
    }

    fn start_maintenance(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(inner.config.pool.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if inner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                inner.cleanup().await;
            }
        });
        *self.inner.maintenance.lock() = Some(handle);
    }

    /// Acquire a connection with the configured acquire timeout.
    pub async fn acquire(&self) -> AmiResult<PoolGuard> {
        self.acquire_with_timeout(self.inner.config.pool.acquire_timeout)
            .await
    }

    /// Acquire a connection, waiting at most `acquire_timeout`.
    pub async fn acquire_with_timeout(&self, acquire_timeout: Duration) -> AmiResult<PoolGuard> {
        if self.inner.is_shutdown() {
            return Err(AmiError::PoolShutdown);
        }

        // Fast path: an idle connection or free capacity.
        let waiter_rx = {
            let mut core = self.inner.core.lock().await;

            if let Some(conn) = self.inner.take_idle(&mut core) {
                return Ok(self.guard(conn));
            }

            if core.total < self.inner.config.pool.max_size {
                core.total += 1;
                self.inner.total_count.store(core.total, Ordering::Relaxed);
                drop(core);
                return match self.inner.create_connection().await {
                    Ok(mut conn) => {
                        conn.state = ConnectionState::InUse;
                        self.inner.in_use_count.fetch_add(1, Ordering::Relaxed);
                        self.inner.acquired_total.fetch_add(1, Ordering::Relaxed);
                        Ok(self.guard_raw(conn))
                    }
                    Err(e) => {
                        self.inner.unreserve_slot().await;
                        Err(e)
                    }
                };
            }

            // At capacity: join the FIFO waiter queue.
            let (tx, rx) = oneshot::channel();
            let id = core.next_waiter_id;
            core.next_waiter_id += 1;
            core.waiters.push_back(Waiter { id, tx });
            self.inner
                .waiting_count
                .store(core.waiters.len(), Ordering::Relaxed);
            (id, rx)
        };

        let (waiter_id, mut rx) = waiter_rx;
        match timeout(acquire_timeout, &mut rx).await {
            Ok(Ok(conn)) => Ok(self.guard_raw(conn)),
            Ok(Err(_)) => {
                // Sender dropped: pool shut down underneath us.
                Err(if self.inner.is_shutdown() {
                    AmiError::PoolShutdown
                } else {
                    AmiError::PoolExhausted
                })
            }
            Err(_) => {
                self.inner.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                self.inner.abandon_waiter(waiter_id, rx).await;
                Err(AmiError::PoolExhausted)
            }
        }
    }

    fn guard(&self, mut conn: PooledConnection) -> PoolGuard {
        conn.state = ConnectionState::InUse;
        self.inner.in_use_count.fetch_add(1, Ordering::Relaxed);
        self.inner.acquired_total.fetch_add(1, Ordering::Relaxed);
        self.guard_raw(conn)
    }

    /// Wrap a connection already accounted as in-use.
    fn guard_raw(&self, conn: PooledConnection) -> PoolGuard {
        debug!(id = %conn.id, "Connection acquired");
        PoolGuard {
            inner: self.inner.clone(),
            conn: Some(conn),
            failed: false,
        }
    }

    /// Non-blocking statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            total: inner.total_count.load(Ordering::Relaxed),
            idle: inner.idle_count.load(Ordering::Relaxed),
            in_use: inner.in_use_count.load(Ordering::Relaxed),
            waiting: inner.waiting_count.load(Ordering::Relaxed),
            created_total: inner.created_total.load(Ordering::Relaxed),
            recycled_total: inner.recycled_total.load(Ordering::Relaxed),
            destroyed_total: inner.destroyed_total.load(Ordering::Relaxed),
            acquired_total: inner.acquired_total.load(Ordering::Relaxed),
            acquire_timeouts: inner.acquire_timeouts.load(Ordering::Relaxed),
            create_failures: inner.create_failures.load(Ordering::Relaxed),
        }
    }

    /// Per-connection snapshots for connections currently idle in the
    /// pool. Held connections are observable through
    /// [`PoolGuard::connection_stats`].
    pub async fn idle_connection_stats(&self) -> Vec<ConnectionStats> {
        let core = self.inner.core.lock().await;
        core.idle.iter().map(PooledConnection::stats).collect()
    }

    /// Shut the pool down: stop maintenance, fail queued waiters, close
    /// idle connections, and wait up to `grace` for held connections to
    /// come back (they are closed on release).
    pub async fn shutdown(&self, grace: Duration) {
        info!("Pool shutdown requested");
        self.inner.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }

        let idle = {
            let mut core = self.inner.core.lock().await;
            // Dropping the senders fails every queued waiter.
            core.waiters.clear();
            self.inner.waiting_count.store(0, Ordering::Relaxed);
            let idle = std::mem::take(&mut core.idle);
            core.total -= idle.len();
            self.inner.total_count.store(core.total, Ordering::Relaxed);
            self.inner.idle_count.store(0, Ordering::Relaxed);
            idle
        };
        for conn in idle {
            self.inner.destroyed_total.fetch_add(1, Ordering::Relaxed);
            let _ = conn.connection.disconnect().await;
        }

        let deadline = Instant::now() + grace;
        while self.inner.total_count.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!(
            remaining = self.inner.total_count.load(Ordering::Relaxed),
            "Pool shutdown complete"
        );
    }
}

impl PoolInner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Reserve a creation slot if below `max_size`.
    async fn reserve_slot(&self) -> bool {
        let mut core = self.core.lock().await;
        if core.total < self.config.pool.max_size {
            core.total += 1;
            self.total_count.store(core.total, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    async fn unreserve_slot(&self) {
        let mut core = self.core.lock().await;
        core.total -= 1;
        self.total_count.store(core.total, Ordering::Relaxed);
    }

    /// Open and authenticate a new connection. The caller must hold a
    /// reserved slot.
    async fn create_connection(&self) -> AmiResult<PooledConnection> {
        match ManagerConnection::connect(&self.config).await {
            Ok((connection, stream)) => {
                self.route_event_stream(stream);
                self.created_total.fetch_add(1, Ordering::Relaxed);
                let conn = PooledConnection::new(connection);
                debug!(id = %conn.id, "Connection created");
                Ok(conn)
            }
            Err(e) => {
                self.create_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Hand the stream to the processor, or drain it so the connection's
    /// reader task stays alive without a consumer.
    fn route_event_stream(&self, stream: AmiEventStream) {
        let stream = match &self.stream_tx {
            Some(tx) => match tx.send(stream) {
                Ok(()) => return,
                Err(mpsc::error::SendError(stream)) => stream,
            },
            None => stream,
        };
        tokio::spawn(async move {
            let mut stream = stream;
            while stream.recv().await.is_some() {}
        });
    }

    /// Pick and remove one healthy idle connection per the balance
    /// strategy, recycling stale ones found along the way.
    fn take_idle(&self, core: &mut PoolCore) -> Option<PooledConnection> {
        loop {
            if core.idle.is_empty() {
                return None;
            }
            let idx = match self.config.strategy {
                BalanceStrategy::RoundRobin => {
                    let idx = core.rr_cursor % core.idle.len();
                    core.rr_cursor = core.rr_cursor.wrapping_add(1);
                    idx
                }
                BalanceStrategy::LeastRecentlyUsed => core
                    .idle
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.last_used)
                    .map(|(i, _)| i)
                    .unwrap_or(0),
                BalanceStrategy::Random => {
                    use rand::Rng;
                    rand::thread_rng().gen_range(0..core.idle.len())
                }
            };
            let conn = core.idle.remove(idx);
            self.idle_count.store(core.idle.len(), Ordering::Relaxed);
            if conn.should_recycle(&self.config) {
                self.recycle_locked(core, conn);
                continue;
            }
            return Some(conn);
        }
    }

    /// Drop a connection from the pool's accounting and close it in the
    /// background.
    fn recycle_locked(&self, core: &mut PoolCore, mut conn: PooledConnection) {
        conn.state = ConnectionState::Disconnected;
        core.total -= 1;
        self.total_count.store(core.total, Ordering::Relaxed);
        self.recycled_total.fetch_add(1, Ordering::Relaxed);
        self.destroyed_total.fetch_add(1, Ordering::Relaxed);
        debug!(id = %conn.id, "Connection recycled");
        tokio::spawn(async move {
            let _ = conn.connection.disconnect().await;
        });
    }

    /// Return a held connection to the pool.
    async fn release(self: Arc<Self>, mut conn: PooledConnection, failed: bool) {
        conn.last_used = Instant::now();
        if failed {
            conn.consecutive_failures += 1;
            conn.state = ConnectionState::Error;
        }
        self.in_use_count.fetch_sub(1, Ordering::Relaxed);

        if self.is_shutdown() {
            let mut core = self.core.lock().await;
            self.recycle_locked(&mut core, conn);
            return;
        }

        let mut core = self.core.lock().await;
        if conn.should_recycle(&self.config) {
            self.recycle_locked(&mut core, conn);
            let need_for_waiter = !core.waiters.is_empty() && core.total < self.config.pool.max_size;
            let need_for_min = core.total < self.config.pool.min_size;
            if need_for_waiter || need_for_min {
                core.total += 1;
                self.total_count.store(core.total, Ordering::Relaxed);
                drop(core);
                let inner = self.clone();
                tokio::spawn(async move {
                    match inner.create_connection().await {
                        Ok(conn) => inner.offer(conn).await,
                        Err(e) => {
                            warn!("Replacement connection failed: {}", e);
                            inner.unreserve_slot().await;
                        }
                    }
                });
            }
            return;
        }

        conn.consecutive_failures = 0;
        self.offer_locked(&mut core, conn);
    }

    /// Offer a connection to the first live waiter, else park it idle.
    async fn offer(self: &Arc<Self>, conn: PooledConnection) {
        let mut core = self.core.lock().await;
        self.offer_locked(&mut core, conn);
    }

    fn offer_locked(&self, core: &mut PoolCore, mut conn: PooledConnection) {
        while let Some(waiter) = core.waiters.pop_front() {
            self.waiting_count.store(core.waiters.len(), Ordering::Relaxed);
            conn.state = ConnectionState::InUse;
            match waiter.tx.send(conn) {
                Ok(()) => {
                    self.in_use_count.fetch_add(1, Ordering::Relaxed);
                    self.acquired_total.fetch_add(1, Ordering::Relaxed);
                    debug!("Connection handed to waiter");
                    return;
                }
                // Waiter timed out; try the next one.
                Err(returned) => conn = returned,
            }
        }
        conn.state = ConnectionState::Idle;
        core.idle.push(conn);
        self.idle_count.store(core.idle.len(), Ordering::Relaxed);
    }

    /// Remove a timed-out waiter, recovering a connection that raced in
    /// through the handoff path.
    async fn abandon_waiter(
        self: &Arc<Self>,
        waiter_id: u64,
        mut rx: oneshot::Receiver<PooledConnection>,
    ) {
        {
            let mut core = self.core.lock().await;
            if let Some(pos) = core.waiters.iter().position(|w| w.id == waiter_id) {
                core.waiters.remove(pos);
                self.waiting_count.store(core.waiters.len(), Ordering::Relaxed);
                return;
            }
        }
        // Already popped: a handoff may have landed after the timeout.
        if let Ok(conn) = rx.try_recv() {
            self.in_use_count.fetch_sub(1, Ordering::Relaxed);
            self.offer(conn).await;
        }
    }

    /// Health sweep: recycle dead and over-age idle connections, probe
    /// the rest with `Ping`, and top back up to `min_size`.
    async fn cleanup(self: &Arc<Self>) {
        let mut to_probe = Vec::new();
        {
            let mut core = self.core.lock().await;
            let idle = std::mem::take(&mut core.idle);
            for conn in idle {
                if conn.should_recycle(&self.config) {
                    self.recycle_locked(&mut core, conn);
                } else {
                    to_probe.push(conn);
                }
            }
            self.idle_count.store(core.idle.len(), Ordering::Relaxed);
        }

        for mut conn in to_probe {
            match conn.connection.ping().await {
                Ok(()) => {
                    conn.last_used = Instant::now();
                    self.offer(conn).await;
                }
                Err(e) => {
                    debug!(id = %conn.id, "Health probe failed: {}", e);
                    conn.state = ConnectionState::Error;
                    let mut core = self.core.lock().await;
                    self.recycle_locked(&mut core, conn);
                }
            }
        }

        // Top up to the configured floor.
        loop {
            {
                let core = self.core.lock().await;
                if core.total >= self.config.pool.min_size {
                    break;
                }
            }
            if !self.reserve_slot().await {
                break;
            }
            match self.create_connection().await {
                Ok(conn) => self.offer(conn).await,
                Err(e) => {
                    warn!("Replenishment connection failed: {}", e);
                    self.unreserve_slot().await;
                    break;
                }
            }
        }
    }
}

/// Whether a send error makes the connection unsafe to reuse. A server
/// rejection is a completed exchange; every other failure (timeout, I/O,
/// correlation mismatch) may leave a stray reply in flight.
fn poisons_connection(err: &AmiError) -> bool {
    !matches!(err, AmiError::ActionFailed { .. })
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PoolGuard {
    inner: Arc<PoolInner>,
    conn: Option<PooledConnection>,
    failed: bool,
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("id", &self.conn.as_ref().map(|c| c.id))
            .field("failed", &self.failed)
            .finish()
    }
}

impl PoolGuard {
    /// Send an action over the held connection, updating its failure
    /// bookkeeping.
    pub async fn send_action(&mut self, action: &Action) -> AmiResult<ActionResponse> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(AmiError::NotConnected)?;
        match conn.connection.send_action(action).await {
            Ok(response) => {
                conn.total_requests += 1;
                conn.consecutive_failures = 0;
                Ok(response)
            }
            Err(e) => {
                // Anything but a clean server rejection may have left
                // the session desynced, so the connection is recycled
                // on release instead of going back to the idle list.
                if poisons_connection(&e) {
                    self.failed = true;
                }
                Err(e)
            }
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> Option<&ManagerConnection> {
        self.conn.as_ref().map(|c| &c.connection)
    }

    /// Quarantine the connection: it will be recycled on release instead
    /// of returning to the idle list.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Snapshot of the held connection's bookkeeping.
    pub fn connection_stats(&self) -> Option<ConnectionStats> {
        self.conn.as_ref().map(PooledConnection::stats)
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let inner = self.inner.clone();
            let failed = self.failed;
            debug!(id = %conn.id, failed, "Connection released");
            tokio::spawn(async move {
                inner.release(conn, failed).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Idle.to_string(), "idle");
        assert_eq!(ConnectionState::InUse.to_string(), "in_use");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }

    #[test]
    fn test_send_errors_poison_except_server_rejection() {
        assert!(poisons_connection(&AmiError::Timeout { timeout_ms: 300 }));
        assert!(poisons_connection(&AmiError::ConnectionClosed));
        assert!(poisons_connection(&AmiError::protocol_error(
            "reply ActionID mismatch"
        )));
        // A rejected action is a complete exchange; the session is fine.
        assert!(!poisons_connection(&AmiError::ActionFailed {
            message: "Permission denied".into()
        }));
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.acquired_total, 0);
    }
}
