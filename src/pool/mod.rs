//! Bounded, validated connection pool.
//!
//! Connections are produced by a [`ConnectionFactory`], parked in an idle set
//! when released, and validated both when handed out and when handed back.
//! A semaphore tracks idle availability so acquires block (with a deadline)
//! instead of spinning once the pool is at its ceiling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Produces and validates pooled connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn>;

    /// Cheap liveness check run on hand-out and hand-back
    fn validate(&self, conn: &mut Self::Conn) -> bool;
}

/// Factory for plain TCP connections
pub struct TcpFactory {
    addr: String,
    connect_timeout: Duration,
}

impl TcpFactory {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpFactory {
    type Conn = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::Factory(e.to_string())),
            Err(_) => Err(Error::Factory(format!(
                "connect to {} timed out after {:?}",
                self.addr, self.connect_timeout
            ))),
        }
    }

    fn validate(&self, conn: &mut TcpStream) -> bool {
        conn.peer_addr().is_ok()
    }
}

/// A connection plus its pool bookkeeping.
///
/// Hand it back with [`ConnectionPool::release`] when done; dropping it
/// without releasing leaves its pool slot occupied until the pool is
/// rescaled.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: Uuid,
    inner: C,
    created_at: Instant,
    last_used_at: Instant,
    usage_count: u64,
}

impl<C> PooledConnection<C> {
    fn new(inner: C) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            inner,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }
}

/// Counter snapshot for the pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub max: usize,
    pub peak: usize,
    pub created: u64,
    pub destroyed: u64,
    pub reused: u64,
    pub timeouts: u64,
    pub validation_failures: u64,
    /// active / max
    pub utilization: f64,
    #[serde(with = "humantime_serde")]
    pub average_wait: Duration,
}

/// Narrow control surface the optimization engine drives the pool through
pub trait PoolControl: Send + Sync {
    fn stats(&self) -> PoolStats;
    fn scale(&self, new_max: usize);
    fn max_connections(&self) -> usize;
}

/// Bounded pool of factory-produced connections
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    max: AtomicUsize,
    total: AtomicUsize,
    idle: Mutex<VecDeque<PooledConnection<F::Conn>>>,
    /// Permit count tracks idle-deque occupancy
    idle_available: Arc<Semaphore>,
    closed: AtomicBool,
    created: AtomicU64,
    destroyed: AtomicU64,
    reused: AtomicU64,
    timeouts: AtomicU64,
    validation_failures: AtomicU64,
    peak: AtomicUsize,
    wait_total_micros: AtomicU64,
    wait_samples: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            factory,
            max: AtomicUsize::new(config.max_connections),
            config,
            total: AtomicUsize::new(0),
            idle: Mutex::new(VecDeque::new()),
            idle_available: Arc::new(Semaphore::new(0)),
            closed: AtomicBool::new(false),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
            wait_total_micros: AtomicU64::new(0),
            wait_samples: AtomicU64::new(0),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Take a connection with the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection<F::Conn>> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Take a connection, preferring an idle one, creating below the ceiling,
    /// and otherwise blocking until one is released or the deadline passes
    pub async fn acquire_timeout(
        &self,
        acquire_timeout: Duration,
    ) -> Result<PooledConnection<F::Conn>> {
        let started = Instant::now();
        let deadline = started + acquire_timeout;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::PoolClosed);
            }

            if let Some(mut conn) = self.try_take_idle() {
                if self.factory.validate(&mut conn.inner) {
                    conn.last_used_at = Instant::now();
                    conn.usage_count += 1;
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    self.record_wait(started);
                    return Ok(conn);
                }
                self.validation_failures.fetch_add(1, Ordering::Relaxed);
                self.discard(conn);
                continue;
            }

            if self.reserve_slot() {
                match self.factory.connect().await {
                    Ok(inner) => {
                        let mut conn = PooledConnection::new(inner);
                        conn.usage_count = 1;
                        self.created.fetch_add(1, Ordering::Relaxed);
                        self.note_peak();
                        self.record_wait(started);
                        return Ok(conn);
                    }
                    Err(e) => {
                        self.total.fetch_sub(1, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::AcquireTimeout(acquire_timeout));
            }
            match timeout(remaining, self.idle_available.acquire()).await {
                Ok(Ok(permit)) => {
                    // the matching pop happens on the next loop pass
                    permit.forget();
                    self.idle_available.add_permits(1);
                }
                Ok(Err(_)) => return Err(Error::PoolClosed),
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::AcquireTimeout(acquire_timeout));
                }
            }
        }
    }

    /// Hand a connection back.
    ///
    /// Stale, invalid, or surplus connections are destroyed instead of parked.
    pub fn release(&self, mut conn: PooledConnection<F::Conn>) {
        if self.closed.load(Ordering::SeqCst) {
            self.discard(conn);
            return;
        }
        if !self.factory.validate(&mut conn.inner) {
            self.validation_failures.fetch_add(1, Ordering::Relaxed);
            self.discard(conn);
            return;
        }
        let max_age = self.config.idle_timeout * self.config.idle_retention;
        if conn.created_at.elapsed() > max_age {
            self.discard(conn);
            return;
        }
        if self.total.load(Ordering::SeqCst) > self.max_connections() {
            // ceiling was lowered while this connection was out
            self.discard(conn);
            return;
        }
        conn.last_used_at = Instant::now();
        self.idle.lock().push_back(conn);
        self.idle_available.add_permits(1);
    }

    /// Open `min_connections` eagerly and spawn the idle reaper
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.maintenance_interval;
        self.tasks.lock().push(tokio::spawn(async move {
            pool.prewarm().await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.reap_idle(),
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("pool maintenance stopped");
        }));
        info!(
            max = self.max_connections(),
            min = self.config.min_connections,
            "connection pool started"
        );
    }

    /// Close the pool: reject new acquires, stop maintenance, drop idle
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;

        let drained: Vec<_> = { self.idle.lock().drain(..).collect() };
        let count = drained.len();
        for conn in drained {
            if let Ok(permit) = self.idle_available.try_acquire() {
                permit.forget();
            }
            self.discard(conn);
        }
        info!(drained = count, "connection pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let total = self.total.load(Ordering::SeqCst);
        let max = self.max_connections();
        let active = total.saturating_sub(idle);
        let samples = self.wait_samples.load(Ordering::Relaxed);
        let average_wait = if samples > 0 {
            Duration::from_micros(self.wait_total_micros.load(Ordering::Relaxed) / samples)
        } else {
            Duration::ZERO
        };
        PoolStats {
            active,
            idle,
            total,
            max,
            peak: self.peak.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            utilization: if max > 0 { active as f64 / max as f64 } else { 0.0 },
            average_wait,
        }
    }

    /// Raise or lower the connection ceiling.
    ///
    /// Lowering destroys surplus idle connections immediately; surplus active
    /// ones are destroyed as they come back.
    pub fn scale(&self, new_max: usize) {
        let new_max = new_max.max(1);
        let old = self.max.swap(new_max, Ordering::SeqCst);
        if new_max < old {
            while self.total.load(Ordering::SeqCst) > new_max {
                match self.try_take_idle() {
                    Some(conn) => self.discard(conn),
                    None => break,
                }
            }
        } else if new_max > old {
            // wake acquirers blocked at the old ceiling; their retry pass
            // absorbs the surplus permits
            self.idle_available.add_permits(new_max - old);
        }
        info!(old, new = new_max, "connection pool rescaled");
    }

    pub fn max_connections(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    async fn prewarm(&self) {
        for _ in 0..self.config.min_connections {
            if !self.reserve_slot() {
                break;
            }
            match self.factory.connect().await {
                Ok(inner) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.note_peak();
                    self.idle.lock().push_back(PooledConnection::new(inner));
                    self.idle_available.add_permits(1);
                }
                Err(e) => {
                    self.total.fetch_sub(1, Ordering::SeqCst);
                    warn!(error = %e, "prewarm connect failed");
                }
            }
        }
    }

    fn reap_idle(&self) {
        let mut reaped = Vec::new();
        {
            let mut idle = self.idle.lock();
            let mut index = 0;
            while index < idle.len() {
                let stale = idle[index].last_used_at.elapsed() > self.config.idle_timeout;
                if stale && self.idle_available.try_acquire().map(|p| p.forget()).is_ok() {
                    if let Some(conn) = idle.remove(index) {
                        reaped.push(conn);
                        continue;
                    }
                }
                index += 1;
            }
        }
        if !reaped.is_empty() {
            debug!(reaped = reaped.len(), "reaped idle connections");
        }
        for conn in reaped {
            self.discard(conn);
        }
    }

    fn try_take_idle(&self) -> Option<PooledConnection<F::Conn>> {
        let permit = self.idle_available.try_acquire().ok()?;
        permit.forget();
        self.idle.lock().pop_front()
    }

    /// Claim a slot below the ceiling; false when the pool is full
    fn reserve_slot(&self) -> bool {
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                if total < self.max.load(Ordering::SeqCst) {
                    Some(total + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn discard(&self, conn: PooledConnection<F::Conn>) {
        drop(conn);
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn note_peak(&self) {
        let total = self.total.load(Ordering::SeqCst);
        self.peak.fetch_max(total, Ordering::Relaxed);
    }

    fn record_wait(&self, started: Instant) {
        self.wait_total_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.wait_samples.fetch_add(1, Ordering::Relaxed);
    }
}

impl<F: ConnectionFactory> PoolControl for ConnectionPool<F> {
    fn stats(&self) -> PoolStats {
        ConnectionPool::stats(self)
    }

    fn scale(&self, new_max: usize) {
        ConnectionPool::scale(self, new_max)
    }

    fn max_connections(&self) -> usize {
        ConnectionPool::max_connections(self)
    }
}
