//! Connection pool.
//!
//! [`Pool`] is generic over [`Connection`]. Idle connections and the
//! counters live behind one mutex that is never held across an await;
//! callers waiting for a free slot park on a [`Notify`] with a deadline of
//! `connection_timeout`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{PoolError, Result};

/// Creates a new, connected connection.
pub type ConnectionFactory<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

// ============================================================================
// Pool state
// ============================================================================

/// An idle connection and when it was last checked in.
struct PoolEntry<C> {
    conn: C,
    last_used: Instant,
}

struct PoolState<C> {
    idle: VecDeque<PoolEntry<C>>,
    /// Checked out (or being created/validated for a caller).
    active: usize,
    /// active + idle
    total: usize,
    closed: bool,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub max_size: usize,
    pub initial_size: usize,
}

struct PoolInner<C> {
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    available: Notify,
    factory: ConnectionFactory<C>,
}

enum Checkout<C> {
    Reuse(C),
    Create,
    Wait,
}

/// A counted slot with no connection behind it yet. Dropping it without
/// [`disarm`](Self::disarm) gives the slot back, so a cancelled acquire or
/// release cannot leak capacity.
struct SlotReservation<'a, C: Connection> {
    inner: &'a PoolInner<C>,
    armed: bool,
}

impl<'a, C: Connection> SlotReservation<'a, C> {
    fn new(inner: &'a PoolInner<C>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Connection> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.forfeit_slot();
        }
    }
}

impl<C: Connection> PoolInner<C> {
    async fn create(&self) -> std::result::Result<C, PoolError> {
        (self.factory)().await.map_err(|e| {
            warn!(error = %e, "Failed to open pooled connection");
            PoolError::Creation(e.to_string())
        })
    }

    /// Give back a slot reserved by `acquire` without a connection.
    fn forfeit_slot(&self) {
        {
            let mut state = self.state.lock();
            state.active -= 1;
            state.total -= 1;
        }
        self.available.notify_one();
    }

    /// Close connections idle past `max_idle_time`, keeping `initial_size`.
    async fn evict_idle(&self) {
        let expired = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < state.idle.len() && state.total > self.config.initial_size {
                if now.duration_since(state.idle[i].last_used) > self.config.max_idle_time {
                    if let Some(entry) = state.idle.remove(i) {
                        state.total -= 1;
                        expired.push(entry.conn);
                    }
                } else {
                    i += 1;
                }
            }
            expired
        };

        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicting idle connections");
        }
        for mut conn in expired {
            let _ = conn.disconnect().await;
        }
    }

    /// Whether discarding one active connection would leave fewer than
    /// `initial_size`.
    fn needs_replacement(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.total <= self.config.initial_size
    }

    /// Check a connection back in, resetting it first. An unhealthy
    /// connection is closed; its slot is refilled with a fresh connection
    /// when the pool would otherwise fall below `initial_size`.
    async fn check_in(&self, mut conn: C) {
        let slot = SlotReservation::new(self);
        let healthy = conn.is_connected() && conn.reset().await.is_ok() && conn.is_connected();
        if healthy {
            slot.disarm();
            self.check_in_ready(conn);
            return;
        }

        debug!("Discarding unhealthy connection on release");
        if conn.is_connected() {
            let _ = conn.disconnect().await;
        }
        drop(conn);

        if self.needs_replacement() {
            if let Ok(fresh) = self.create().await {
                debug!("Replaced discarded connection to keep the pool at its minimum");
                slot.disarm();
                self.check_in_ready(fresh);
            }
        }
    }

    /// Check in a connection that needs no reset. On a closed pool the
    /// connection is dropped and its slot freed.
    fn check_in_ready(&self, conn: C) {
        let discarded = {
            let mut state = self.state.lock();
            state.active -= 1;
            if state.closed {
                state.total -= 1;
                Some(conn)
            } else {
                state.idle.push_back(PoolEntry {
                    conn,
                    last_used: Instant::now(),
                });
                None
            }
        };
        self.available.notify_one();
        drop(discarded);
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A bounded pool of connections shared across tasks and threads.
pub struct Pool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> Pool<C> {
    /// Create a pool whose connections come from [`Connection::open`] and
    /// [`Connection::connect`] on `config.connection_string`.
    pub async fn connect(config: PoolConfig) -> Result<Self> {
        let connection_string = config.connection_string.clone();
        Self::connect_with(config, move || {
            let mut conn = C::open(&connection_string);
            async move {
                conn.connect().await?;
                Ok(conn)
            }
        })
        .await
    }

    /// Create a pool with a custom connection factory.
    pub async fn connect_with<F, Fut>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        config.validate()?;
        let factory: ConnectionFactory<C> = Arc::new(move || factory().boxed());

        let pool = Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.max_size),
                    active: 0,
                    total: 0,
                    closed: false,
                }),
                available: Notify::new(),
                factory,
                config,
            }),
        };

        for _ in 0..pool.inner.config.initial_size {
            let conn = pool.inner.create().await?;
            let mut state = pool.inner.state.lock();
            state.idle.push_back(PoolEntry {
                conn,
                last_used: Instant::now(),
            });
            state.total += 1;
        }

        info!(
            initial_size = pool.inner.config.initial_size,
            max_size = pool.inner.config.max_size,
            "Connection pool ready"
        );
        Ok(pool)
    }

    /// Check out a connection, waiting up to `connection_timeout` for one
    /// to become available.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.connection_timeout;

        loop {
            self.inner.evict_idle().await;

            let notified = self.inner.available.notified();
            let step = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed.into());
                }
                if let Some(entry) = state.idle.pop_back() {
                    state.active += 1;
                    Checkout::Reuse(entry.conn)
                } else if state.total < config.max_size {
                    state.total += 1;
                    state.active += 1;
                    Checkout::Create
                } else {
                    Checkout::Wait
                }
            };

            match step {
                Checkout::Reuse(conn) => {
                    // Guarded before validating, so a cancelled checkout
                    // still returns the connection.
                    return self.checked(self.guard(conn)).await;
                }
                Checkout::Create => {
                    debug!("Opening new pooled connection");
                    let slot = SlotReservation::new(&self.inner);
                    let conn = self.inner.create().await?;
                    slot.disarm();
                    return Ok(self.guard(conn));
                }
                Checkout::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!(timeout = ?config.connection_timeout, "Timed out waiting for a connection");
                        return Err(PoolError::Timeout(config.connection_timeout).into());
                    }
                }
            }
        }
    }

    /// Validate a reused connection, replacing it if it fails.
    async fn checked(&self, mut pooled: PooledConnection<C>) -> Result<PooledConnection<C>> {
        let ok = pooled.is_connected()
            && (!self.inner.config.validate_connections || pooled.validate().await.is_ok());
        if ok {
            return Ok(pooled);
        }

        warn!("Pooled connection failed validation; replacing it");
        let slot = SlotReservation::new(&self.inner);
        let stale = pooled.conn.take();
        drop(pooled);
        if let Some(mut stale) = stale {
            let _ = stale.disconnect().await;
        }
        let fresh = self.inner.create().await?;
        slot.disarm();
        Ok(self.guard(fresh))
    }

    fn guard(&self, conn: C) -> PooledConnection<C> {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a connection. Equivalent to [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection<C>) {
        conn.release().await;
    }

    /// Run `f` on a pooled connection. The connection goes back to the pool
    /// on every exit path, including a panic inside `f`.
    pub async fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<R>>,
    {
        let mut conn = self.acquire().await?;
        let result = f(&mut *conn).await;
        conn.release().await;
        result
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            active: state.active,
            idle: state.idle.len(),
            total: state.total,
            max_size: self.inner.config.max_size,
            initial_size: self.inner.config.initial_size,
        }
    }

    pub fn active_connections(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn total_connections(&self) -> usize {
        self.inner.state.lock().total
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Close idle connections and refuse further checkouts. Connections
    /// still checked out are closed when they come back.
    pub async fn close(&self) {
        let idle: Vec<PoolEntry<C>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            idle
        };
        self.inner.available.notify_waiters();

        info!(closed = idle.len(), "Closing connection pool");
        for mut entry in idle {
            let _ = entry.conn.disconnect().await;
        }
    }
}

impl<C: Connection> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("stats", &self.stats()).finish()
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from a [`Pool`].
///
/// Dropping the guard returns the connection. A connection that needs a
/// rollback or drain first is returned by a spawned task; call
/// [`release`](Self::release) to do that work inline instead.
pub struct PooledConnection<C: Connection> {
    /// `None` only after release
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connection> PooledConnection<C> {
    /// Return the connection to the pool, resetting it first.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn).await;
        }
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection is present until release")
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection is present until release")
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.is_reusable() {
            self.pool.check_in_ready(conn);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                handle.spawn(async move {
                    pool.check_in(conn).await;
                });
            }
            Err(_) => {
                debug!("No runtime to reset connection; discarding it");
                drop(conn);
                self.pool.forfeit_slot();
            }
        }
    }
}

impl<C: Connection + fmt::Debug> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}
