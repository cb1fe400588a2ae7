//! Connection pool manager.
//!
//! # Responsibilities
//! - Hand out idle connections, establish new ones up to the dynamic ceiling
//! - Queue acquirers when the pool is full, bounded by the acquire timeout
//! - Track health from establishment results
//! - Grow or shrink the ceiling from sampled utilization
//!
//! # Invariants
//! - `active + idle <= max_size` (slots being established count as active)
//! - `min_size <= max_size <= ceiling`, except right after a reconfiguration
//!   lowered the ceiling below `active`; `max_size` then steps down to the
//!   ceiling as connections are checked in
//! - Shrinking never evicts an active connection

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::PoolConfig;
use crate::pool::connection::PooledConnection;
use crate::pool::connector::{ConnectError, Connector};
use crate::resilience::backoff::Backoff;

/// Error ratio among releases above which growth is suppressed.
const GROWTH_ERROR_RATIO: f64 = 0.5;

/// Weight of the newest sample in the setup-time moving average.
const SETUP_EWMA_ALPHA: f64 = 0.2;

/// Errors returned by [`ConnectionPool::acquire`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no connection available within {0:?}")]
    Exhausted(Duration),

    #[error("connection establishment failed after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: ConnectError,
    },

    #[error("pool is draining")]
    Draining,
}

/// Pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    Unhealthy,
    Draining,
}

/// External signals that feed the scaling policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalePressure {
    /// Rolling average time requests spent queued for this server.
    pub avg_queue_wait: Duration,
}

/// What a scaling tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Unchanged,
    Grew { from: usize, to: usize },
    Shrunk { from: usize, to: usize, closed_idle: usize },
}

/// Point-in-time view of a pool for observability.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub server: String,
    pub health: PoolHealth,
    pub min_size: usize,
    pub max_size: usize,
    pub ceiling: usize,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub utilization: f64,
    pub avg_utilization: f64,
    pub avg_setup_ms: Option<f64>,
    pub total_created: u64,
    pub total_closed: u64,
    pub total_errors: u64,
    pub total_acquire_timeouts: u64,
    pub total_connect_failures: u64,
}

struct PoolState<T> {
    config: PoolConfig,
    max_size: usize,
    active: usize,
    idle: VecDeque<T>,
    pending: usize,
    health: PoolHealth,
    consecutive_connect_failures: u32,
    avg_setup: Option<f64>,
    history: VecDeque<f64>,
    high_streak: u32,
    low_streak: u32,
    releases_in_interval: u64,
    errors_in_interval: u64,
    total_created: u64,
    total_closed: u64,
    total_errors: u64,
    total_acquire_timeouts: u64,
    total_connect_failures: u64,
}

impl<T> PoolState<T> {
    fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 1.0;
        }
        self.active as f64 / self.max_size as f64
    }

    /// Pop idle connections until `active + idle <= max_size`.
    fn trim_idle(&mut self) -> Vec<T> {
        let mut closed = Vec::new();
        while self.active + self.idle.len() > self.max_size {
            match self.idle.pop_back() {
                Some(conn) => closed.push(conn),
                None => break,
            }
        }
        self.total_closed += closed.len() as u64;
        closed
    }

    /// Step an over-ceiling `max_size` back down, never below what is in use.
    fn settle_ceiling(&mut self) {
        let ceiling = self.config.ceiling.max(self.config.min_size);
        if self.max_size > ceiling {
            self.max_size = ceiling.max(self.active + self.idle.len());
        }
    }
}

/// State shared between a pool and its outstanding handles.
pub(crate) struct PoolCore<T> {
    server: String,
    state: Mutex<PoolState<T>>,
    available: Notify,
}

impl<T: Send + 'static> PoolCore<T> {
    pub(crate) fn server(&self) -> &str {
        &self.server
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().expect("connection pool mutex poisoned")
    }

    /// Give back a checked-out slot, parking the connection if it is worth keeping.
    pub(crate) fn checkin(&self, conn: Option<T>, healthy: bool) {
        let discarded = {
            let mut st = self.lock();
            st.active = st.active.saturating_sub(1);
            st.settle_ceiling();
            st.releases_in_interval += 1;
            if !healthy {
                st.errors_in_interval += 1;
                st.total_errors += 1;
            }

            let keep = healthy
                && st.health != PoolHealth::Draining
                && st.active + st.idle.len() < st.max_size
                && st.idle.len() < st.config.max_idle;

            match conn {
                Some(c) if keep => {
                    st.idle.push_back(c);
                    None
                }
                Some(c) => {
                    st.total_closed += 1;
                    Some(c)
                }
                None => None,
            }
        };
        drop(discarded);
        self.available.notify_one();
    }

    /// Give back a slot that never held a connection. Not a release, so the
    /// error ratio is left alone.
    fn return_slot(&self) {
        {
            let mut st = self.lock();
            st.active = st.active.saturating_sub(1);
            st.settle_ceiling();
        }
        self.available.notify_one();
    }

    fn record_connect_success(&self, setup: Duration) {
        let mut st = self.lock();
        st.total_created += 1;
        st.consecutive_connect_failures = 0;

        let sample = setup.as_secs_f64() * 1000.0;
        st.avg_setup = Some(match st.avg_setup {
            Some(avg) => avg + SETUP_EWMA_ALPHA * (sample - avg),
            None => sample,
        });

        if st.health == PoolHealth::Unhealthy {
            st.health = PoolHealth::Healthy;
            tracing::info!(server = %self.server, "Connection pool healthy again");
        }
    }

    fn record_connect_exhausted(&self, error: &ConnectError) {
        let mut st = self.lock();
        st.consecutive_connect_failures += 1;
        if st.health == PoolHealth::Healthy && st.consecutive_connect_failures >= st.config.unhealthy_after {
            st.health = PoolHealth::Unhealthy;
            tracing::warn!(
                server = %self.server,
                failures = st.consecutive_connect_failures,
                error = %error,
                "Connection pool marked unhealthy"
            );
        }
    }
}

/// A reserved slot that is returned unless committed.
struct Reservation<'a, T: Send + 'static> {
    core: &'a PoolCore<T>,
    armed: bool,
}

impl<'a, T: Send + 'static> Reservation<'a, T> {
    fn new(core: &'a PoolCore<T>) -> Self {
        Self { core, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<T: Send + 'static> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.core.return_slot();
        }
    }
}

/// Counts an acquirer blocked on the pool for as long as it waits.
struct Waiting<'a, T: Send + 'static>(&'a PoolCore<T>);

impl<T: Send + 'static> Drop for Waiting<'_, T> {
    fn drop(&mut self) {
        let mut st = self.0.lock();
        st.pending = st.pending.saturating_sub(1);
    }
}

/// Bounded, adaptively sized pool of connections to one downstream server.
pub struct ConnectionPool<C: Connector> {
    core: Arc<PoolCore<C::Connection>>,
    connector: Arc<C>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(server: impl Into<String>, config: PoolConfig, connector: C) -> Self {
        let max_size = config.max_size.clamp(config.min_size, config.ceiling.max(config.min_size));
        let history_len = config.history_len;
        Self {
            core: Arc::new(PoolCore {
                server: server.into(),
                state: Mutex::new(PoolState {
                    config,
                    max_size,
                    active: 0,
                    idle: VecDeque::new(),
                    pending: 0,
                    health: PoolHealth::Healthy,
                    consecutive_connect_failures: 0,
                    avg_setup: None,
                    history: VecDeque::with_capacity(history_len),
                    high_streak: 0,
                    low_streak: 0,
                    releases_in_interval: 0,
                    errors_in_interval: 0,
                    total_created: 0,
                    total_closed: 0,
                    total_errors: 0,
                    total_acquire_timeouts: 0,
                    total_connect_failures: 0,
                }),
                available: Notify::new(),
            }),
            connector: Arc::new(connector),
        }
    }

    pub fn server(&self) -> &str {
        self.core.server()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn health(&self) -> PoolHealth {
        self.core.lock().health
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == PoolHealth::Healthy
    }

    /// Current `active / max_size`.
    pub fn utilization(&self) -> f64 {
        self.core.lock().utilization()
    }

    /// Current dynamic ceiling.
    pub fn max_size(&self) -> usize {
        self.core.lock().max_size
    }

    /// Check out a connection, waiting up to `timeout` for capacity.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<C::Connection>, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.core.available.notified();
            let mut stale = Vec::new();

            let reserved = {
                let mut st = self.core.lock();
                if st.health == PoolHealth::Draining {
                    return Err(PoolError::Draining);
                }

                while let Some(conn) = st.idle.pop_front() {
                    if self.connector.is_reusable(&conn) {
                        st.active += 1;
                        return Ok(PooledConnection::new(conn, self.core.clone(), true));
                    }
                    st.total_closed += 1;
                    stale.push(conn);
                }

                if st.active + st.idle.len() < st.max_size {
                    st.active += 1;
                    true
                } else {
                    st.pending += 1;
                    false
                }
            };
            drop(stale);

            if reserved {
                let reservation = Reservation::new(&self.core);
                return match tokio::time::timeout_at(deadline, self.establish(reservation)).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.core.lock().total_acquire_timeouts += 1;
                        Err(PoolError::Exhausted(timeout))
                    }
                };
            }

            let _waiting = Waiting(&self.core);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.core.lock().total_acquire_timeouts += 1;
                tracing::debug!(server = %self.server(), ?timeout, "Connection acquire timed out");
                return Err(PoolError::Exhausted(timeout));
            }
        }
    }

    async fn establish(
        &self,
        reservation: Reservation<'_, C::Connection>,
    ) -> Result<PooledConnection<C::Connection>, PoolError> {
        let config = self.core.lock().config.clone();
        let backoff = Backoff::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        );

        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let error = match tokio::time::timeout(config.connect_timeout(), self.connector.connect()).await {
                Ok(Ok(conn)) => {
                    self.core.record_connect_success(started.elapsed());
                    reservation.commit();
                    return Ok(PooledConnection::new(conn, self.core.clone(), false));
                }
                Ok(Err(e)) => e,
                Err(_) => ConnectError::Timeout(config.connect_timeout()),
            };
            self.core.lock().total_connect_failures += 1;

            if attempt >= config.connect_retries {
                self.core.record_connect_exhausted(&error);
                return Err(PoolError::Connect {
                    attempts: attempt + 1,
                    source: error,
                });
            }

            attempt += 1;
            let delay = backoff.delay(attempt);
            tracing::debug!(server = %self.server(), attempt, ?delay, error = %error, "Connection attempt failed, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    /// Single establishment attempt used to bring an unhealthy pool back.
    ///
    /// Returns whether the pool is healthy afterwards.
    pub async fn probe(&self) -> bool {
        let connect_timeout = {
            let mut st = self.core.lock();
            match st.health {
                PoolHealth::Healthy => return true,
                PoolHealth::Draining => return false,
                PoolHealth::Unhealthy => {}
            }
            if st.active + st.idle.len() >= st.max_size {
                return false;
            }
            st.active += 1;
            st.config.connect_timeout()
        };
        let reservation = Reservation::new(&self.core);

        let started = Instant::now();
        match tokio::time::timeout(connect_timeout, self.connector.connect()).await {
            Ok(Ok(conn)) => {
                self.core.record_connect_success(started.elapsed());
                reservation.commit();
                self.core.checkin(Some(conn), true);
                true
            }
            Ok(Err(e)) => {
                self.core.lock().total_connect_failures += 1;
                tracing::debug!(server = %self.server(), error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                self.core.lock().total_connect_failures += 1;
                tracing::debug!(server = %self.server(), "Health probe timed out");
                false
            }
        }
    }

    /// Sample utilization and adjust the dynamic ceiling.
    pub fn scale_tick(&self, pressure: ScalePressure) -> ScaleDecision {
        let (decision, closed) = {
            let mut st = self.core.lock();
            let utilization = st.utilization();

            if st.history.len() >= st.config.history_len.max(1) {
                st.history.pop_front();
            }
            st.history.push_back(utilization);

            let releases = std::mem::take(&mut st.releases_in_interval);
            let errors = std::mem::take(&mut st.errors_in_interval);
            let error_ratio = if releases > 0 { errors as f64 / releases as f64 } else { 0.0 };

            let wait_pressure = pressure.avg_queue_wait >= st.config.wait_watermark()
                && st.config.wait_watermark_ms > 0
                && utilization >= st.config.low_watermark;
            let high = utilization > st.config.high_watermark || wait_pressure;
            let low = !high && utilization < st.config.low_watermark;

            if high {
                st.high_streak += 1;
                st.low_streak = 0;
            } else if low {
                st.low_streak += 1;
                st.high_streak = 0;
            } else {
                st.high_streak = 0;
                st.low_streak = 0;
            }

            let from = st.max_size;
            if st.high_streak >= st.config.scale_up_samples {
                st.high_streak = 0;
                let can_grow = st.health == PoolHealth::Healthy
                    && error_ratio <= GROWTH_ERROR_RATIO
                    && from < st.config.ceiling;
                if can_grow {
                    let grown = (from as f64 * st.config.scale_factor).ceil() as usize;
                    st.max_size = grown.max(from + 1).min(st.config.ceiling);
                    (ScaleDecision::Grew { from, to: st.max_size }, Vec::new())
                } else {
                    (ScaleDecision::Unchanged, Vec::new())
                }
            } else if st.low_streak >= st.config.scale_down_samples && from > st.config.min_size {
                st.low_streak = 0;
                let shrunk = (from as f64 / st.config.scale_factor).floor() as usize;
                st.max_size = shrunk.max(st.config.min_size).max(st.active).max(1).min(from);
                let closed = st.trim_idle();
                if st.max_size < from {
                    (
                        ScaleDecision::Shrunk {
                            from,
                            to: st.max_size,
                            closed_idle: closed.len(),
                        },
                        closed,
                    )
                } else {
                    (ScaleDecision::Unchanged, closed)
                }
            } else {
                (ScaleDecision::Unchanged, Vec::new())
            }
        };
        drop(closed);

        match decision {
            ScaleDecision::Grew { from, to } => {
                tracing::info!(server = %self.server(), from, to, "Connection pool grown");
                self.core.available.notify_waiters();
            }
            ScaleDecision::Shrunk { from, to, closed_idle } => {
                tracing::info!(server = %self.server(), from, to, closed_idle, "Connection pool shrunk");
            }
            ScaleDecision::Unchanged => {}
        }
        decision
    }

    /// Apply new bounds. The dynamic ceiling is clamped into the new range but
    /// never below the connections already checked out; those are left to
    /// finish and the ceiling settles as they come back.
    pub fn reconfigure(&self, config: PoolConfig) {
        let closed = {
            let mut st = self.core.lock();
            if st.config == config {
                return;
            }
            let target = st.max_size.clamp(config.min_size, config.ceiling.max(config.min_size));
            st.max_size = target.max(st.active);
            while st.history.len() > config.history_len.max(1) {
                st.history.pop_front();
            }
            st.config = config;
            tracing::info!(server = %self.core.server, max_size = st.max_size, "Connection pool reconfigured");
            st.trim_idle()
        };
        drop(closed);
        self.core.available.notify_waiters();
    }

    /// Stop handing out connections and wait for checked-out ones to return.
    ///
    /// Returns the number of connections still active when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let idle: Vec<_> = {
            let mut st = self.core.lock();
            st.health = PoolHealth::Draining;
            let idle: Vec<_> = st.idle.drain(..).collect();
            st.total_closed += idle.len() as u64;
            idle
        };
        drop(idle);
        self.core.available.notify_waiters();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self.core.lock().active;
            if active == 0 {
                tracing::info!(server = %self.server(), "Connection pool drained");
                return 0;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(server = %self.server(), active, "Connection pool drain timed out");
                return active;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let st = self.core.lock();
        let avg_utilization = if st.history.is_empty() {
            st.utilization()
        } else {
            st.history.iter().sum::<f64>() / st.history.len() as f64
        };
        PoolSnapshot {
            server: self.core.server.clone(),
            health: st.health,
            min_size: st.config.min_size,
            max_size: st.max_size,
            ceiling: st.config.ceiling,
            active: st.active,
            idle: st.idle.len(),
            pending: st.pending,
            utilization: st.utilization(),
            avg_utilization,
            avg_setup_ms: st.avg_setup,
            total_created: st.total_created,
            total_closed: st.total_closed,
            total_errors: st.total_errors,
            total_acquire_timeouts: st.total_acquire_timeouts,
            total_connect_failures: st.total_connect_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use crate::pool::connector::DownstreamFailure;

    #[derive(Default)]
    struct MockConnector {
        connects: AtomicU32,
        fail: AtomicBool,
        delay_ms: AtomicU64,
    }

    impl Connector for MockConnector {
        type Connection = u32;

        async fn connect(&self) -> Result<u32, ConnectError> {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectError::Handshake("refused".into()));
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn call(&self, _conn: &mut u32, payload: Bytes) -> Result<Bytes, DownstreamFailure> {
            Ok(payload)
        }
    }

    fn config(min: usize, max: usize, ceiling: usize) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            ceiling,
            max_idle: ceiling,
            connect_retries: 0,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..PoolConfig::default()
        }
    }

    fn pool(min: usize, max: usize, ceiling: usize) -> ConnectionPool<MockConnector> {
        ConnectionPool::new("b1", config(min, max, ceiling), MockConnector::default())
    }

    fn assert_bounds<C: Connector>(pool: &ConnectionPool<C>) {
        let snap = pool.snapshot();
        assert!(snap.active + snap.idle <= snap.max_size, "{:?}", snap);
        assert!(snap.max_size <= snap.ceiling && snap.max_size >= snap.min_size, "{:?}", snap);
    }

    #[tokio::test]
    async fn test_exhausted_then_reuse() {
        let pool = pool(1, 2, 2);
        let a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let _b = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_bounds(&pool);

        let err = pool.acquire(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));
        assert_eq!(pool.snapshot().pending, 0);

        a.release(true);
        let c = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(c.was_reused());
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 2);
        assert_bounds(&pool);
    }

    #[tokio::test]
    async fn test_waiter_woken_on_release() {
        let pool = Arc::new(pool(1, 1, 1));
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await.map(|c| c.release(true)) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.snapshot().pending, 1);

        held.release(true);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_scale_up_on_high_utilization() {
        let pool = pool(2, 10, 50);
        let mut held = Vec::new();
        for _ in 0..9 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }

        let decision = pool.scale_tick(ScalePressure::default());
        assert_eq!(decision, ScaleDecision::Grew { from: 10, to: 15 });
        assert_eq!(pool.max_size(), 15);
        assert_bounds(&pool);
    }

    #[tokio::test]
    async fn test_growth_capped_at_ceiling() {
        let pool = pool(1, 10, 12);
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }
        assert_eq!(pool.scale_tick(ScalePressure::default()), ScaleDecision::Grew { from: 10, to: 12 });
        for _ in 0..2 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }
        assert_eq!(pool.scale_tick(ScalePressure::default()), ScaleDecision::Unchanged);
        assert_eq!(pool.max_size(), 12);
    }

    #[tokio::test]
    async fn test_scale_down_closes_idle_only() {
        let pool = pool(2, 10, 50);
        let mut held = Vec::new();
        for _ in 0..9 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }
        let keep = held.pop().unwrap();
        for conn in held {
            conn.release(true);
        }
        assert_eq!(pool.snapshot().idle, 8);

        // Utilization 0.1 must persist for three samples before shrinking.
        assert_eq!(pool.scale_tick(ScalePressure::default()), ScaleDecision::Unchanged);
        assert_eq!(pool.scale_tick(ScalePressure::default()), ScaleDecision::Unchanged);
        let decision = pool.scale_tick(ScalePressure::default());
        assert_eq!(decision, ScaleDecision::Shrunk { from: 10, to: 6, closed_idle: 3 });

        let snap = pool.snapshot();
        assert_eq!(snap.active, 1);
        assert_eq!(snap.idle, 5);
        assert_bounds(&pool);
        keep.release(true);
    }

    #[tokio::test]
    async fn test_shrink_respects_floor_and_active() {
        let pool = pool(4, 5, 10);
        for _ in 0..3 {
            pool.scale_tick(ScalePressure::default());
        }
        assert_eq!(pool.max_size(), 4);
        for _ in 0..6 {
            pool.scale_tick(ScalePressure::default());
        }
        assert_eq!(pool.max_size(), 4);
        assert_bounds(&pool);
    }

    #[tokio::test]
    async fn test_wait_pressure_grows_pool() {
        let pool = pool(1, 4, 8);
        let _a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let _b = pool.acquire(Duration::from_millis(50)).await.unwrap();

        let pressure = ScalePressure {
            avg_queue_wait: Duration::from_millis(800),
        };
        assert_eq!(pool.scale_tick(pressure), ScaleDecision::Grew { from: 4, to: 6 });
    }

    #[tokio::test]
    async fn test_growth_suppressed_by_release_errors() {
        let pool = pool(1, 4, 8);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }
        for conn in held.drain(..3) {
            conn.release(false);
        }
        for _ in 0..3 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }

        assert_eq!(pool.scale_tick(ScalePressure::default()), ScaleDecision::Unchanged);
        assert_eq!(pool.snapshot().total_errors, 3);
    }

    #[tokio::test]
    async fn test_unhealthy_after_failed_establishment_and_probe() {
        let mut cfg = config(1, 2, 2);
        cfg.connect_retries = 1;
        cfg.unhealthy_after = 2;
        let pool = ConnectionPool::new("b1", cfg, MockConnector::default());
        pool.connector().fail.store(true, Ordering::SeqCst);

        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect { attempts: 2, .. }));
        assert!(pool.is_healthy());
        assert!(pool.acquire(Duration::from_secs(1)).await.is_err());
        assert_eq!(pool.health(), PoolHealth::Unhealthy);
        assert_eq!(pool.snapshot().active, 0);

        assert!(!pool.probe().await);
        pool.connector().fail.store(false, Ordering::SeqCst);
        assert!(pool.probe().await);

        let snap = pool.snapshot();
        assert_eq!(snap.health, PoolHealth::Healthy);
        assert_eq!(snap.idle, 1);
        assert_eq!(snap.active, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_release_and_drop_discard() {
        let pool = pool(1, 2, 2);
        let a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(50)).await.unwrap();
        a.release(false);
        drop(b);

        let snap = pool.snapshot();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.idle, 0);
        assert_eq!(snap.total_errors, 2);
        assert_eq!(snap.total_closed, 2);
    }

    #[tokio::test]
    async fn test_cancelled_establishment_frees_slot() {
        let pool = pool(1, 1, 1);
        pool.connector().delay_ms.store(500, Ordering::SeqCst);

        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted(_)));
        assert_eq!(pool.snapshot().active, 0);

        pool.connector().delay_ms.store(0, Ordering::SeqCst);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_waits_for_active() {
        let pool = Arc::new(pool(1, 2, 2));
        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.acquire(Duration::from_millis(50)).await.unwrap().release(true);
        assert_eq!(pool.snapshot().idle, 1);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            held.release(true);
        });

        assert_eq!(pool.drain(Duration::from_secs(1)).await, 0);
        let snap = pool.snapshot();
        assert_eq!(snap.health, PoolHealth::Draining);
        assert_eq!(snap.idle, 0);
        assert!(matches!(pool.acquire(Duration::from_millis(10)).await, Err(PoolError::Draining)));
    }

    #[tokio::test]
    async fn test_reconfigure_clamps_ceiling() {
        let pool = pool(2, 10, 50);
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }
        for conn in held {
            conn.release(true);
        }
        pool.reconfigure(config(1, 4, 4));
        let snap = pool.snapshot();
        assert_eq!(snap.max_size, 4);
        assert_eq!(snap.idle, 4);
        assert_bounds(&pool);
    }

    #[tokio::test]
    async fn test_reconfigure_below_active_settles_on_checkin() {
        let pool = pool(2, 10, 50);
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }

        pool.reconfigure(config(1, 4, 4));
        let snap = pool.snapshot();
        assert_eq!((snap.active, snap.max_size), (6, 6));
        assert!(matches!(pool.acquire(Duration::from_millis(10)).await, Err(PoolError::Exhausted(_))));

        while let Some(conn) = held.pop() {
            conn.release(true);
            let snap = pool.snapshot();
            assert!(snap.active + snap.idle <= snap.max_size, "{:?}", snap);
        }
        let snap = pool.snapshot();
        assert_eq!(snap.max_size, 4);
        assert_eq!(snap.idle, 4);
        assert_bounds(&pool);
    }

    #[tokio::test]
    async fn test_failed_establishment_not_counted_as_release() {
        let mut cfg = config(1, 4, 8);
        cfg.unhealthy_after = 100;
        let pool = ConnectionPool::new("b1", cfg, MockConnector::default());
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());
        }
        held.pop().unwrap().release(false);

        pool.connector().fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(matches!(pool.acquire(Duration::from_millis(50)).await, Err(PoolError::Connect { .. })));
        }
        pool.connector().fail.store(false, Ordering::SeqCst);
        held.push(pool.acquire(Duration::from_millis(50)).await.unwrap());

        // One release, one error: still above the growth error ratio.
        assert_eq!(pool.scale_tick(ScalePressure::default()), ScaleDecision::Unchanged);
        let snap = pool.snapshot();
        assert_eq!(snap.total_errors, 1);
        assert_eq!(snap.active, 4);
    }
}
