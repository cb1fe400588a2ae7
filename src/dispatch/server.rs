//! Per-server runtime: breaker, pool, queue and the tasks that drive them.
//!
//! # Responsibilities
//! - Worker tasks claim a connection, then take the highest priority request
//!   and execute it in a child task
//! - A maintenance task scales the pool, probes it while unhealthy and
//!   evicts expired requests
//! - Every dequeued request reports to breaker, pool and queue statistics
//!
//! # Design Decisions
//! - Each server has its own shutdown broadcast so deregistration stops only
//!   its tasks
//! - Workers answer through a oneshot; a dropped sender reads as `Unavailable`
//! - One worker at a time claims; requests stay queued, and covered by their
//!   deadlines, until a connection is in hand
//! - A panicking downstream call takes down its child task only; the permit,
//!   connection and fairness slot are released by their guards

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span};

use crate::clock::SharedClock;
use crate::config::{MaintenanceConfig, RateLimitConfig, ServerConfig};
use crate::dispatch::outcome::Outcome;
use crate::lifecycle::Shutdown;
use crate::limiter::{Admission, FairShareTracker, ServerLoad, ShareGuard};
use crate::observability::metrics;
use crate::pool::{
    ConnectionPool, Connector, PoolError, PoolHealth, PoolSnapshot, PooledConnection, ScaleDecision, ScalePressure,
};
use crate::queue::{QueueSnapshot, QueuedRequest, RequestQueue};
use crate::resilience::{BreakerSnapshot, CircuitBreaker};

/// A request travelling through a server queue.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) payload: Bytes,
    /// Held so the budget stays consumed; credited back only on rejection.
    pub(crate) admission: Admission,
    pub(crate) share: ShareGuard,
    pub(crate) reply: oneshot::Sender<Outcome>,
    pub(crate) span: Span,
}

impl Job {
    /// Release the fairness slot, then answer the caller.
    fn answer(self, outcome: Outcome) {
        let Job { share, reply, .. } = self;
        drop(share);
        let _ = reply.send(outcome);
    }
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub address: String,
    pub breaker: BreakerSnapshot,
    pub pool: PoolSnapshot,
    pub queue: QueueSnapshot,
    pub active_tenants: usize,
    pub fairness_rejected: u64,
}

pub(crate) struct ServerRuntime<C: Connector> {
    id: String,
    config: ArcSwap<ServerConfig>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) pool: ConnectionPool<C>,
    pub(crate) queue: RequestQueue<Job>,
    clock: SharedClock,
    /// Serializes connection claims so requests leave the queue in priority order.
    claim: AsyncMutex<()>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

type Claimed<C> = (QueuedRequest<Job>, Result<PooledConnection<<C as Connector>::Connection>, PoolError>);

impl<C: Connector> ServerRuntime<C> {
    pub(crate) fn new(config: ServerConfig, connector: C, clock: SharedClock) -> Arc<Self> {
        let id = config.id.clone();
        Arc::new(Self {
            breaker: CircuitBreaker::new(id.clone(), config.breaker.clone(), clock.clone()),
            pool: ConnectionPool::new(id.clone(), config.pool.clone(), connector),
            queue: RequestQueue::new(id.clone(), config.queue.clone(), clock.clone()),
            config: ArcSwap::from_pointee(config),
            id,
            clock,
            claim: AsyncMutex::new(()),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker and maintenance tasks.
    pub(crate) fn start(self: &Arc<Self>, maintenance: &MaintenanceConfig) {
        let workers = self.config.load().worker_count();
        let wait = maintenance.sweep_interval().max(Duration::from_millis(1));
        let scale_every = maintenance.scale_interval().max(Duration::from_millis(1));

        let mut tasks = self.tasks.lock().expect("server task list mutex poisoned");
        for worker in 0..workers {
            let runtime = self.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(runtime.run_worker(worker, wait, shutdown)));
        }
        let runtime = self.clone();
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(runtime.run_maintenance(scale_every, wait, shutdown)));

        tracing::info!(
            server = %self.id,
            address = %self.config.load().address,
            workers,
            "Server runtime started"
        );
    }

    /// Load signal for the fairness check.
    pub(crate) fn load(&self, settings: &RateLimitConfig) -> ServerLoad {
        let depth = self.queue.len();
        let saturated =
            self.pool.utilization() >= settings.fairness_watermark || depth >= settings.fairness_queue_depth;
        ServerLoad {
            saturated,
            capacity: self.pool.max_size() + self.queue.max_size(),
        }
    }

    pub(crate) fn reconfigure(&self, config: ServerConfig) {
        let current = self.config.load();
        if current.address != config.address {
            tracing::warn!(
                server = %self.id,
                old = %current.address,
                new = %config.address,
                "Server address changes apply after re-registration"
            );
        }
        if current.worker_count() != config.worker_count() {
            tracing::warn!(server = %self.id, "Worker count changes apply after re-registration");
        }
        self.breaker.reconfigure(config.breaker.clone());
        self.pool.reconfigure(config.pool.clone());
        self.queue.reconfigure(config.queue.clone());
        self.config.store(Arc::new(config));
    }

    /// Stop tasks, answer queued requests and drain the pool.
    pub(crate) async fn stop(&self) {
        self.shutdown.trigger();

        let queued = self.queue.close();
        for request in queued {
            request.payload.answer(Outcome::Unavailable);
        }

        let grace = {
            let config = self.config.load();
            config.request_timeout() + config.pool.acquire_timeout()
        };
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock().expect("server task list mutex poisoned"));
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!(server = %self.id, "Server task did not stop in time, aborting");
                abort.abort();
            }
        }

        let left = self.pool.drain(grace).await;
        tracing::info!(server = %self.id, left_active = left, "Server runtime stopped");
    }

    pub(crate) fn snapshot(&self, tracker: &FairShareTracker) -> ServerSnapshot {
        ServerSnapshot {
            id: self.id.clone(),
            address: self.config.load().address.clone(),
            breaker: self.breaker.snapshot(),
            pool: self.pool.snapshot(),
            queue: self.queue.snapshot(),
            active_tenants: tracker.active_tenants(),
            fairness_rejected: tracker.rejected(),
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize, wait: Duration, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let claimed = tokio::select! {
                _ = shutdown.recv() => break,
                claimed = self.claim_next(wait) => claimed,
            };
            let Some((request, conn)) = claimed else {
                continue;
            };

            let runtime = self.clone();
            if let Err(e) = tokio::spawn(runtime.process(request, conn)).await {
                if e.is_panic() {
                    tracing::error!(server = %self.id, worker, "Request task panicked");
                }
            }
        }
        tracing::debug!(server = %self.id, worker, "Worker stopped");
    }

    /// Wait for work, acquire a connection, then take the best request queued
    /// at that moment. A request is returned with the acquire error when no
    /// connection could be had.
    async fn claim_next(&self, wait: Duration) -> Option<Claimed<C>> {
        let _claim = self.claim.lock().await;
        if !self.queue.wait_for_work(wait).await {
            return None;
        }

        let acquire_timeout = self.config.load().pool.acquire_timeout();
        let conn = self.pool.acquire(acquire_timeout).await;

        let batch = self.queue.try_dequeue();
        for request in batch.expired {
            self.expire(request);
        }
        match (batch.ready, conn) {
            (Some(request), conn) => Some((request, conn)),
            (None, Ok(conn)) => {
                conn.release(true);
                None
            }
            (None, Err(e)) => {
                tracing::debug!(server = %self.id, error = %e, "Connection acquire failed with nothing left to serve");
                None
            }
        }
    }

    async fn run_maintenance(self: Arc<Self>, scale_every: Duration, sweep_every: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut scale = tokio::time::interval(scale_every);
        scale.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = scale.tick() => self.maintain_pool().await,
                _ = sweep.tick() => {
                    for request in self.queue.evict_expired() {
                        self.expire(request);
                    }
                }
            }
        }
        tracing::debug!(server = %self.id, "Maintenance loop stopped");
    }

    async fn maintain_pool(&self) {
        let pressure = ScalePressure {
            avg_queue_wait: self.queue.avg_wait(),
        };
        match self.pool.scale_tick(pressure) {
            ScaleDecision::Grew { .. } => metrics::record_scale(&self.id, "up"),
            ScaleDecision::Shrunk { .. } => metrics::record_scale(&self.id, "down"),
            ScaleDecision::Unchanged => {}
        }
        if self.pool.health() == PoolHealth::Unhealthy {
            self.pool.probe().await;
        }
    }

    fn expire(&self, request: QueuedRequest<Job>) {
        let waited = request.waited(self.clock.now());
        tracing::debug!(
            parent: &request.payload.span,
            tenant = %request.payload.admission.tenant(),
            waited_ms = waited.as_millis() as u64,
            "Request expired in queue"
        );
        metrics::record_queue_wait(&self.id, waited);
        request.payload.answer(Outcome::Timeout);
    }

    async fn process(
        self: Arc<Self>,
        request: QueuedRequest<Job>,
        conn: Result<PooledConnection<C::Connection>, PoolError>,
    ) {
        metrics::record_queue_wait(&self.id, request.waited(self.clock.now()));

        let span = request.payload.span.clone();
        let mut job = request.payload;
        let payload = std::mem::take(&mut job.payload);

        let started = Instant::now();
        let outcome = self.execute(conn, payload).instrument(span).await;
        self.queue.record_processed(started.elapsed(), outcome.is_success());

        job.answer(outcome);
    }

    /// Permit, call, report.
    async fn execute(&self, conn: Result<PooledConnection<C::Connection>, PoolError>, payload: Bytes) -> Outcome {
        let config = self.config.load_full();

        let mut conn = match conn {
            Ok(conn) => conn,
            Err(PoolError::Draining) => return Outcome::Unavailable,
            Err(e) => {
                self.breaker.record_failure(matches!(e, PoolError::Exhausted(_)));
                tracing::debug!(error = %e, "Connection acquire failed");
                return Outcome::Unavailable;
            }
        };

        let Some(permit) = self.breaker.permit() else {
            conn.release(true);
            return Outcome::CircuitOpen;
        };

        let connector = self.pool.connector();
        let started = Instant::now();
        let result = tokio::time::timeout(config.request_timeout(), connector.call(&mut conn, payload)).await;
        let took = started.elapsed();

        match result {
            Ok(Ok(body)) => {
                self.breaker.record_outcome(permit, true, false);
                let reusable = connector.is_reusable(&conn);
                conn.release(reusable);
                metrics::record_downstream(&self.id, took, true);
                Outcome::Success(body)
            }
            Ok(Err(failure)) => {
                self.breaker.record_outcome(permit, false, false);
                let reusable = failure.connection_reusable() && connector.is_reusable(&conn);
                conn.release(reusable);
                metrics::record_downstream(&self.id, took, false);
                tracing::debug!(error = %failure, "Downstream call failed");
                Outcome::DownstreamError(failure.to_string())
            }
            Err(_) => {
                self.breaker.record_outcome(permit, false, true);
                conn.release(false);
                metrics::record_downstream(&self.id, took, false);
                tracing::debug!(timeout_ms = config.request_timeout_ms, "Downstream call timed out");
                Outcome::Timeout
            }
        }
    }
}
