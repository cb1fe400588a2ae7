//! Bounded priority request queue, one per downstream server.
//!
//! # Data Flow
//! ```text
//! Dispatcher admits a request:
//!     → enqueue (fails fast when full or closed, request handed back)
//!
//! Server worker:
//!     → wait_for_work, then claim a connection
//!     → try_dequeue: strict priority, FIFO within a tier
//!     → expired requests found on the way are returned separately
//!     → record_processed after the downstream call
//!
//! Maintenance tick:
//!     → evict_expired sweeps every tier
//! ```
//!
//! # Design Decisions
//! - Full queue is explicit backpressure; nothing is dropped silently
//! - Deadlines are fixed at enqueue time from the processing timeout
//! - Statistics live under the same lock as the tiers

pub mod request;
pub mod stats;

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::QueueConfig;
use self::stats::QueueStats;

pub use request::{Priority, QueuedRequest};
pub use stats::QueueSnapshot;

/// Enqueue refused; the request is handed back to the caller.
#[derive(Debug, Error)]
pub enum EnqueueError<T> {
    #[error("queue for server '{server}' is full ({capacity} requests)")]
    Full { server: String, capacity: usize, request: T },

    #[error("queue for server '{server}' is closed")]
    Closed { server: String, request: T },
}

impl<T> EnqueueError<T> {
    pub fn into_request(self) -> T {
        match self {
            EnqueueError::Full { request, .. } | EnqueueError::Closed { request, .. } => request,
        }
    }
}

/// Result of one dequeue attempt.
#[derive(Debug)]
pub struct Dequeued<T> {
    /// Highest priority, oldest request still within its deadline.
    pub ready: Option<QueuedRequest<T>>,
    /// Requests skipped because their deadline had passed.
    pub expired: Vec<QueuedRequest<T>>,
}

impl<T> Dequeued<T> {
    fn empty() -> Self {
        Self {
            ready: None,
            expired: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_none() && self.expired.is_empty()
    }
}

struct QueueState<T> {
    config: QueueConfig,
    tiers: [VecDeque<QueuedRequest<T>>; 3],
    closed: bool,
    stats: QueueStats,
}

impl<T> QueueState<T> {
    fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }
}

/// Priority queue with a hard size limit.
pub struct RequestQueue<T> {
    server: String,
    state: Mutex<QueueState<T>>,
    available: Notify,
    clock: SharedClock,
}

impl<T> RequestQueue<T> {
    pub fn new(server: impl Into<String>, config: QueueConfig, clock: SharedClock) -> Self {
        Self {
            server: server.into(),
            state: Mutex::new(QueueState {
                config,
                tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                closed: false,
                stats: QueueStats::default(),
            }),
            available: Notify::new(),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("request queue mutex poisoned")
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.lock().config.max_size
    }

    /// Rolling average time spent queued.
    pub fn avg_wait(&self) -> Duration {
        self.lock().stats.avg_wait()
    }

    /// Rolling average downstream processing time, once anything was processed.
    pub fn avg_processing(&self) -> Option<Duration> {
        self.lock().stats.avg_processing()
    }

    /// Add a request. Never blocks.
    pub fn enqueue(&self, id: Uuid, tenant: &str, priority: Priority, payload: T) -> Result<(), EnqueueError<T>> {
        let now = self.clock.now();
        {
            let mut st = self.lock();
            if st.closed {
                return Err(EnqueueError::Closed {
                    server: self.server.clone(),
                    request: payload,
                });
            }
            let capacity = st.config.max_size;
            if st.len() >= capacity {
                st.stats.rejected += 1;
                tracing::debug!(server = %self.server, tenant = %tenant, request_id = %id, capacity, "Queue full");
                return Err(EnqueueError::Full {
                    server: self.server.clone(),
                    capacity,
                    request: payload,
                });
            }

            let deadline = now + st.config.processing_timeout();
            st.tiers[priority.index()].push_back(QueuedRequest {
                id,
                tenant: tenant.to_string(),
                priority,
                enqueued_at: now,
                deadline,
                payload,
            });
            st.stats.enqueued += 1;
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the next eligible request without waiting.
    pub fn try_dequeue(&self) -> Dequeued<T> {
        let now = self.clock.now();
        let mut st = self.lock();
        let mut out = Dequeued::empty();

        'tiers: for tier in 0..st.tiers.len() {
            while let Some(request) = st.tiers[tier].pop_front() {
                if request.is_expired(now) {
                    out.expired.push(request);
                } else {
                    out.ready = Some(request);
                    break 'tiers;
                }
            }
        }

        st.stats.timeouts += out.expired.len() as u64;
        if let Some(request) = &out.ready {
            st.stats.record_wait(request.waited(now));
        }
        if !out.expired.is_empty() {
            tracing::debug!(server = %self.server, expired = out.expired.len(), "Evicted expired requests on dequeue");
        }
        out
    }

    /// Wait up to `wait` for a request. Returns an empty result on timeout or
    /// once the queue is closed and empty.
    pub async fn dequeue(&self, wait: Duration) -> Dequeued<T> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();

            let out = self.try_dequeue();
            if !out.is_empty() || self.lock().closed {
                return out;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Dequeued::empty();
            }
        }
    }

    /// Wait up to `wait` until something is queued, without taking it.
    /// Returns false on timeout or once the queue is closed and empty.
    pub async fn wait_for_work(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();

            {
                let st = self.lock();
                if st.len() > 0 {
                    return true;
                }
                if st.closed {
                    return false;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Remove every request whose deadline has passed, across all tiers.
    pub fn evict_expired(&self) -> Vec<QueuedRequest<T>> {
        let now = self.clock.now();
        let mut st = self.lock();
        let mut expired = Vec::new();
        for tier in st.tiers.iter_mut() {
            let (keep, gone): (VecDeque<_>, VecDeque<_>) = tier.drain(..).partition(|r| !r.is_expired(now));
            *tier = keep;
            expired.extend(gone);
        }
        st.stats.timeouts += expired.len() as u64;
        if !expired.is_empty() {
            tracing::debug!(server = %self.server, expired = expired.len(), "Evicted expired requests");
        }
        expired
    }

    /// Record the result of a dequeued request.
    pub fn record_processed(&self, took: Duration, success: bool) {
        self.lock().stats.record_processing(took, success);
    }

    /// New limits apply to subsequent enqueues; queued requests keep their deadlines.
    pub fn reconfigure(&self, config: QueueConfig) {
        self.lock().config = config;
    }

    /// Refuse new requests and hand back everything still queued.
    pub fn close(&self) -> Vec<QueuedRequest<T>> {
        let remaining: Vec<_> = {
            let mut st = self.lock();
            st.closed = true;
            st.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect()
        };
        self.available.notify_waiters();
        tracing::info!(server = %self.server, remaining = remaining.len(), "Request queue closed");
        remaining
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let st = self.lock();
        QueueSnapshot {
            server: self.server.clone(),
            depth: st.len(),
            high: st.tiers[Priority::High.index()].len(),
            normal: st.tiers[Priority::Normal.index()].len(),
            low: st.tiers[Priority::Low.index()].len(),
            max_size: st.config.max_size,
            closed: st.closed,
            total_enqueued: st.stats.enqueued,
            total_processed: st.stats.processed,
            total_timeouts: st.stats.timeouts,
            total_errors: st.stats.errors,
            total_rejected: st.stats.rejected,
            avg_wait_ms: st.stats.avg_wait_ms(),
            avg_processing_ms: st.stats.avg_processing_ms(),
        }
    }
}
