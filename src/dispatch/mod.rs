//! Gateway dispatcher.
//!
//! # Data Flow
//! ```text
//! dispatch(tenant, server, priority, payload)
//!     → server registered? pool healthy?         else Unavailable / CircuitOpen
//!     → limiter.admit                            else RateLimited
//!     → limiter.acquire_share (when saturated)   else credit, RateLimited
//!     → queue.enqueue                            else credit, Overloaded
//!     → worker (server.rs): dequeue → acquire → permit → call → report
//!     → Outcome back over a oneshot
//! ```
//!
//! # Design Decisions
//! - Servers live in a `DashMap`; each runtime owns its own locks, so there is
//!   no global lock on the request path
//! - Config is held in an `ArcSwap` and re-injected with `reconfigure`
//! - Registration is explicit: the dispatcher never builds connectors itself

pub mod outcome;
pub mod server;

use std::sync::{Arc, Weak};
use std::time::Duration;
use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::{GatewayConfig, ServerConfig};
use crate::lifecycle::Shutdown;
use crate::limiter::{FairRateLimiter, TenantSnapshot};
use crate::observability::{metrics, spans};
use crate::pool::{Connector, PoolHealth};
use crate::queue::{EnqueueError, Priority};
use self::server::{Job, ServerRuntime};

pub use outcome::{DispatchError, Outcome};
pub use server::ServerSnapshot;

/// Weight charged against the tenant budget per request.
const REQUEST_WEIGHT: f64 = 1.0;

/// Floor for the retry hint given when a tenant is over its fair share.
const MIN_SHARE_RETRY: Duration = Duration::from_millis(100);

/// Point-in-time view of the whole control plane.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub servers: Vec<ServerSnapshot>,
    pub tenants: Vec<TenantSnapshot>,
    pub rate_limited_total: u64,
}

/// How a new configuration mapped onto the registered servers.
#[derive(Debug, Default)]
pub struct Reconfigured {
    /// Registered servers whose settings were updated.
    pub updated: Vec<String>,
    /// Servers in the config that are not registered yet.
    pub added: Vec<ServerConfig>,
    /// Registered servers missing from the config.
    pub removed: Vec<String>,
}

/// Routes requests through limiter, queue, pool and breaker.
pub struct Dispatcher<C: Connector> {
    config: ArcSwap<GatewayConfig>,
    limiter: FairRateLimiter,
    servers: DashMap<String, Arc<ServerRuntime<C>>>,
    clock: SharedClock,
    shutdown: Shutdown,
}

impl<C: Connector> Dispatcher<C> {
    /// Build a dispatcher and spawn its gateway-wide background tasks
    /// (tenant budget sweep, snapshot publisher). Requires a Tokio runtime.
    pub fn new(config: GatewayConfig, clock: SharedClock) -> Arc<Self> {
        let limiter = FairRateLimiter::new(&config.rate_limit, &config.tenants, clock.clone());
        let maintenance = config.maintenance.clone();
        let dispatcher = Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            limiter,
            servers: DashMap::new(),
            clock,
            shutdown: Shutdown::new(),
        });

        tokio::spawn(run_tenant_sweep(
            Arc::downgrade(&dispatcher),
            maintenance.tenant_sweep().max(Duration::from_millis(1)),
            dispatcher.shutdown.subscribe(),
        ));
        tokio::spawn(run_snapshot_publisher(
            Arc::downgrade(&dispatcher),
            maintenance.snapshot_interval().max(Duration::from_millis(1)),
            dispatcher.shutdown.subscribe(),
        ));
        dispatcher
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    pub fn limiter(&self) -> &FairRateLimiter {
        &self.limiter
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Registered server ids, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.servers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Register a downstream server and start its workers.
    pub fn register_server(&self, config: ServerConfig, connector: C) -> Result<(), DispatchError> {
        if self.shutdown.is_triggered() {
            return Err(DispatchError::ShuttingDown);
        }
        let id = config.id.clone();
        match self.servers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DispatchError::DuplicateServer(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let runtime = ServerRuntime::new(config, connector, self.clock.clone());
                runtime.start(&self.config.load().maintenance);
                slot.insert(runtime);
                Ok(())
            }
        }
    }

    /// Stop a server: queued requests are answered `Unavailable`, in-flight
    /// calls finish and the pool drains.
    pub async fn deregister_server(&self, id: &str) -> Result<(), DispatchError> {
        let (_, runtime) = self
            .servers
            .remove(id)
            .ok_or_else(|| DispatchError::UnknownServer(id.to_string()))?;
        runtime.stop().await;
        self.limiter.forget_server(id);
        Ok(())
    }

    /// Run one request through admission, queueing and the downstream call.
    pub async fn dispatch(&self, tenant: &str, server: &str, priority: Priority, payload: Bytes) -> Outcome {
        let id = Uuid::new_v4();
        let span = spans::request_span(id, tenant, server, priority);
        let outcome = self
            .dispatch_inner(id, tenant, server, priority, payload, span.clone())
            .instrument(span)
            .await;
        metrics::record_dispatch(server, outcome.kind());
        outcome
    }

    async fn dispatch_inner(
        &self,
        id: Uuid,
        tenant: &str,
        server: &str,
        priority: Priority,
        payload: Bytes,
        span: tracing::Span,
    ) -> Outcome {
        if self.shutdown.is_triggered() {
            return Outcome::Unavailable;
        }
        let Some(runtime) = self.servers.get(server).map(|r| r.clone()) else {
            tracing::debug!("Unknown server");
            return Outcome::Unavailable;
        };

        match runtime.pool.health() {
            PoolHealth::Healthy => {}
            PoolHealth::Unhealthy => return Outcome::CircuitOpen,
            PoolHealth::Draining => return Outcome::Unavailable,
        }

        let admission = match self.limiter.admit(tenant, REQUEST_WEIGHT) {
            Ok(admission) => admission,
            Err(limited) => return Outcome::RateLimited(limited.retry_after),
        };

        let load = runtime.load(&self.config.load().rate_limit);
        let share = match self.limiter.acquire_share(server, tenant, load) {
            Ok(share) => share,
            Err(_) => {
                self.limiter.credit(admission);
                let retry = runtime.queue.avg_processing().unwrap_or(MIN_SHARE_RETRY).max(MIN_SHARE_RETRY);
                return Outcome::RateLimited(retry);
            }
        };

        let (reply, answer) = oneshot::channel();
        let job = Job {
            payload,
            admission,
            share,
            reply,
            span,
        };

        if let Err(e) = runtime.queue.enqueue(id, tenant, priority, job) {
            let overloaded = matches!(e, EnqueueError::Full { .. });
            let job = e.into_request();
            self.limiter.credit(job.admission);
            return if overloaded { Outcome::Overloaded } else { Outcome::Unavailable };
        }

        answer.await.unwrap_or(Outcome::Unavailable)
    }

    /// Apply a new configuration to the limiter and every registered server.
    pub fn reconfigure(&self, config: GatewayConfig) -> Reconfigured {
        self.limiter.reconfigure(&config.rate_limit, &config.tenants);

        let mut report = Reconfigured::default();
        for server in &config.servers {
            match self.servers.get(&server.id) {
                Some(runtime) => {
                    runtime.reconfigure(server.clone());
                    report.updated.push(server.id.clone());
                }
                None => report.added.push(server.clone()),
            }
        }
        report.removed = self
            .server_ids()
            .into_iter()
            .filter(|id| config.server(id).is_none())
            .collect();

        tracing::info!(
            updated = report.updated.len(),
            added = report.added.len(),
            removed = report.removed.len(),
            "Gateway reconfigured"
        );
        self.config.store(Arc::new(config));
        report
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .map(|entry| entry.value().snapshot(&self.limiter.tracker(entry.key())))
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        GatewaySnapshot {
            servers,
            tenants: self.limiter.snapshot(),
            rate_limited_total: self.limiter.rejected_count(),
        }
    }

    /// Stop background tasks and every server.
    pub async fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        tracing::info!(servers = self.servers.len(), "Dispatcher shutting down");

        let runtimes: Vec<_> = self.server_ids().into_iter().filter_map(|id| self.servers.remove(&id)).collect();
        for (id, runtime) in runtimes {
            runtime.stop().await;
            self.limiter.forget_server(&id);
        }
        tracing::info!("Dispatcher stopped");
    }
}

async fn run_tenant_sweep<C: Connector>(dispatcher: Weak<Dispatcher<C>>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let Some(dispatcher) = dispatcher.upgrade() else { break };
                dispatcher.limiter.sweep_idle();
            }
        }
    }
}

async fn run_snapshot_publisher<C: Connector>(
    dispatcher: Weak<Dispatcher<C>>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let Some(dispatcher) = dispatcher.upgrade() else { break };
                metrics::publish_snapshot(&dispatcher.snapshot());
            }
        }
    }
}
