//! Gateway reliability and fairness control plane.
//!
//! Protects a shared set of downstream servers from overload while keeping
//! access fair across tenants: per-server circuit breakers, adaptive
//! connection pools, per-tenant sliding-window rate limiting with weighted
//! fair shares, and bounded priority queues, orchestrated by the
//! [`Dispatcher`].

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod lifecycle;
pub mod limiter;
pub mod observability;
pub mod pool;
pub mod queue;
pub mod resilience;

pub use config::schema::GatewayConfig;
pub use dispatch::{Dispatcher, GatewaySnapshot, Outcome};
pub use lifecycle::Shutdown;
pub use queue::Priority;
