//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → spans.rs (request span with correlation id)
//!     → metrics.rs (counters and histograms per dispatch)
//!
//! Snapshot publisher (dispatch):
//!     → GatewaySnapshot every snapshot interval
//!     → metrics.rs gauges for breakers, pools, queues and tenants
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - Metric updates are fire-and-forget; with no recorder installed they are no-ops
//! - Request id flows through all subsystems via the span

pub mod logging;
pub mod metrics;
pub mod spans;
