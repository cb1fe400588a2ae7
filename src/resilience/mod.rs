//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Worker holding a pooled connection:
//!     → circuit_breaker.rs (permit? else CircuitOpen, connection released)
//!     → downstream call under request timeout
//!     → circuit_breaker.rs (record outcome, open circuit if threshold exceeded)
//!
//! Pool establishing a connection:
//!     → backoff.rs (delay between bounded establishment attempts)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every suspension point has a deadline
//! - The core never retries a request; only connection setup is retried
//! - Circuit breaker prevents cascading failures

pub mod backoff;
pub mod circuit_breaker;

pub use circuit_breaker::{BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker};
