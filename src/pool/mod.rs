//! Connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! Worker needs a connection:
//!     → manager.rs (idle set, else establish, else wait up to acquire timeout)
//!     → connector.rs (establish with bounded retries + backoff)
//!     → connection.rs (handle returned to caller)
//!
//! Call finished:
//!     → PooledConnection::release(healthy)
//!     → manager.rs (park as idle or discard, wake one waiter)
//!
//! Maintenance tick:
//!     → manager.rs scale_tick (grow/shrink dynamic ceiling)
//!     → manager.rs probe (only while unhealthy)
//! ```
//!
//! # Design Decisions
//! - One pool per downstream server, one lock per pool
//! - Pool health and breaker state are independent signals; both gate traffic
//! - Shrinking lowers the ceiling and closes idle connections only

pub mod connection;
pub mod connector;
pub mod http;
pub mod manager;

pub use connection::PooledConnection;
pub use connector::{ConnectError, Connector, DownstreamFailure};
pub use http::HttpConnector;
pub use manager::{ConnectionPool, PoolError, PoolHealth, PoolSnapshot, ScaleDecision, ScalePressure};
