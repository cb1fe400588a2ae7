//! Dispatch results.

use std::time::Duration;
use bytes::Bytes;
use thiserror::Error;

/// Terminal result of one dispatched request.
///
/// Every rejection is a value, never a panic; the caller owns retry policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Downstream answered successfully.
    Success(Bytes),
    /// Tenant exceeded its budget or its fair share; retry after the delay.
    RateLimited(Duration),
    /// The server's queue is full.
    Overloaded,
    /// No connection capacity within the acquire timeout, or the server is
    /// unknown or shutting down.
    Unavailable,
    /// The breaker is open or the pool is unhealthy.
    CircuitOpen,
    /// Queue deadline or downstream call deadline passed.
    Timeout,
    /// The downstream call failed.
    DownstreamError(String),
}

impl Outcome {
    /// Stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::RateLimited(_) => "rate_limited",
            Outcome::Overloaded => "overloaded",
            Outcome::Unavailable => "unavailable",
            Outcome::CircuitOpen => "circuit_open",
            Outcome::Timeout => "timeout",
            Outcome::DownstreamError(_) => "downstream_error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Suggested delay before the caller retries, when there is one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Outcome::RateLimited(after) => Some(*after),
            _ => None,
        }
    }
}

/// Errors from managing the server registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("server '{0}' is already registered")]
    DuplicateServer(String),

    #[error("server '{0}' is not registered")]
    UnknownServer(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}
