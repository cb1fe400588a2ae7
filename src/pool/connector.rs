//! Downstream transport abstraction.
//!
//! The pool only knows how to establish and reuse connections; what a
//! connection is and how a payload crosses it is up to the [`Connector`].

use std::future::Future;
use std::time::Duration;
use bytes::Bytes;
use thiserror::Error;

/// Failure to establish a downstream connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Failure of a downstream call on an established connection.
#[derive(Debug, Error)]
pub enum DownstreamFailure {
    /// The backend answered with an error status; the connection is still usable.
    #[error("downstream returned status {0}")]
    Status(u16),

    /// The transport broke mid-call; the connection must be discarded.
    #[error("transport error: {0}")]
    Transport(String),
}

impl DownstreamFailure {
    /// Whether the connection may go back to the idle set after this failure.
    pub fn connection_reusable(&self) -> bool {
        matches!(self, DownstreamFailure::Status(_))
    }
}

/// Establishes connections to one downstream server and runs calls on them.
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a fresh connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;

    /// Send one payload and wait for its response.
    fn call(
        &self,
        conn: &mut Self::Connection,
        payload: Bytes,
    ) -> impl Future<Output = Result<Bytes, DownstreamFailure>> + Send;

    /// Cheap check run before an idle connection is handed out again.
    fn is_reusable(&self, _conn: &Self::Connection) -> bool {
        true
    }
}
