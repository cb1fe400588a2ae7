//! Checked-out connection handle.
//!
//! # Design Decisions
//! - `release` consumes the handle, so a connection cannot be returned twice
//! - Dropping a handle without releasing it counts as an unhealthy release
//!   (the connection may have been abandoned mid-call)

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use crate::pool::manager::PoolCore;

/// A connection borrowed from a [`ConnectionPool`](crate::pool::ConnectionPool).
pub struct PooledConnection<T: Send + 'static> {
    conn: Option<T>,
    core: Arc<PoolCore<T>>,
    acquired_at: Instant,
    reused: bool,
}

impl<T: Send + 'static> PooledConnection<T> {
    pub(crate) fn new(conn: T, core: Arc<PoolCore<T>>, reused: bool) -> Self {
        Self {
            conn: Some(conn),
            core,
            acquired_at: Instant::now(),
            reused,
        }
    }

    /// When this handle was checked out.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Whether the connection came from the idle set rather than being freshly
    /// established.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// Return the connection to its pool.
    pub fn release(mut self, healthy: bool) {
        let conn = self.conn.take();
        self.core.checkin(conn, healthy);
    }
}

impl<T: Send + 'static> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl<T: Send + 'static> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl<T: Send + 'static> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.core.checkin(Some(conn), false);
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("server", &self.core.server())
            .field("acquired_at", &self.acquired_at)
            .field("reused", &self.reused)
            .finish()
    }
}
