//! Per-server in-flight share tracking.
//!
//! When a server is saturated, each tenant may hold at most its weighted share
//! of the server's capacity:
//!
//! ```text
//! limit = max(1, floor(capacity * weight / sum(weights of active tenants)))
//! ```
//!
//! A tenant is active while it has at least one request in flight on the
//! server. Below saturation only the tenant's own rate budget applies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Load signal for one server, sampled by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct ServerLoad {
    /// Pool utilization or queue depth crossed its fairness watermark.
    pub saturated: bool,
    /// Requests the server can hold in flight (pool ceiling plus queue).
    pub capacity: usize,
}

/// A tenant already holds its full share of a saturated server.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("tenant '{tenant}' holds {in_flight} of its {limit} in-flight share on server '{server}'")]
pub struct ShareExceeded {
    pub server: String,
    pub tenant: String,
    pub in_flight: usize,
    pub limit: usize,
}

#[derive(Debug)]
struct TenantShare {
    in_flight: usize,
    weight: f64,
}

/// In-flight counts per tenant for one server.
#[derive(Debug)]
pub struct FairShareTracker {
    server: String,
    shares: Mutex<HashMap<String, TenantShare>>,
    rejected: AtomicU64,
}

impl FairShareTracker {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            shares: Mutex::new(HashMap::new()),
            rejected: AtomicU64::new(0),
        }
    }

    /// Claim one in-flight slot for `tenant`.
    pub fn try_acquire(
        self: &Arc<Self>,
        tenant: &str,
        weight: f64,
        load: ServerLoad,
    ) -> Result<ShareGuard, ShareExceeded> {
        let mut shares = self.shares.lock().expect("fair share mutex poisoned");

        if load.saturated {
            let own = shares.get(tenant).map(|s| s.in_flight).unwrap_or(0);
            let others: f64 = shares
                .iter()
                .filter(|(id, s)| s.in_flight > 0 && id.as_str() != tenant)
                .map(|(_, s)| s.weight)
                .sum();
            let total = others + weight;
            let limit = ((load.capacity as f64 * weight / total).floor() as usize).max(1);

            if own >= limit {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(ShareExceeded {
                    server: self.server.clone(),
                    tenant: tenant.to_string(),
                    in_flight: own,
                    limit,
                });
            }
        }

        let share = shares.entry(tenant.to_string()).or_insert(TenantShare {
            in_flight: 0,
            weight,
        });
        share.in_flight += 1;
        share.weight = weight;

        Ok(ShareGuard {
            tracker: self.clone(),
            tenant: tenant.to_string(),
        })
    }

    /// Current in-flight count for a tenant.
    pub fn in_flight(&self, tenant: &str) -> usize {
        let shares = self.shares.lock().expect("fair share mutex poisoned");
        shares.get(tenant).map(|s| s.in_flight).unwrap_or(0)
    }

    /// Number of tenants with requests in flight.
    pub fn active_tenants(&self) -> usize {
        self.shares.lock().expect("fair share mutex poisoned").len()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn release(&self, tenant: &str) {
        let mut shares = self.shares.lock().expect("fair share mutex poisoned");
        if let Some(share) = shares.get_mut(tenant) {
            share.in_flight = share.in_flight.saturating_sub(1);
            if share.in_flight == 0 {
                shares.remove(tenant);
            }
        }
    }
}

/// One in-flight slot; released on drop.
#[derive(Debug)]
pub struct ShareGuard {
    tracker: Arc<FairShareTracker>,
    tenant: String,
}

impl Drop for ShareGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.tenant);
    }
}
