//! Fair rate limiting per tenant.
//!
//! # Data Flow
//! ```text
//! dispatch(tenant, server, ...)
//!     → admit(tenant, weight): sliding-window budget (window.rs)
//!     → acquire_share(server, tenant, load): weighted in-flight cap (fairness.rs)
//!     → queue full / share exceeded: credit(admission) rolls the budget back
//! ```
//!
//! # Design Decisions
//! - One mutex per tenant budget; tenants never contend with each other
//! - Admission is compare-and-increment under that mutex, so concurrent
//!   admits cannot jointly overshoot the budget
//! - Quotas come from explicit config and are swapped via `reconfigure`

pub mod fairness;
pub(crate) mod window;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::clock::SharedClock;
use crate::config::{RateLimitConfig, TenantConfig};
use self::window::SlidingWindow;

pub use fairness::{FairShareTracker, ServerLoad, ShareExceeded, ShareGuard};

/// Slack for floating point accumulation at the exact budget boundary.
const BUDGET_EPSILON: f64 = 1e-9;

/// Quota applied to one tenant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    pub rate: f64,
    pub burst_factor: f64,
    pub fairness_weight: f64,
}

impl Quota {
    /// Maximum effective weighted count in any sliding interval.
    pub fn allowed(&self) -> f64 {
        self.rate * self.burst_factor
    }
}

impl From<&TenantConfig> for Quota {
    fn from(t: &TenantConfig) -> Self {
        Self {
            rate: t.rate,
            burst_factor: t.burst_factor,
            fairness_weight: t.fairness_weight,
        }
    }
}

/// The tenant is over budget.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("tenant '{tenant}' rate limited, retry after {retry_after:?}")]
pub struct RateLimited {
    pub tenant: String,
    pub retry_after: Duration,
}

/// A granted admission; hand it to [`FairRateLimiter::credit`] to roll back.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    tenant: String,
    weight: f64,
    epoch: u64,
}

impl Admission {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

#[derive(Debug)]
struct LimiterSettings {
    window: Duration,
    default_quota: Quota,
    tenants: HashMap<String, Quota>,
}

impl LimiterSettings {
    fn from_config(config: &RateLimitConfig, tenants: &[TenantConfig]) -> Self {
        Self {
            window: config.window(),
            default_quota: Quota {
                rate: config.default_rate,
                burst_factor: config.default_burst_factor,
                fairness_weight: config.default_fairness_weight,
            },
            tenants: tenants.iter().map(|t| (t.id.clone(), Quota::from(t))).collect(),
        }
    }

    fn quota(&self, tenant: &str) -> Quota {
        self.tenants.get(tenant).copied().unwrap_or(self.default_quota)
    }
}

#[derive(Debug)]
struct TenantBudget {
    quota: Quota,
    window: SlidingWindow,
    admitted: u64,
    rejected: u64,
    credited: u64,
}

/// Point-in-time view of one tenant budget.
#[derive(Debug, Clone, Serialize)]
pub struct TenantSnapshot {
    pub tenant: String,
    pub rate: f64,
    pub burst_factor: f64,
    pub allowed: f64,
    pub fairness_weight: f64,
    pub window_ms: u64,
    pub effective_rate: f64,
    pub current_window: f64,
    pub previous_window: f64,
    pub accumulated_usage: f64,
    pub admitted: u64,
    pub rejected: u64,
    pub credited: u64,
}

/// Per-tenant sliding-window limiter with per-server fairness shares.
#[derive(Debug)]
pub struct FairRateLimiter {
    settings: ArcSwap<LimiterSettings>,
    budgets: DashMap<String, Arc<Mutex<TenantBudget>>>,
    shares: DashMap<String, Arc<FairShareTracker>>,
    clock: SharedClock,
    rejected_count: AtomicU64,
}

impl FairRateLimiter {
    pub fn new(config: &RateLimitConfig, tenants: &[TenantConfig], clock: SharedClock) -> Self {
        Self {
            settings: ArcSwap::from_pointee(LimiterSettings::from_config(config, tenants)),
            budgets: DashMap::new(),
            shares: DashMap::new(),
            clock,
            rejected_count: AtomicU64::new(0),
        }
    }

    /// Quota currently applied to `tenant`.
    pub fn quota(&self, tenant: &str) -> Quota {
        self.settings.load().quota(tenant)
    }

    /// Try to admit `weight` units of work for `tenant`.
    pub fn admit(&self, tenant: &str, weight: f64) -> Result<Admission, RateLimited> {
        let now = self.clock.now();
        let budget = self.budget(tenant);
        let mut b = budget.lock().expect("tenant budget mutex poisoned");

        b.window.rotate(now);
        let effective = b.window.effective(now);
        let allowed = b.quota.allowed();

        if effective + weight <= allowed + BUDGET_EPSILON {
            b.window.add(weight);
            b.admitted += 1;
            return Ok(Admission {
                tenant: tenant.to_string(),
                weight,
                epoch: b.window.epoch(),
            });
        }

        b.rejected += 1;
        self.rejected_count.fetch_add(1, Ordering::Relaxed);

        let per_second = b.quota.rate / b.window.length().as_secs_f64();
        let excess = effective + weight - allowed;
        let retry_after = if per_second > 0.0 {
            Duration::from_secs_f64((excess / per_second).clamp(0.0, b.window.length().as_secs_f64()))
        } else {
            b.window.length()
        };

        tracing::debug!(tenant = %tenant, effective, allowed, ?retry_after, "Tenant rate limited");
        Err(RateLimited {
            tenant: tenant.to_string(),
            retry_after,
        })
    }

    /// Roll back an admission whose request was never served.
    pub fn credit(&self, admission: Admission) {
        let Some(budget) = self.budgets.get(&admission.tenant).map(|b| b.clone()) else {
            return;
        };
        let now = self.clock.now();
        let mut b = budget.lock().expect("tenant budget mutex poisoned");
        b.window.rotate(now);
        if b.window.credit(admission.epoch, admission.weight) {
            b.credited += 1;
        }
    }

    /// Claim an in-flight slot for `tenant` on `server`, enforcing weighted
    /// shares when the server is saturated.
    pub fn acquire_share(&self, server: &str, tenant: &str, load: ServerLoad) -> Result<ShareGuard, ShareExceeded> {
        let tracker = self.tracker(server);
        let weight = self.quota(tenant).fairness_weight;
        let result = tracker.try_acquire(tenant, weight, load);
        if let Err(e) = &result {
            tracing::debug!(server = %server, tenant = %tenant, limit = e.limit, "Tenant over fair share");
        }
        result
    }

    /// Share tracker for one server.
    pub fn tracker(&self, server: &str) -> Arc<FairShareTracker> {
        if let Some(t) = self.shares.get(server) {
            return t.clone();
        }
        self.shares
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(FairShareTracker::new(server)))
            .clone()
    }

    /// Drop share tracking for a deregistered server.
    pub fn forget_server(&self, server: &str) {
        self.shares.remove(server);
    }

    /// Apply new quotas. Window counts survive unless the window length changed.
    pub fn reconfigure(&self, config: &RateLimitConfig, tenants: &[TenantConfig]) {
        let settings = LimiterSettings::from_config(config, tenants);
        let now = self.clock.now();

        for entry in self.budgets.iter() {
            let mut b = entry.value().lock().expect("tenant budget mutex poisoned");
            b.quota = settings.quota(entry.key());
            if b.window.length() != settings.window {
                b.window = SlidingWindow::new(settings.window, now);
            }
        }

        tracing::info!(
            tenants = settings.tenants.len(),
            window_ms = settings.window.as_millis() as u64,
            "Rate limiter reconfigured"
        );
        self.settings.store(Arc::new(settings));
    }

    /// Remove budgets with nothing left in their sliding interval.
    /// Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.budgets.len();
        self.budgets.retain(|_, budget| {
            let mut b = budget.lock().expect("tenant budget mutex poisoned");
            b.window.rotate(now);
            !b.window.is_idle()
        });
        let removed = before.saturating_sub(self.budgets.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept idle tenant budgets");
        }
        removed
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<TenantSnapshot> {
        let now = self.clock.now();
        let mut tenants: Vec<_> = self
            .budgets
            .iter()
            .map(|entry| {
                let mut b = entry.value().lock().expect("tenant budget mutex poisoned");
                b.window.rotate(now);
                TenantSnapshot {
                    tenant: entry.key().clone(),
                    rate: b.quota.rate,
                    burst_factor: b.quota.burst_factor,
                    allowed: b.quota.allowed(),
                    fairness_weight: b.quota.fairness_weight,
                    window_ms: b.window.length().as_millis() as u64,
                    effective_rate: b.window.effective(now),
                    current_window: b.window.current(),
                    previous_window: b.window.previous(),
                    accumulated_usage: b.window.accumulated(),
                    admitted: b.admitted,
                    rejected: b.rejected,
                    credited: b.credited,
                }
            })
            .collect();
        tenants.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        tenants
    }

    fn budget(&self, tenant: &str) -> Arc<Mutex<TenantBudget>> {
        if let Some(b) = self.budgets.get(tenant) {
            return b.clone();
        }
        let settings = self.settings.load();
        self.budgets
            .entry(tenant.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TenantBudget {
                    quota: settings.quota(tenant),
                    window: SlidingWindow::new(settings.window, self.clock.now()),
                    admitted: 0,
                    rejected: 0,
                    credited: 0,
                }))
            })
            .clone()
    }
}
