//! Synthetic tenant load.
//!
//! Each tenant gets its own task issuing requests at
//! `rate / window * load_factor` per second, spread round-robin over the
//! target servers with a mixed priority profile. Requests are spawned, not
//! awaited in line, so a slow downstream shows up as queueing rather than as
//! a slower send rate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::pool::Connector;
use crate::queue::Priority;

/// One tenant's offered load.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantLoad {
    pub tenant: String,
    pub per_second: f64,
}

impl TenantLoad {
    /// Offered load for every configured tenant, or a single `default`
    /// tenant at the default rate when none are configured.
    pub fn from_config(config: &GatewayConfig, load_factor: f64) -> Vec<TenantLoad> {
        let window = config.rate_limit.window().as_secs_f64().max(f64::EPSILON);
        if config.tenants.is_empty() {
            return vec![TenantLoad {
                tenant: "default".to_string(),
                per_second: config.rate_limit.default_rate / window * load_factor,
            }];
        }
        config
            .tenants
            .iter()
            .map(|t| TenantLoad {
                tenant: t.id.clone(),
                per_second: t.rate / window * load_factor,
            })
            .collect()
    }
}

/// Outcome counts from a drive run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriveReport {
    pub sent: u64,
    pub outcomes: BTreeMap<String, u64>,
    pub per_tenant: BTreeMap<String, BTreeMap<String, u64>>,
}

#[derive(Default)]
struct Tally {
    sent: AtomicU64,
    counts: DashMap<(String, &'static str), u64>,
}

impl Tally {
    fn record(&self, tenant: &str, kind: &'static str) {
        *self.counts.entry((tenant.to_string(), kind)).or_insert(0) += 1;
    }

    fn report(&self) -> DriveReport {
        let mut report = DriveReport {
            sent: self.sent.load(Ordering::Relaxed),
            ..DriveReport::default()
        };
        for entry in self.counts.iter() {
            let ((tenant, kind), count) = (entry.key(), *entry.value());
            *report.outcomes.entry(kind.to_string()).or_insert(0) += count;
            *report
                .per_tenant
                .entry(tenant.clone())
                .or_default()
                .entry(kind.to_string())
                .or_insert(0) += count;
        }
        report
    }
}

/// 10% high, 70% normal, 20% low.
fn pick_priority<R: Rng>(rng: &mut R) -> Priority {
    match rng.gen_range(0..10) {
        0 => Priority::High,
        1..=7 => Priority::Normal,
        _ => Priority::Low,
    }
}

/// Offer load until `duration` passes or shutdown fires, then wait for the
/// requests already sent to finish.
pub async fn drive<C: Connector>(
    dispatcher: Arc<Dispatcher<C>>,
    tenants: Vec<TenantLoad>,
    servers: Vec<String>,
    duration: Duration,
    shutdown: broadcast::Receiver<()>,
) -> DriveReport {
    let tally = Arc::new(Tally::default());
    if servers.is_empty() {
        tracing::warn!("No servers to drive load against");
        return tally.report();
    }
    let servers = Arc::new(servers);
    let deadline = tokio::time::Instant::now() + duration;

    let mut senders = JoinSet::new();
    for (index, load) in tenants.into_iter().enumerate() {
        if load.per_second <= 0.0 {
            continue;
        }
        let dispatcher = dispatcher.clone();
        let servers = servers.clone();
        let tally = tally.clone();
        let mut shutdown = shutdown.resubscribe();

        senders.spawn(async move {
            let period = Duration::from_secs_f64(1.0 / load.per_second).max(Duration::from_micros(100));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            let mut in_flight = JoinSet::new();
            let mut seq: u64 = 0;

            tracing::info!(tenant = %load.tenant, per_second = load.per_second, "Tenant load started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = ticker.tick() => {
                        let server = servers[(index + seq as usize) % servers.len()].clone();
                        let priority = pick_priority(&mut rand::thread_rng());
                        let body = serde_json::json!({ "tenant": load.tenant, "seq": seq });
                        let payload = Bytes::from(body.to_string());
                        seq += 1;
                        tally.sent.fetch_add(1, Ordering::Relaxed);

                        let dispatcher = dispatcher.clone();
                        let tally = tally.clone();
                        let tenant = load.tenant.clone();
                        in_flight.spawn(async move {
                            let outcome = dispatcher.dispatch(&tenant, &server, priority, payload).await;
                            tally.record(&tenant, outcome.kind());
                        });
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
            while in_flight.join_next().await.is_some() {}
            tracing::info!(tenant = %load.tenant, sent = seq, "Tenant load finished");
        });
    }

    while senders.join_next().await.is_some() {}
    tally.report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;

    #[test]
    fn test_tenant_load_from_config() {
        let mut config = GatewayConfig::default();
        config.rate_limit.window_ms = 10_000;
        config.rate_limit.default_rate = 50.0;

        let loads = TenantLoad::from_config(&config, 2.0);
        assert_eq!(loads, vec![TenantLoad { tenant: "default".into(), per_second: 10.0 }]);

        config.tenants.push(TenantConfig {
            id: "acme".into(),
            rate: 20.0,
            burst_factor: 1.5,
            fairness_weight: 1.0,
        });
        let loads = TenantLoad::from_config(&config, 1.0);
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].tenant, "acme");
        assert_eq!(loads[0].per_second, 2.0);
    }

    #[test]
    fn test_priority_mix_covers_all_tiers() {
        let mut rng = rand::thread_rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            seen.insert(pick_priority(&mut rng));
        }
        assert_eq!(seen.len(), 3);
    }
}
