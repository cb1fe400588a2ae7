//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway
//! control plane. All types derive Serde traits for deserialization from
//! config files.

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Root configuration for the control plane.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Sliding-window rate limiting and fairness settings.
    pub rate_limit: RateLimitConfig,

    /// Per-tenant quota overrides.
    pub tenants: Vec<TenantConfig>,

    /// Downstream server registry.
    pub servers: Vec<ServerConfig>,

    /// Background task intervals.
    pub maintenance: MaintenanceConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Look up the settings for a tenant, if explicitly configured.
    pub fn tenant(&self, id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == id)
    }

    /// Look up a registered server.
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }
}

/// Rate limiting configuration shared by all tenants.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of one counting window in milliseconds.
    pub window_ms: u64,

    /// Requests per window for tenants without an explicit entry.
    pub default_rate: f64,

    /// Burst allowance factor for tenants without an explicit entry.
    pub default_burst_factor: f64,

    /// Fairness weight for tenants without an explicit entry.
    pub default_fairness_weight: f64,

    /// Pool utilization at which per-tenant in-flight shares are enforced.
    pub fairness_watermark: f64,

    /// Queue depth at which per-tenant in-flight shares are enforced.
    pub fairness_queue_depth: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 300_000,
            default_rate: 100.0,
            default_burst_factor: 1.5,
            default_fairness_weight: 1.0,
            fairness_watermark: 0.8,
            fairness_queue_depth: 64,
        }
    }
}

/// Quota settings for a single tenant.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TenantConfig {
    /// Tenant identifier as supplied by the routing layer.
    pub id: String,

    /// Requests per window.
    pub rate: f64,

    /// Multiplier on `rate` allowed as a short burst.
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,

    /// Relative share of a saturated server.
    #[serde(default = "default_fairness_weight")]
    pub fairness_weight: f64,
}

fn default_burst_factor() -> f64 {
    1.5
}

fn default_fairness_weight() -> f64 {
    1.0
}

/// Downstream server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique server identifier.
    pub id: String,

    /// Server address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Request path used by the HTTP connector.
    #[serde(default = "default_path")]
    pub path: String,

    /// Number of worker tasks draining this server's queue.
    /// Defaults to the pool ceiling.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Deadline for a single downstream call in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

impl ServerConfig {
    /// Build a server entry with default component settings.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            path: default_path(),
            workers: None,
            request_timeout_ms: default_request_timeout_ms(),
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(self.pool.ceiling).max(1)
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before opening.
    pub failure_threshold: u32,

    /// Consecutive trial successes in HalfOpen before closing.
    pub success_threshold: u32,

    /// Time spent Open before a trial is allowed, in milliseconds.
    pub open_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
        }
    }
}

/// Connection pool bounds and scaling policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Floor for the dynamic ceiling.
    pub min_size: usize,

    /// Initial dynamic ceiling.
    pub max_size: usize,

    /// Absolute ceiling the scaling policy may grow to.
    pub ceiling: usize,

    /// Maximum idle connections kept for reuse.
    pub max_idle: usize,

    /// How long `acquire` may wait for capacity, in milliseconds.
    pub acquire_timeout_ms: u64,

    /// Timeout for establishing a single connection, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Extra establishment attempts before `acquire` fails.
    pub connect_retries: u32,

    /// Base delay for establishment backoff in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay for establishment backoff in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Consecutive failed establishments before the pool is marked unhealthy.
    pub unhealthy_after: u32,

    /// Utilization above which the pool grows.
    pub high_watermark: f64,

    /// Utilization below which the pool shrinks.
    pub low_watermark: f64,

    /// Growth multiplier (shrink uses the inverse).
    pub scale_factor: f64,

    /// Consecutive high samples required to grow.
    pub scale_up_samples: u32,

    /// Consecutive low samples required to shrink.
    pub scale_down_samples: u32,

    /// Average queue wait (ms) that counts as growth pressure.
    pub wait_watermark_ms: u64,

    /// Number of utilization samples retained.
    pub history_len: usize,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn wait_watermark(&self) -> Duration {
        Duration::from_millis(self.wait_watermark_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            ceiling: 50,
            max_idle: 10,
            acquire_timeout_ms: 2_000,
            connect_timeout_ms: 1_000,
            connect_retries: 2,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 500,
            unhealthy_after: 3,
            high_watermark: 0.8,
            low_watermark: 0.3,
            scale_factor: 1.5,
            scale_up_samples: 1,
            scale_down_samples: 3,
            wait_watermark_ms: 500,
            history_len: 60,
        }
    }
}

/// Request queue bounds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued requests before `Overloaded` is returned.
    pub max_size: usize,

    /// Maximum time a request may wait in the queue, in milliseconds.
    pub processing_timeout_ms: u64,
}

impl QueueConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 256,
            processing_timeout_ms: 5_000,
        }
    }
}

/// Background task intervals.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Pool scaling and health probe interval in milliseconds.
    pub scale_interval_ms: u64,

    /// How often idle workers wake to evict expired requests, in milliseconds.
    pub sweep_interval_ms: u64,

    /// Metrics snapshot publishing interval in milliseconds.
    pub snapshot_interval_ms: u64,

    /// Idle tenant budget cleanup interval in seconds.
    pub tenant_sweep_secs: u64,
}

impl MaintenanceConfig {
    pub fn scale_interval(&self) -> Duration {
        Duration::from_millis(self.scale_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn tenant_sweep(&self) -> Duration {
        Duration::from_secs(self.tenant_sweep_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            scale_interval_ms: 1_000,
            sweep_interval_ms: 100,
            snapshot_interval_ms: 5_000,
            tenant_sweep_secs: 600,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
