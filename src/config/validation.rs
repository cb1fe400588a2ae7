//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and identifier
//! uniqueness. Every problem is reported, not just the first.

use std::collections::HashSet;
use thiserror::Error;

use crate::config::schema::{GatewayConfig, PoolConfig, ServerConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: String },

    #[error("{field} must be at least {min}, got {value}")]
    TooSmall { field: String, min: f64, value: f64 },

    #[error("{field} must be within ({low}, {high}], got {value}")]
    OutOfRange { field: String, low: f64, high: f64, value: f64 },

    #[error("duplicate {kind} id '{id}'")]
    Duplicate { kind: &'static str, id: String },

    #[error("{field} must not be empty")]
    Empty { field: String },

    #[error("server '{server}': pool sizes must satisfy min_size <= max_size <= ceiling ({min} <= {max} <= {ceiling})")]
    PoolBounds { server: String, min: usize, max: usize, ceiling: usize },

    #[error("server '{server}': low_watermark {low} must be below high_watermark {high}")]
    Watermarks { server: String, low: f64, high: f64 },
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let rl = &config.rate_limit;
    positive_u64(&mut errors, "rate_limit.window_ms", rl.window_ms);
    positive_f64(&mut errors, "rate_limit.default_rate", rl.default_rate);
    at_least(&mut errors, "rate_limit.default_burst_factor", 1.0, rl.default_burst_factor);
    positive_f64(&mut errors, "rate_limit.default_fairness_weight", rl.default_fairness_weight);
    ratio(&mut errors, "rate_limit.fairness_watermark", rl.fairness_watermark);
    positive_u64(&mut errors, "rate_limit.fairness_queue_depth", rl.fairness_queue_depth as u64);

    let mut tenant_ids = HashSet::new();
    for tenant in &config.tenants {
        if tenant.id.is_empty() {
            errors.push(ValidationError::Empty { field: "tenants.id".into() });
        }
        if !tenant_ids.insert(tenant.id.as_str()) {
            errors.push(ValidationError::Duplicate { kind: "tenant", id: tenant.id.clone() });
        }
        positive_f64(&mut errors, &format!("tenants.{}.rate", tenant.id), tenant.rate);
        at_least(&mut errors, &format!("tenants.{}.burst_factor", tenant.id), 1.0, tenant.burst_factor);
        positive_f64(&mut errors, &format!("tenants.{}.fairness_weight", tenant.id), tenant.fairness_weight);
    }

    let mut server_ids = HashSet::new();
    for server in &config.servers {
        if !server_ids.insert(server.id.as_str()) {
            errors.push(ValidationError::Duplicate { kind: "server", id: server.id.clone() });
        }
        validate_server(&mut errors, server);
    }

    let m = &config.maintenance;
    positive_u64(&mut errors, "maintenance.scale_interval_ms", m.scale_interval_ms);
    positive_u64(&mut errors, "maintenance.sweep_interval_ms", m.sweep_interval_ms);
    positive_u64(&mut errors, "maintenance.snapshot_interval_ms", m.snapshot_interval_ms);
    positive_u64(&mut errors, "maintenance.tenant_sweep_secs", m.tenant_sweep_secs);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_server(errors: &mut Vec<ValidationError>, server: &ServerConfig) {
    let id = &server.id;
    if id.is_empty() {
        errors.push(ValidationError::Empty { field: "servers.id".into() });
    }
    if server.address.is_empty() {
        errors.push(ValidationError::Empty { field: format!("servers.{}.address", id) });
    }
    if server.workers == Some(0) {
        errors.push(ValidationError::NotPositive { field: format!("servers.{}.workers", id) });
    }
    positive_u64(errors, &format!("servers.{}.request_timeout_ms", id), server.request_timeout_ms);

    let b = &server.breaker;
    positive_u64(errors, &format!("servers.{}.breaker.failure_threshold", id), b.failure_threshold.into());
    positive_u64(errors, &format!("servers.{}.breaker.success_threshold", id), b.success_threshold.into());
    positive_u64(errors, &format!("servers.{}.breaker.open_timeout_ms", id), b.open_timeout_ms);

    validate_pool(errors, id, &server.pool);

    positive_u64(errors, &format!("servers.{}.queue.max_size", id), server.queue.max_size as u64);
    positive_u64(errors, &format!("servers.{}.queue.processing_timeout_ms", id), server.queue.processing_timeout_ms);
}

fn validate_pool(errors: &mut Vec<ValidationError>, id: &str, pool: &PoolConfig) {
    if pool.ceiling == 0 || pool.min_size > pool.max_size || pool.max_size > pool.ceiling {
        errors.push(ValidationError::PoolBounds {
            server: id.to_string(),
            min: pool.min_size,
            max: pool.max_size,
            ceiling: pool.ceiling,
        });
    }
    positive_u64(errors, &format!("servers.{}.pool.min_size", id), pool.min_size as u64);
    positive_u64(errors, &format!("servers.{}.pool.max_size", id), pool.max_size as u64);
    positive_u64(errors, &format!("servers.{}.pool.acquire_timeout_ms", id), pool.acquire_timeout_ms);
    positive_u64(errors, &format!("servers.{}.pool.connect_timeout_ms", id), pool.connect_timeout_ms);
    positive_u64(errors, &format!("servers.{}.pool.unhealthy_after", id), pool.unhealthy_after.into());
    positive_u64(errors, &format!("servers.{}.pool.scale_up_samples", id), pool.scale_up_samples.into());
    positive_u64(errors, &format!("servers.{}.pool.scale_down_samples", id), pool.scale_down_samples.into());
    positive_u64(errors, &format!("servers.{}.pool.history_len", id), pool.history_len as u64);
    ratio(errors, &format!("servers.{}.pool.high_watermark", id), pool.high_watermark);
    ratio(errors, &format!("servers.{}.pool.low_watermark", id), pool.low_watermark);
    if pool.low_watermark >= pool.high_watermark {
        errors.push(ValidationError::Watermarks {
            server: id.to_string(),
            low: pool.low_watermark,
            high: pool.high_watermark,
        });
    }
    if !(pool.scale_factor > 1.0) {
        errors.push(ValidationError::TooSmall {
            field: format!("servers.{}.pool.scale_factor", id),
            min: 1.0,
            value: pool.scale_factor,
        });
    }
}

fn positive_u64(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::NotPositive { field: field.to_string() });
    }
}

fn positive_f64(errors: &mut Vec<ValidationError>, field: &str, value: f64) {
    if !(value > 0.0) || !value.is_finite() {
        errors.push(ValidationError::NotPositive { field: field.to_string() });
    }
}

fn at_least(errors: &mut Vec<ValidationError>, field: &str, min: f64, value: f64) {
    if !(value >= min) || !value.is_finite() {
        errors.push(ValidationError::TooSmall { field: field.to_string(), min, value });
    }
}

fn ratio(errors: &mut Vec<ValidationError>, field: &str, value: f64) {
    if !(value > 0.0 && value <= 1.0) {
        errors.push(ValidationError::OutOfRange {
            field: field.to_string(),
            low: 0.0,
            high: 1.0,
            value,
        });
    }
}
