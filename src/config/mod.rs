//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → Dispatcher keeps it in an ArcSwap
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Dispatcher::reconfigure fans new values into each component
//! ```
//!
//! # Design Decisions
//! - Components never read ambient settings; they receive config structs
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BreakerConfig, GatewayConfig, MaintenanceConfig, ObservabilityConfig, PoolConfig, QueueConfig,
    RateLimitConfig, ServerConfig, TenantConfig,
};
pub use validation::ValidationError;
