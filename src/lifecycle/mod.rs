//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Dispatcher::shutdown → broadcast → workers, maintenance loops,
//!     limiter sweep and snapshot publisher exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → binary calls Dispatcher::shutdown
//! ```
//!
//! # Design Decisions
//! - Every spawned loop selects on a shutdown receiver; nothing runs on an
//!   ambient timer
//! - Queued requests are answered before pools drain

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
