//! Infrastructure - configuration, errors, and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Engine configuration (TOML loading, defaults)
//! - `error` - Error types shared across components
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use error::{DeliveryError, EngageError};
pub use metrics::Metrics;
