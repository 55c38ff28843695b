//! Services - engine state and task orchestration
//!
//! This module contains the core services:
//! - `lifecycle` - Idle/Starting/Running/Paused/Failed state machine
//! - `registry` - Deduplicated detected-beacon set with smoothing and expiry
//! - `dispatcher` - Single serialized sequence over lifecycle and registry
//! - `delivery` - Durable engagement queue and retrying delivery worker
//! - `notifier` - Observer callbacks off the dispatcher path
//! - `manager` - Public facade and process-owned singleton slot

pub mod delivery;
pub mod dispatcher;
pub mod lifecycle;
pub mod manager;
pub mod notifier;
pub mod registry;

// Re-export commonly used types
pub use manager::{EngageManager, ManagerBuilder, ManagerSlot, SDK_VERSION};
pub use notifier::EngageObserver;
pub use registry::DetectedBeacons;
