//! IO modules - external system interfaces
//!
//! This module contains everything that crosses the crate boundary:
//! - `sources` - Sensor source contract and the callback handle sources report through
//! - `replay` - JSONL-scripted sensor source for the agent and local testing
//! - `backend` - Engagement sink contract and the HTTP implementation
//! - `store` - Key/value durability for the queue and device identity

pub mod backend;
pub mod replay;
pub mod sources;
pub mod store;

// Re-export commonly used types
pub use backend::{EngagementSink, HttpSink};
pub use replay::ReplaySource;
pub use sources::{SensorSource, SourceHandle};
pub use store::{FileStore, KeyValueStore, MemoryStore};
