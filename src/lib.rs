//! Beacon proximity engagement engine
//!
//! Tracks nearby beacons from region and ranging sources, reports proximity
//! changes to an observer, and delivers advertisement engagement events to a
//! backend with durable retry.
//!
//! Module structure:
//! - `domain/` - Core types (identities, observations, engagement events)
//! - `io/` - External interfaces (sensor sources, backend sink, storage)
//! - `services/` - Engine (lifecycle, registry, dispatcher, delivery, facade)
//! - `infra/` - Infrastructure (config, errors, metrics)

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;

pub use services::{EngageManager, EngageObserver, ManagerBuilder, ManagerSlot};
