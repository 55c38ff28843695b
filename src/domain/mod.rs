//! Domain models - beacon identity, observations, and engagement events
//!
//! This module contains the canonical data types used throughout the engine:
//! - `BeaconIdentity` - namespace/major/minor key of a physical beacon
//! - `BeaconObservation` - one raw sighting from a region or ranging source
//! - `BeaconState` - registry-owned view of a detected beacon
//! - `LifecycleState` - Idle/Starting/Running/Paused/Failed
//! - `EngagementEvent` - opened/claimed mark awaiting delivery

pub mod engagement;
pub mod types;

// Re-export commonly used types at module level
pub use engagement::{
    Advertisement, DeliveryStatus, EngagementEvent, EngagementKind, EngagementPayload,
};
pub use types::{
    BeaconIdentity, BeaconObservation, BeaconState, ErrorKind, FailureReason, LifecycleState,
    ObservationSource, Proximity,
};
