//! Sensor source contract
//!
//! Platform region-monitoring and ranging subsystems live outside this crate.
//! They implement [`SensorSource`] and report through the [`SourceHandle`]
//! they are given on start. Handle methods are cheap, non-blocking, and safe
//! to call from any thread.

use crate::domain::types::{BeaconIdentity, ErrorKind, Proximity};
use crate::services::dispatcher::{Control, Sighting, SightingInbox};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// A start/stoppable hardware event source
pub trait SensorSource: Send + Sync {
    /// Stable name, used to track readiness
    fn name(&self) -> &'static str;

    /// Begin delivering events. Must not block; readiness and failures are
    /// reported through the handle.
    fn start(&self, handle: SourceHandle);

    /// Stop delivering events. Late callbacks after stop are tolerated.
    fn stop(&self);
}

/// Callback endpoint handed to a source
#[derive(Clone)]
pub struct SourceHandle {
    source: &'static str,
    inbox: Arc<SightingInbox>,
    control: mpsc::UnboundedSender<Control>,
}

impl SourceHandle {
    pub(crate) fn new(
        source: &'static str,
        inbox: Arc<SightingInbox>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self { source, inbox, control }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn region_enter(&self, identity: BeaconIdentity) {
        self.inbox.push(Sighting::RegionEnter { identity, at: Instant::now() });
    }

    pub fn region_exit(&self, identity: BeaconIdentity) {
        self.inbox.push(Sighting::RegionExit { identity, at: Instant::now() });
    }

    pub fn ranged(&self, identity: BeaconIdentity, rssi: i16, proximity: Proximity) {
        self.inbox.push(Sighting::Ranged { identity, rssi, proximity, at: Instant::now() });
    }

    /// Hardware powered on and authorized
    pub fn ready(&self) {
        self.send(Control::SourceReady { source: self.source });
    }

    /// Permission or hardware failure; fatal to the running session
    pub fn failed(&self, kind: ErrorKind, detail: impl Into<String>) {
        self.send(Control::SourceFailed { source: self.source, kind, detail: detail.into() });
    }

    fn send(&self, control: Control) {
        if self.control.send(control).is_err() {
            debug!(source = %self.source, "source_signal_after_shutdown");
        }
    }
}
