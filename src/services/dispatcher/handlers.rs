//! Handlers for the Dispatcher
//!
//! Each handler applies one input to the lifecycle and registry and emits
//! the resulting observer notifications. Handlers never block.

use super::{Dispatcher, Sighting};
use crate::domain::types::{BeaconIdentity, ErrorKind, LifecycleState};
use crate::infra::error::EngageError;
use crate::io::sources::SourceHandle;
use crate::services::lifecycle::Transition;
use crate::services::notifier::Notification;
use crate::services::registry::ObserveOutcome;
use std::time::Instant;
use tracing::{debug, info, warn};

impl Dispatcher {
    /// Idle/Failed -> Starting; sources are started and readiness collected
    pub(crate) fn handle_start(&mut self) -> Transition {
        let transition = self.lifecycle.start();
        if !transition.changed() {
            debug!(state = %self.lifecycle.state().as_str(), "start_ignored_already_started");
            return transition;
        }

        self.ready.clear();
        self.start_sources();

        // Nothing to wait for
        if self.sources.is_empty() {
            self.enter_running();
        }
        transition
    }

    pub(crate) fn handle_source_ready(&mut self, source: &'static str) {
        if !self.sources.iter().any(|s| s.name() == source) {
            debug!(source = %source, "ready_from_unknown_source");
            return;
        }
        if !self.ready.contains(&source) {
            self.ready.push(source);
        }
        info!(
            source = %source,
            ready = %self.ready.len(),
            total = %self.sources.len(),
            "source_ready"
        );

        if self.lifecycle.state() == &LifecycleState::Starting && self.ready.len() == self.sources.len() {
            self.enter_running();
        }
    }

    fn enter_running(&mut self) {
        if self.lifecycle.hardware_ready().changed() {
            self.registry.set_accepting(true);
        }
    }

    /// Fatal hardware/permission failure: halt sources and clear the registry
    pub(crate) fn handle_source_failed(&mut self, source: &'static str, kind: ErrorKind, detail: &str) {
        if !kind.is_fatal() {
            warn!(source = %source, kind = %kind, detail = %detail, "source_error_not_fatal");
            return;
        }

        warn!(source = %source, kind = %kind, detail = %detail, "source_failed");
        if !self.lifecycle.fail(kind, detail).changed() {
            return;
        }

        self.registry.set_accepting(false);
        self.ready.clear();
        for source in &self.sources {
            source.stop();
        }

        let discarded = self.inbox.clear();
        if discarded > 0 {
            debug!(discarded = %discarded, "inbox_cleared_on_failure");
        }

        let gone = self.registry.clear();
        self.emit_disappeared(gone);
        self.notifier.notify(Notification::Failure { kind, detail: detail.to_string() });
    }

    /// Running -> Paused. Sources stop; the registry is frozen but retained.
    pub(crate) fn handle_pause(&mut self) -> Result<Transition, EngageError> {
        let transition = self.lifecycle.pause()?;
        if transition.changed() {
            self.registry.set_accepting(false);
            for source in &self.sources {
                source.stop();
            }
        }
        Ok(transition)
    }

    /// Paused -> Running. Retained beacons get a fresh silence window.
    pub(crate) fn handle_resume(&mut self, now: Instant) -> Result<Transition, EngageError> {
        let transition = self.lifecycle.resume()?;
        if transition.changed() {
            self.registry.thaw(now);
            self.registry.set_accepting(true);
            self.start_sources();
        }
        Ok(transition)
    }

    pub(crate) fn handle_sighting(&mut self, sighting: Sighting) {
        if !self.lifecycle.accepts_sightings() {
            self.metrics.record_sighting_rejected();
            debug!(
                beacon = %sighting.identity(),
                state = %self.lifecycle.state().as_str(),
                "sighting_rejected"
            );
            return;
        }

        if self.metrics.debug_mode() {
            info!(sighting = ?sighting, "sighting");
        } else {
            debug!(sighting = ?sighting, "sighting");
        }

        if let Sighting::RegionExit { identity, .. } = &sighting {
            if self.registry.mark_exited(identity) {
                self.dirty = true;
                debug!(beacon = %identity, "beacon_region_exit");
            }
            return;
        }

        let Some(observation) = sighting.into_observation() else {
            return;
        };

        match self.registry.observe(observation) {
            ObserveOutcome::Appeared(state) => {
                self.metrics.record_appeared();
                self.notifier.notify(Notification::Appeared(state));
            }
            ObserveOutcome::Updated(state) => {
                self.metrics.record_updated();
                self.notifier.notify(Notification::Updated(state));
            }
            ObserveOutcome::NoChange => {}
            ObserveOutcome::Rejected => {
                self.metrics.record_sighting_rejected();
                return;
            }
        }
        self.dirty = true;
    }

    pub(crate) fn handle_sweep(&mut self, now: Instant) {
        if !self.lifecycle.accepts_sightings() {
            return;
        }
        let gone = self.registry.sweep(now);
        self.emit_disappeared(gone);
    }

    fn emit_disappeared(&mut self, gone: Vec<BeaconIdentity>) {
        if gone.is_empty() {
            return;
        }
        self.metrics.record_disappeared(gone.len() as u64);
        for identity in gone {
            info!(beacon = %identity, "beacon_disappeared");
            self.notifier.notify(Notification::Disappeared(identity));
        }
        self.dirty = true;
    }

    fn start_sources(&self) {
        for source in &self.sources {
            let handle = SourceHandle::new(source.name(), self.inbox.clone(), self.control_tx.clone());
            info!(source = %source.name(), "source_starting");
            source.start(handle);
        }
    }
}
