//! Beacon registry: deduplicated set of currently detected beacons
//!
//! - One `BeaconState` per identity, created on first observation
//! - Ranged samples go into a moving-average ring; the tier is recomputed
//!   from the smoothed value with a hysteresis band around each threshold
//! - `sweep` expires beacons that have been silent longer than the timeout,
//!   or that a region source reported as exited

use crate::domain::types::{BeaconIdentity, BeaconObservation, BeaconState, Proximity};
use crate::infra::config::Config;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Read-only view handed to the facade, keyed by identity string
pub type DetectedBeacons = BTreeMap<String, BeaconState>;

/// Signal thresholds with debounce margin
#[derive(Debug, Clone, Copy)]
pub struct TierThresholds {
    pub immediate_rssi: f64,
    pub near_rssi: f64,
    pub hysteresis_db: f64,
}

impl TierThresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            immediate_rssi: config.immediate_rssi() as f64,
            near_rssi: config.near_rssi() as f64,
            hysteresis_db: config.hysteresis_db() as f64,
        }
    }

    /// Raw classification, never Unknown
    pub fn classify(&self, rssi: f64) -> Proximity {
        if rssi >= self.immediate_rssi {
            Proximity::Immediate
        } else if rssi >= self.near_rssi {
            Proximity::Near
        } else {
            Proximity::Far
        }
    }

    /// Next tier given the current one. Leaving a known tier requires the
    /// smoothed value to clear the crossed threshold by the hysteresis margin.
    pub fn debounce(&self, current: Proximity, smoothed: f64) -> Proximity {
        if current.rank().is_none() {
            return self.classify(smoothed);
        }

        let closer = self.classify(smoothed - self.hysteresis_db);
        if closer.rank() < current.rank() {
            return closer;
        }

        let farther = self.classify(smoothed + self.hysteresis_db);
        if farther.rank() > current.rank() {
            return farther;
        }

        current
    }
}

/// Result of one observation
#[derive(Debug, Clone, PartialEq)]
pub enum ObserveOutcome {
    Appeared(BeaconState),
    Updated(BeaconState),
    NoChange,
    /// Registry is frozen (engine not running)
    Rejected,
}

pub struct BeaconRegistry {
    beacons: FxHashMap<BeaconIdentity, BeaconState>,
    thresholds: TierThresholds,
    window: usize,
    silence_timeout: Duration,
    accepting: bool,
}

impl BeaconRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            beacons: FxHashMap::default(),
            thresholds: TierThresholds::from_config(config),
            window: config.smoothing_window(),
            silence_timeout: config.silence_timeout(),
            accepting: false,
        }
    }

    /// Open or freeze the registry; kept in step with the lifecycle
    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }

    pub fn get(&self, identity: &BeaconIdentity) -> Option<&BeaconState> {
        self.beacons.get(identity)
    }

    /// Fold one sighting into the registry
    pub fn observe(&mut self, obs: BeaconObservation) -> ObserveOutcome {
        if !self.accepting {
            return ObserveOutcome::Rejected;
        }

        let signal = obs.signal();
        let window = self.window;
        let thresholds = self.thresholds;

        let Some(state) = self.beacons.get_mut(&obs.identity) else {
            let mut state = BeaconState::new(obs.identity.clone(), obs.observed_at);
            if let Some(rssi) = signal {
                state.samples.push_back(rssi);
                state.proximity = thresholds.classify(rssi as f64);
            }
            debug!(
                beacon = %state.identity,
                source = %obs.source.as_str(),
                proximity = %state.proximity.as_str(),
                "beacon_appeared"
            );
            self.beacons.insert(obs.identity, state.clone());
            return ObserveOutcome::Appeared(state);
        };

        state.last_seen = state.last_seen.max(obs.observed_at);
        state.active = true;

        let Some(rssi) = signal else {
            return ObserveOutcome::NoChange;
        };

        state.samples.push_back(rssi);
        while state.samples.len() > window {
            state.samples.pop_front();
        }

        let Some(smoothed) = state.smoothed_rssi() else {
            return ObserveOutcome::NoChange;
        };
        let next = thresholds.debounce(state.proximity, smoothed);
        if next == state.proximity {
            return ObserveOutcome::NoChange;
        }

        debug!(
            beacon = %state.identity,
            from = %state.proximity.as_str(),
            to = %next.as_str(),
            smoothed_rssi = %format!("{smoothed:.1}"),
            "beacon_tier_changed"
        );
        state.proximity = next;
        ObserveOutcome::Updated(state.clone())
    }

    /// Region exit: the beacon goes on the next sweep unless seen again first
    pub fn mark_exited(&mut self, identity: &BeaconIdentity) -> bool {
        if !self.accepting {
            return false;
        }
        match self.beacons.get_mut(identity) {
            Some(state) => {
                state.active = false;
                true
            }
            None => false,
        }
    }

    /// Remove silent or exited beacons, returning their identities in order
    pub fn sweep(&mut self, now: Instant) -> Vec<BeaconIdentity> {
        let timeout = self.silence_timeout;
        let mut gone = Vec::new();

        self.beacons.retain(|identity, state| {
            let silent = now.saturating_duration_since(state.last_seen) > timeout;
            if silent || !state.active {
                gone.push(identity.clone());
                false
            } else {
                true
            }
        });

        gone.sort();
        gone
    }

    /// Drop everything, returning what was removed
    pub fn clear(&mut self) -> Vec<BeaconIdentity> {
        let mut gone: Vec<BeaconIdentity> = self.beacons.drain().map(|(id, _)| id).collect();
        gone.sort();
        gone
    }

    /// Give every retained beacon a fresh silence window after a pause
    pub fn thaw(&mut self, now: Instant) {
        for state in self.beacons.values_mut() {
            state.last_seen = state.last_seen.max(now);
        }
    }

    pub fn snapshot(&self) -> DetectedBeacons {
        self.beacons.iter().map(|(id, state)| (id.to_string(), state.clone())).collect()
    }
}
