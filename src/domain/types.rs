//! Shared types for beacon detection and lifecycle

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Instant;
use uuid::Uuid;

/// Stable key of a physical beacon: namespace UUID, major, minor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BeaconIdentity {
    namespace: String,
    major: u16,
    minor: u16,
}

impl BeaconIdentity {
    /// Build an identity. UUID namespaces are normalized to upper-case hyphenated form.
    pub fn new(namespace: &str, major: u16, minor: u16) -> Self {
        let namespace = match Uuid::parse_str(namespace) {
            Ok(uuid) => uuid.hyphenated().to_string().to_uppercase(),
            Err(_) => namespace.to_string(),
        };
        Self { namespace, major, minor }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }
}

impl std::fmt::Display for BeaconIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.namespace, self.major, self.minor)
    }
}

/// Error parsing the `NAMESPACE-major-minor` string form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid beacon identity: {0}")]
pub struct ParseIdentityError(String);

impl FromStr for BeaconIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split from the right: the namespace itself may contain hyphens
        let mut parts = s.rsplitn(3, '-');
        let minor = parts.next().and_then(|p| p.parse::<u16>().ok());
        let major = parts.next().and_then(|p| p.parse::<u16>().ok());
        let namespace = parts.next().filter(|p| !p.is_empty());

        match (namespace, major, minor) {
            (Some(ns), Some(major), Some(minor)) => Ok(Self::new(ns, major, minor)),
            _ => Err(ParseIdentityError(s.to_string())),
        }
    }
}

impl From<BeaconIdentity> for String {
    fn from(identity: BeaconIdentity) -> Self {
        identity.to_string()
    }
}

impl TryFrom<String> for BeaconIdentity {
    type Error = ParseIdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Coarse distance classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    Immediate,
    Near,
    Far,
    Unknown,
}

impl Proximity {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Proximity::Immediate => "immediate",
            Proximity::Near => "near",
            Proximity::Far => "far",
            Proximity::Unknown => "unknown",
        }
    }

    /// Distance rank (lower is closer); None for Unknown
    #[inline]
    pub fn rank(&self) -> Option<u8> {
        match self {
            Proximity::Immediate => Some(0),
            Proximity::Near => Some(1),
            Proximity::Far => Some(2),
            Proximity::Unknown => None,
        }
    }
}

/// Which hardware path produced a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSource {
    /// Coarse region entry (presence only, no signal strength)
    Region,
    /// Fine ranging sample with signal strength
    Ranging,
}

impl ObservationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationSource::Region => "region",
            ObservationSource::Ranging => "ranging",
        }
    }
}

/// One raw sighting, consumed immediately by the registry
#[derive(Debug, Clone)]
pub struct BeaconObservation {
    pub identity: BeaconIdentity,
    /// Signal strength in dBm; None for region entries, 0 means not measured
    pub rssi: Option<i16>,
    /// Tier as reported by the platform (informational)
    pub reported: Proximity,
    pub observed_at: Instant,
    pub source: ObservationSource,
}

impl BeaconObservation {
    pub fn region(identity: BeaconIdentity, observed_at: Instant) -> Self {
        Self {
            identity,
            rssi: None,
            reported: Proximity::Unknown,
            observed_at,
            source: ObservationSource::Region,
        }
    }

    pub fn ranging(
        identity: BeaconIdentity,
        rssi: i16,
        reported: Proximity,
        observed_at: Instant,
    ) -> Self {
        Self { identity, rssi: Some(rssi), reported, observed_at, source: ObservationSource::Ranging }
    }

    /// Usable signal sample, if any
    #[inline]
    pub fn signal(&self) -> Option<i16> {
        self.rssi.filter(|&r| r != 0)
    }
}

/// Registry-owned state of one detected beacon
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconState {
    pub identity: BeaconIdentity,
    pub proximity: Proximity,
    pub last_seen: Instant,
    /// Recent signal samples, oldest first
    pub samples: VecDeque<i16>,
    pub active: bool,
}

impl BeaconState {
    #[inline]
    pub fn new(identity: BeaconIdentity, seen_at: Instant) -> Self {
        Self {
            identity,
            proximity: Proximity::Unknown,
            last_seen: seen_at,
            samples: VecDeque::new(),
            active: true,
        }
    }

    /// Moving average of the sample ring
    pub fn smoothed_rssi(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i64 = self.samples.iter().map(|&s| s as i64).sum();
        Some(sum as f64 / self.samples.len() as f64)
    }
}

/// Observer-facing failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    HardwareUnavailable,
    NetworkUnavailable,
    DeliveryExhausted,
    InvalidState,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::HardwareUnavailable => "hardware_unavailable",
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::DeliveryExhausted => "delivery_exhausted",
            ErrorKind::InvalidState => "invalid_state",
        }
    }

    /// Whether this kind ends the running session
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::PermissionDenied | ErrorKind::HardwareUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the engine entered Failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub detail: String,
}

/// Engine lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Failed(FailureReason),
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Failed(_) => "failed",
        }
    }
}
