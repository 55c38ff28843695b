//! Engagement events reported to the backend

use crate::domain::types::BeaconIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// An advertisement shown to the user, tied to the beacon that triggered it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: String,
    pub beacon: BeaconIdentity,
}

impl Advertisement {
    pub fn new(id: impl Into<String>, beacon: BeaconIdentity) -> Self {
        Self { id: id.into(), beacon }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementKind {
    Opened,
    Claimed,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::Opened => "opened",
            EngagementKind::Claimed => "claimed",
        }
    }
}

/// Delivery status. Only moves forward, see [`DeliveryStatus::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InFlight => "in_flight",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Pending -> InFlight -> {Delivered | Pending (retry) | DeadLettered}
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight) | (InFlight, Delivered) | (InFlight, Pending) | (InFlight, DeadLettered)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::DeadLettered)
    }
}

/// Rejected status change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from:?} -> {to:?}")]
pub struct StatusTransitionError {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
}

/// One opened/claimed mark awaiting delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub id: String,
    pub kind: EngagementKind,
    pub advertisement_id: String,
    pub beacon: BeaconIdentity,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// API key active when the mark was made
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
    status: DeliveryStatus,
}

impl EngagementEvent {
    pub fn new(
        kind: EngagementKind,
        advertisement: &Advertisement,
        device_id: &str,
        user_id: Option<String>,
        api_key: &str,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            kind,
            advertisement_id: advertisement.id.clone(),
            beacon: advertisement.beacon.clone(),
            device_id: device_id.to_string(),
            user_id,
            api_key: api_key.to_string(),
            created_at: Utc::now(),
            attempts: 0,
            status: DeliveryStatus::Pending,
        }
    }

    #[inline]
    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    /// Advance the status, refusing any backward move
    pub fn advance(&mut self, next: DeliveryStatus) -> Result<(), StatusTransitionError> {
        if !self.status.can_advance_to(next) {
            return Err(StatusTransitionError { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    /// Reset an attempt that was interrupted by a restart
    pub(crate) fn recover_interrupted(&mut self) {
        if self.status == DeliveryStatus::InFlight {
            self.status = DeliveryStatus::Pending;
        }
    }

    /// Events with the same key are delivered strictly in enqueue order
    pub fn ordering_key(&self) -> (&str, &BeaconIdentity) {
        (&self.advertisement_id, &self.beacon)
    }

    pub fn payload(&self, sdk_version: &str) -> EngagementPayload {
        EngagementPayload {
            event_id: self.id.clone(),
            kind: self.kind,
            advertisement_id: self.advertisement_id.clone(),
            beacon: self.beacon.to_string(),
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at.to_rfc3339(),
            attempt: self.attempts + 1,
            sdk_version: sdk_version.to_string(),
        }
    }
}

/// Wire body of one delivery request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementPayload {
    pub event_id: String,
    pub kind: EngagementKind,
    pub advertisement_id: String,
    pub beacon: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: String,
    pub attempt: u32,
    pub sdk_version: String,
}
