//! Error types for the engagement engine

use crate::domain::types::ErrorKind;
use thiserror::Error;

/// Engine-level error
#[derive(Debug, Error)]
pub enum EngageError {
    #[error("location or radio authorization denied: {0}")]
    PermissionDenied(String),

    #[error("radio or location services unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("backend unreachable: {0}")]
    NetworkUnavailable(String),

    #[error("delivery attempts exhausted for event {event_id} after {attempts} attempts")]
    DeliveryExhausted { event_id: String, attempts: u32 },

    #[error("operation not valid in state {state}")]
    InvalidState { state: &'static str },

    #[error("engine has shut down")]
    ShutDown,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngageError {
    /// Observer-facing classification, if the error has one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngageError::PermissionDenied(_) => Some(ErrorKind::PermissionDenied),
            EngageError::HardwareUnavailable(_) => Some(ErrorKind::HardwareUnavailable),
            EngageError::NetworkUnavailable(_) => Some(ErrorKind::NetworkUnavailable),
            EngageError::DeliveryExhausted { .. } => Some(ErrorKind::DeliveryExhausted),
            EngageError::InvalidState { .. } => Some(ErrorKind::InvalidState),
            EngageError::ShutDown | EngageError::Storage(_) | EngageError::Serialization(_) => None,
        }
    }
}

/// Failure of a single delivery attempt. All variants are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("backend rejected event with status {status}")]
    Rejected { status: u16 },

    #[error("delivery attempt timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, EngageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EngageError::PermissionDenied("denied".into()).kind(),
            Some(ErrorKind::PermissionDenied)
        );
        assert_eq!(
            EngageError::InvalidState { state: "idle" }.kind(),
            Some(ErrorKind::InvalidState)
        );
        assert_eq!(EngageError::ShutDown.kind(), None);
    }

    #[test]
    fn test_display() {
        let err = EngageError::DeliveryExhausted { event_id: "e1".into(), attempts: 8 };
        assert_eq!(
            err.to_string(),
            "delivery attempts exhausted for event e1 after 8 attempts"
        );
        assert_eq!(
            DeliveryError::Rejected { status: 503 }.to_string(),
            "backend rejected event with status 503"
        );
    }
}
