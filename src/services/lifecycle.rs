//! Lifecycle state machine
//!
//! Idle -> Starting -> Running <-> Paused, any -> Failed, Failed -> Starting.
//! Transitions are the only mutation path; the dispatcher applies them on
//! its own sequence so no sighting is handled mid-transition.

use crate::domain::types::{ErrorKind, FailureReason, LifecycleState};
use crate::infra::error::EngageError;
use tracing::info;

/// Result of applying a transition request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Changed { from: LifecycleState, to: LifecycleState },
    Unchanged,
}

impl Transition {
    #[inline]
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Sightings are only accepted while Running
    #[inline]
    pub fn accepts_sightings(&self) -> bool {
        self.state == LifecycleState::Running
    }

    fn set(&mut self, to: LifecycleState) -> Transition {
        let from = std::mem::replace(&mut self.state, to.clone());
        info!(from = %from.as_str(), to = %to.as_str(), "lifecycle_transition");
        Transition::Changed { from, to }
    }

    /// Idle/Failed -> Starting. A duplicate start is a no-op.
    pub fn start(&mut self) -> Transition {
        match self.state {
            LifecycleState::Idle | LifecycleState::Failed(_) => self.set(LifecycleState::Starting),
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Paused => {
                Transition::Unchanged
            }
        }
    }

    /// Starting -> Running once every source reported ready
    pub fn hardware_ready(&mut self) -> Transition {
        match self.state {
            LifecycleState::Starting => self.set(LifecycleState::Running),
            _ => Transition::Unchanged,
        }
    }

    /// Any state -> Failed. The first reason wins until a restart.
    pub fn fail(&mut self, kind: ErrorKind, detail: &str) -> Transition {
        match self.state {
            LifecycleState::Failed(_) => Transition::Unchanged,
            _ => self.set(LifecycleState::Failed(FailureReason { kind, detail: detail.to_string() })),
        }
    }

    /// Running -> Paused
    pub fn pause(&mut self) -> Result<Transition, EngageError> {
        match self.state {
            LifecycleState::Running => Ok(self.set(LifecycleState::Paused)),
            LifecycleState::Paused => Ok(Transition::Unchanged),
            _ => Err(EngageError::InvalidState { state: self.state.as_str() }),
        }
    }

    /// Paused -> Running. Paused is only reachable from Running, so being
    /// Paused implies an earlier successful start.
    pub fn resume(&mut self) -> Result<Transition, EngageError> {
        match self.state {
            LifecycleState::Paused => Ok(self.set(LifecycleState::Running)),
            LifecycleState::Running => Ok(Transition::Unchanged),
            _ => Err(EngageError::InvalidState { state: self.state.as_str() }),
        }
    }
}
