//! Acquisition cycle state machine.
//!
//! One collection cycle moves STOPPED → COLLECTING → FULL → STOPPED.
//! An in-progress cycle may be abandoned with COLLECTING → STOPPED.

use crate::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// States of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquisitionState {
    /// No collection in progress; outputs idle.
    #[default]
    Stopped,
    /// Device asked to sample; channel frames are being accumulated.
    Collecting,
    /// All data channels received and the device signalled the end of the set.
    Full,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Collecting => write!(f, "COLLECTING"),
            Self::Full => write!(f, "FULL"),
        }
    }
}

impl AcquisitionState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: AcquisitionState) -> bool {
        use AcquisitionState::{Collecting, Full, Stopped};

        matches!(
            (self, target),
            (Stopped, Collecting) | (Collecting, Full) | (Full, Stopped) | (Collecting, Stopped)
        )
    }

    /// Attempt to transition to `target`, returning error if invalid.
    pub fn transition_to(&mut self, target: AcquisitionState) -> AcqResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(AcqError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true while a cycle owns the output image.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}
