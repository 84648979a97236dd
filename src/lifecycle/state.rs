//! Lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an operation is in the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Validating,
    BackingUp,
    Diffing,
    ConflictChecking,
    Applying,
    Verifying,
    Succeeded,
    SucceededWithWarnings,
    Failed,
    RolledBack,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Validating => write!(f, "validating"),
            LifecycleState::BackingUp => write!(f, "backing up"),
            LifecycleState::Diffing => write!(f, "diffing"),
            LifecycleState::ConflictChecking => write!(f, "conflict checking"),
            LifecycleState::Applying => write!(f, "applying"),
            LifecycleState::Verifying => write!(f, "verifying"),
            LifecycleState::Succeeded => write!(f, "succeeded"),
            LifecycleState::SucceededWithWarnings => write!(f, "succeeded with warnings"),
            LifecycleState::Failed => write!(f, "failed"),
            LifecycleState::RolledBack => write!(f, "rolled back"),
        }
    }
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Succeeded
                | LifecycleState::SucceededWithWarnings
                | LifecycleState::Failed
                | LifecycleState::RolledBack
        )
    }

    /// Allowed edges of the state machine
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Idle, Validating) => true,
            (Validating, BackingUp) | (Validating, Failed) => true,
            (BackingUp, Diffing) | (BackingUp, Failed) => true,
            (Diffing, ConflictChecking) | (Diffing, Applying) | (Diffing, Failed) => true,
            (ConflictChecking, Applying) | (ConflictChecking, Failed) => true,
            // Teardowns finish straight from Applying
            (Applying, Verifying)
            | (Applying, Succeeded)
            | (Applying, SucceededWithWarnings)
            | (Applying, RolledBack)
            | (Applying, Failed) => true,
            (Verifying, Succeeded) | (Verifying, SucceededWithWarnings) | (Verifying, Failed) => {
                true
            }
            _ => false,
        }
    }
}
