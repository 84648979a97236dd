//! Audit trail of a lifecycle operation

use super::state::LifecycleState;
use crate::conflict::ConflictReport;
use crate::diff::DiffResult;
use crate::validate::ValidationReport;
use crate::verify::VerificationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Operations that go through the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Apply,
    Rollback,
    Teardown,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Apply => write!(f, "apply"),
            OperationKind::Rollback => write!(f, "rollback"),
            OperationKind::Teardown => write!(f, "teardown"),
        }
    }
}

/// A state change and when it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: LifecycleState,
    pub at: DateTime<Utc>,
}

/// Everything that happened during one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub id: Uuid,
    pub operation: OperationKind,
    pub project: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub transitions: Vec<Transition>,
    pub validation: Option<ValidationReport>,
    pub snapshot_id: Option<String>,
    pub diff: Option<DiffResult>,
    pub conflicts: Option<ConflictReport>,
    pub verification: Option<VerificationReport>,
    /// Live state may not match any known spec
    pub unrecovered: bool,
    pub error: Option<String>,
    /// What an operator should do next, when recovery failed
    pub guidance: Option<String>,
}

impl AuditTrail {
    pub fn new(operation: OperationKind, project: &str, reason: Option<&str>) -> Self {
        let started_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            operation,
            project: project.to_string(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            started_at,
            finished_at: None,
            reason: reason.map(str::to_string),
            transitions: vec![Transition {
                state: LifecycleState::Idle,
                at: started_at,
            }],
            validation: None,
            snapshot_id: None,
            diff: None,
            conflicts: None,
            verification: None,
            unrecovered: false,
            error: None,
            guidance: None,
        }
    }

    /// Latest recorded state
    pub fn state(&self) -> LifecycleState {
        self.transitions
            .last()
            .map(|t| t.state)
            .unwrap_or(LifecycleState::Idle)
    }

    /// States visited, in order
    pub fn states(&self) -> Vec<LifecycleState> {
        self.transitions.iter().map(|t| t.state).collect()
    }

    pub fn visited(&self, state: LifecycleState) -> bool {
        self.transitions.iter().any(|t| t.state == state)
    }

    pub(crate) fn record(&mut self, state: LifecycleState) {
        self.transitions.push(Transition {
            state,
            at: Utc::now(),
        });
    }

    /// Write the trail to the `keel::audit` log target as JSON
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(target: "keel::audit", "{}", json),
            Err(e) => tracing::warn!("Failed to serialize audit trail {}: {}", self.id, e),
        }
    }
}
