//! Closed set of operations the controller exposes

use super::controller::LifecycleResult;
use crate::diff::DiffResult;
use crate::spec::Spec;
use crate::validate::ValidationReport;
use serde::{Deserialize, Serialize};

/// A request to the lifecycle controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    /// Parse and validate a raw compose document
    Propose { raw: String },
    /// Drive a spec through the full lifecycle
    Apply {
        spec: Spec,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Re-apply a stored snapshot
    Rollback { snapshot_id: String },
    /// Compare a spec with the applied one without touching anything
    PreviewDiff { spec: Spec },
    /// Remove everything the applied spec created
    Teardown {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// What an [`Operation`] produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "result", rename_all = "snake_case")]
pub enum OperationOutput {
    Propose(ValidationReport),
    Apply(LifecycleResult),
    Rollback(LifecycleResult),
    PreviewDiff(DiffResult),
    Teardown(LifecycleResult),
}

impl OperationOutput {
    /// The lifecycle result, for operations that run the state machine
    pub fn lifecycle(&self) -> Option<&LifecycleResult> {
        match self {
            OperationOutput::Apply(result)
            | OperationOutput::Rollback(result)
            | OperationOutput::Teardown(result) => Some(result),
            OperationOutput::Propose(_) | OperationOutput::PreviewDiff(_) => None,
        }
    }
}
