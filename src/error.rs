//! Error types for Keel

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

/// Keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Compose file parse error: {0}")]
    Parse(String),

    #[error("Schema error in {entity}: {message}")]
    Schema { entity: String, message: String },

    #[error("Unresolved references: {}", missing.join(", "))]
    Reference { missing: Vec<String> },

    #[error("Dependency cycle between services: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error("Validation failed with {0} error(s)")]
    Validation(usize),

    #[error("Blocking conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Verification failed: {0} check(s) failed")]
    Verification(usize),

    #[error("Nothing is applied for project {0}")]
    NothingApplied(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupt(String),

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Another lifecycle operation is in flight for project {0}")]
    OperationInFlight(String),

    #[error("Operation cancelled during {0}")]
    Cancelled(String),

    #[error("Cancellation refused: operation is already {0}")]
    CancellationRefused(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl From<serde_yaml::Error> for KeelError {
    fn from(err: serde_yaml::Error) -> Self {
        KeelError::Yaml(err.to_string())
    }
}

/// Whether an engine failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineErrorKind {
    /// Timeouts, daemon hiccups, lost connections
    Transient,
    /// Malformed image references, invalid compose documents
    Permanent,
}

impl std::fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineErrorKind::Transient => write!(f, "transient"),
            EngineErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure reported by the external container runtime
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} engine error: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == EngineErrorKind::Transient
    }
}
