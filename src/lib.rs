//! Keel - a compose lifecycle manager
//!
//! Keel takes multi-container deployment specifications through a guarded
//! lifecycle against an external container engine:
//!
//! - Parsing and generating compose documents
//! - Structural and semantic validation
//! - Content-addressed snapshots for rollback
//! - Structured diffs between deployment specs
//! - Conflict prediction against live host state
//! - Apply / teardown / rollback orchestration
//! - Post-deployment verification checklists

pub mod backup;
pub mod compose;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod lifecycle;
pub mod runtime;
pub mod spec;
pub mod validate;
pub mod verify;

pub use config::ManagerConfig;
pub use error::{EngineError, EngineErrorKind, KeelError, Result};
pub use lifecycle::{Controller, LifecycleResult, LifecycleState, Operation, OperationOutput};
pub use spec::Spec;
