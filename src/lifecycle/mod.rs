//! Guarded deployment lifecycle
//!
//! A [`Controller`] owns the applied spec of one compose project and moves
//! every change through a fixed state machine, recording an [`AuditTrail`]
//! for each operation.

pub mod audit;
pub mod cancel;
pub mod controller;
pub mod operation;
pub mod state;

pub use audit::{AuditTrail, OperationKind, Transition};
pub use cancel::CancelToken;
pub use controller::{Controller, LifecycleResult};
pub use operation::{Operation, OperationOutput};
pub use state::LifecycleState;
