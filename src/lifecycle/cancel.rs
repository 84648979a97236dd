//! Cooperative cancellation for lifecycle operations

use super::state::LifecycleState;
use crate::error::{KeelError, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const OPEN: u8 = 0;
const CANCELLED: u8 = 1;
const COMMITTED: u8 = 2;

/// Shared handle to request cancellation of an operation.
///
/// Cancellation is honoured until the operation commits to mutating the
/// runtime; after that `cancel` is refused.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(OPEN, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(CANCELLED) => Ok(()),
            Err(_) => Err(KeelError::CancellationRefused("applying".to_string())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Mark the point of no return. Fails if cancellation won the race,
    /// naming `during`, the last state the operation reached.
    pub(crate) fn commit(&self, during: LifecycleState) -> Result<()> {
        match self
            .state
            .compare_exchange(OPEN, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(COMMITTED) => Ok(()),
            Err(_) => Err(KeelError::Cancelled(during.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_before_commit() {
        let token = CancelToken::new();
        let handle = token.clone();
        handle.cancel().unwrap();
        assert!(token.is_cancelled());
        match token.commit(LifecycleState::ConflictChecking) {
            Err(KeelError::Cancelled(during)) => assert_eq!(during, "conflict checking"),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_after_commit_is_refused() {
        let token = CancelToken::new();
        token.commit(LifecycleState::Diffing).unwrap();
        assert!(matches!(
            token.clone().cancel(),
            Err(KeelError::CancellationRefused(_))
        ));
        assert!(!token.is_cancelled());
    }
}
