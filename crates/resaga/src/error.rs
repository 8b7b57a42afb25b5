//! Saga lifecycle errors.

use thiserror::Error;

use crate::state::{SagaId, SagaState, SagaStatus};

/// Errors surfaced by saga lifecycle operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// `start` was called while this instance already has an active run.
    #[error("saga {id} is already running")]
    AlreadyRunning { id: SagaId },

    /// `start` was called on a saga in a terminal status.
    #[error("saga {id} already finished with status {status}")]
    AlreadyFinished { id: SagaId, status: SagaStatus },

    /// A persisted snapshot does not fit the activity list it was loaded
    /// with.
    #[error("snapshot for saga {id} does not match the activity list: {reason}")]
    CorruptSnapshot { id: SagaId, reason: String },

    /// The saga failed forward and every compensation succeeded.
    #[error("saga rolled back after a forward failure")]
    RolledBack { state: SagaState },

    /// A compensation failed during rollback; the saga is aborted where it
    /// stopped.
    #[error("saga aborted: a compensation failed during rollback")]
    CompensationFailed { state: SagaState },

    /// The run ended without reaching a terminal status (stopped, aborted,
    /// or the driver halted).
    #[error("saga run interrupted before reaching a terminal status")]
    Interrupted { state: SagaState },
}

impl SagaError {
    /// The state snapshot carried by outcome errors, if any.
    pub fn state(&self) -> Option<&SagaState> {
        match self {
            SagaError::RolledBack { state }
            | SagaError::CompensationFailed { state }
            | SagaError::Interrupted { state } => Some(state),
            SagaError::AlreadyRunning { .. }
            | SagaError::AlreadyFinished { .. }
            | SagaError::CorruptSnapshot { .. } => None,
        }
    }
}
