//! The activity contract: one forward/compensate pair within a saga.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure modes of a single activity call.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// The call observed the run's cancellation scope. The engine treats
    /// this as a pause: no state transition is taken and the saga stays
    /// resumable.
    #[error("activity observed cancellation")]
    Cancelled,

    /// Domain failure. A forward failure starts compensation; a compensation
    /// failure is terminal for the saga.
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ActivityError {
    /// Domain failure from a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Domain failure wrapping a source error.
    pub fn from_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True when this is the cancellation marker rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ActivityError::Cancelled)
    }
}

/// A unit of work within a saga: an execute operation and the compensation
/// undoing it, both cancellable.
///
/// Activities are stateless. They operate on the context `C` supplied at
/// build time and shared across all activities of one saga; the engine
/// serializes every activity call of one saga identity, so the `&mut C`
/// access is exclusive for the duration of a call.
///
/// Compensation may be invoked for an activity whose `execute` failed
/// before completing cleanly (rollback starts at the failed index), so
/// `compensate` must tolerate partially applied forward effects.
#[async_trait]
pub trait Activity<C>: Send + Sync + 'static {
    /// Run the forward step.
    ///
    /// Return [`ActivityError::Cancelled`] when `cancel` fires mid-call to
    /// pause the saga without losing progress.
    async fn execute(&self, ctx: &mut C, cancel: &CancellationToken) -> Result<(), ActivityError>;

    /// Undo the forward step.
    async fn compensate(&self, ctx: &mut C, cancel: &CancellationToken)
        -> Result<(), ActivityError>;
}
