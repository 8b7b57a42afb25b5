//! Assembling sagas.

use std::sync::Arc;

use crate::activity::Activity;
use crate::error::SagaError;
use crate::executive::ExecutiveConfig;
use crate::lock::StepLockRegistry;
use crate::saga::Saga;
use crate::state::{SagaState, SagaStatus, StateCell};

/// Accumulates an ordered activity list over one shared context, then builds
/// a [`Saga`]: fresh, resumed from a persisted snapshot, or attached to
/// another instance's live state.
///
/// Pure assembly: the builder holds no concurrency concerns.
pub struct SagaBuilder<C> {
    context: C,
    activities: Vec<Box<dyn Activity<C>>>,
    config: ExecutiveConfig,
    registry: Arc<StepLockRegistry>,
}

impl<C: Send + 'static> SagaBuilder<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            activities: Vec::new(),
            config: ExecutiveConfig::default(),
            registry: StepLockRegistry::global(),
        }
    }

    /// Append an activity. Activities run forward in insertion order and
    /// compensate in reverse.
    pub fn activity(mut self, activity: impl Activity<C>) -> Self {
        self.activities.push(Box::new(activity));
        self
    }

    pub fn with_executive_config(mut self, config: ExecutiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an injected lock registry instead of the process-wide one.
    pub fn with_lock_registry(mut self, registry: Arc<StepLockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Build a saga over a brand-new state.
    pub fn build(self) -> Saga<C> {
        Saga::from_parts(
            StateCell::new(SagaState::new()),
            self.activities,
            self.context,
            self.config,
            self.registry,
        )
    }

    /// Build a saga resuming from a previously emitted state snapshot.
    ///
    /// The snapshot must fit the activity list: rollback and forward cursors
    /// beyond the list are rejected rather than deferred to a panic at step
    /// time.
    pub fn build_from(self, snapshot: SagaState) -> Result<Saga<C>, SagaError> {
        self.validate(&snapshot)?;
        Ok(Saga::from_parts(
            StateCell::new(snapshot),
            self.activities,
            self.context,
            self.config,
            self.registry,
        ))
    }

    /// Build a second instance over another instance's live state.
    ///
    /// Both instances advance the same record; the identity lock keeps their
    /// steps from ever overlapping. The attached instance must carry the
    /// same activity list as the one it joins.
    pub fn build_attached(self, cell: StateCell) -> Result<Saga<C>, SagaError> {
        self.validate(&cell.snapshot())?;
        Ok(Saga::from_parts(
            cell,
            self.activities,
            self.context,
            self.config,
            self.registry,
        ))
    }

    fn validate(&self, snapshot: &SagaState) -> Result<(), SagaError> {
        let len = self.activities.len();
        if snapshot.completed_count > len {
            return Err(SagaError::CorruptSnapshot {
                id: snapshot.id,
                reason: format!(
                    "completed count {} exceeds {} activities",
                    snapshot.completed_count, len
                ),
            });
        }
        if snapshot.status == SagaStatus::Compensating {
            match snapshot.compensation_cursor {
                None => {
                    return Err(SagaError::CorruptSnapshot {
                        id: snapshot.id,
                        reason: "compensating without a compensation cursor".to_string(),
                    });
                }
                Some(cursor) if cursor < -1 || cursor >= len as i64 => {
                    return Err(SagaError::CorruptSnapshot {
                        id: snapshot.id,
                        reason: format!(
                            "compensation cursor {} out of range for {} activities",
                            cursor, len
                        ),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl<C> std::fmt::Debug for SagaBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaBuilder")
            .field("activities", &self.activities.len())
            .finish()
    }
}
