//! Saga identity and progress state.
//!
//! [`SagaState`] is the plain, cloneable record a saga advances as it runs
//! and hands to subscribers as snapshot clones after every transition. Two
//! states are equal when their ids are equal; the rest of the record is
//! progress, not identity.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Saga identifier.
///
/// Identity is what ties independently constructed saga instances to the same
/// logical saga: state equality and the step-lock registry both key on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaId(pub Uuid);

impl SagaId {
    /// Generate a new random saga id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Created, no step has run yet.
    NotStarted,
    /// Running activities forward.
    Executing,
    /// All activities completed forward. Terminal.
    Executed,
    /// Rolling back after a forward failure.
    Compensating,
    /// Rollback ran to the front of the list. Terminal.
    Compensated,
    /// A compensation failed; rollback stopped where it was. Terminal.
    Aborted,
}

impl SagaStatus {
    /// Returns true when no further forward or compensating steps occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Executed | SagaStatus::Compensated | SagaStatus::Aborted
        )
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SagaStatus::NotStarted => "not_started",
            SagaStatus::Executing => "executing",
            SagaStatus::Executed => "executed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Phase in which a captured failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Execute,
    Compensate,
}

/// Captured activity failure.
///
/// Stored as plain data so the whole [`SagaState`] round-trips through
/// whatever store the caller persists snapshots in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFailure {
    /// Rendered message of the failing activity error.
    pub message: String,
    /// Whether the failure happened executing forward or compensating.
    pub phase: FailurePhase,
    /// Index of the failing activity in the saga's list.
    pub activity_index: usize,
}

/// Progress record for one saga.
///
/// Mutated only by the owning saga's step logic, under the identity lock.
/// `completed_count` only increases while [`SagaStatus::Executing`];
/// `compensation_cursor` only decreases while [`SagaStatus::Compensating`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaState {
    /// Assigned once at creation, immutable afterwards.
    pub id: SagaId,
    pub status: SagaStatus,
    /// Number of activities successfully executed forward.
    pub completed_count: usize,
    /// Index of the next activity to compensate; -1 once compensation is
    /// done; unset until compensation starts.
    pub compensation_cursor: Option<i64>,
    /// Captured terminal failure, set on the Compensating and Aborted edges.
    pub failure: Option<StateFailure>,
}

impl SagaState {
    /// Fresh state with a generated id.
    pub fn new() -> Self {
        Self::with_id(SagaId::new())
    }

    /// Fresh state with a caller-chosen id.
    pub fn with_id(id: SagaId) -> Self {
        Self {
            id,
            status: SagaStatus::NotStarted,
            completed_count: 0,
            compensation_cursor: None,
            failure: None,
        }
    }
}

impl Default for SagaState {
    fn default() -> Self {
        Self::new()
    }
}

// Value identity: two states describe the same saga iff their ids match.
// This is what lets independently built instances be recognized as the same
// saga for mutual exclusion.
impl PartialEq for SagaState {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SagaState {}

/// Live, shareable storage for one saga's state.
///
/// Every saga instance attached to the same cell observes and advances the
/// same progress record; the identity lock serializes the advancing, so the
/// record is owned exclusively by one instance at a time. Cloning the cell
/// shares storage; [`StateCell::snapshot`] deep-copies the record.
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<Mutex<SagaState>>,
}

impl StateCell {
    pub fn new(state: SagaState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Deep copy of the current record.
    pub fn snapshot(&self) -> SagaState {
        self.inner.lock().unwrap().clone()
    }

    pub fn id(&self) -> SagaId {
        self.inner.lock().unwrap().id
    }

    pub fn status(&self) -> SagaStatus {
        self.inner.lock().unwrap().status
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut SagaState) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(SagaState::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_defaults() {
        let state = SagaState::new();
        assert_eq!(state.status, SagaStatus::NotStarted);
        assert_eq!(state.completed_count, 0);
        assert_eq!(state.compensation_cursor, None);
        assert!(state.failure.is_none());
    }

    #[test]
    fn test_equality_is_identity_not_structure() {
        let a = SagaState::new();
        let mut b = a.clone();
        b.status = SagaStatus::Executing;
        b.completed_count = 7;
        assert_eq!(a, b);

        let c = SagaState::new();
        assert_ne!(a, c);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SagaStatus::NotStarted.is_terminal());
        assert!(!SagaStatus::Executing.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Executed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = SagaState::new();
        state.status = SagaStatus::Compensating;
        state.completed_count = 3;
        state.compensation_cursor = Some(3);
        state.failure = Some(StateFailure {
            message: "disk full".to_string(),
            phase: FailurePhase::Execute,
            activity_index: 3,
        });

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: SagaState = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.id, state.id);
        assert_eq!(decoded.status, SagaStatus::Compensating);
        assert_eq!(decoded.completed_count, 3);
        assert_eq!(decoded.compensation_cursor, Some(3));
        assert_eq!(decoded.failure, state.failure);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let encoded = serde_json::to_string(&SagaStatus::NotStarted).unwrap();
        assert_eq!(encoded, "\"not_started\"");
    }

    #[test]
    fn test_cell_clone_shares_storage() {
        let cell = StateCell::new(SagaState::new());
        let other = cell.clone();

        cell.with(|s| s.completed_count = 5);
        assert_eq!(other.snapshot().completed_count, 5);

        // Snapshots are copies, not views.
        let snapshot = other.snapshot();
        cell.with(|s| s.completed_count = 9);
        assert_eq!(snapshot.completed_count, 5);
    }
}
