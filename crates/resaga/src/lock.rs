//! Identity-keyed step locks.
//!
//! One lock per saga identity, shared by every driver bound to that identity
//! in this process. Entries are created on first reference and never removed:
//! the map grows with the set of distinct saga identities ever seen, which is
//! the accepted cost of keeping lock handles stable across independently
//! built instances. Bounded in practice by the number of live sagas; a
//! long-lived process churning through many short sagas should expect the
//! registry to grow with them.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::state::SagaId;

/// Guard for one identity's step lock, held across a whole driver tick
/// including the activity await inside it.
pub type StepLockGuard = OwnedMutexGuard<()>;

/// Process-wide arena of per-identity step locks.
#[derive(Debug, Default)]
pub struct StepLockRegistry {
    locks: DashMap<SagaId, Arc<Mutex<()>>>,
}

impl StepLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// The process-wide registry drivers use unless one is injected.
    pub fn global() -> Arc<StepLockRegistry> {
        static GLOBAL: OnceLock<Arc<StepLockRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(StepLockRegistry::new()))
            .clone()
    }

    /// Non-blocking acquire of the lock for `id`.
    ///
    /// Returns `None` when another driver (or another tick) is already
    /// executing a step for this identity.
    pub fn try_acquire(&self, id: &SagaId) -> Option<StepLockGuard> {
        let lock = Arc::clone(self.locks.entry(*id).or_default().value());
        lock.try_lock_owned().ok()
    }

    /// Number of identities this registry has ever seen.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive_per_identity() {
        let registry = StepLockRegistry::new();
        let id = SagaId::new();

        let guard = registry.try_acquire(&id).expect("first acquire");
        assert!(registry.try_acquire(&id).is_none());

        drop(guard);
        assert!(registry.try_acquire(&id).is_some());
    }

    #[test]
    fn test_distinct_identities_do_not_contend() {
        let registry = StepLockRegistry::new();
        let a = SagaId::new();
        let b = SagaId::new();

        let _guard_a = registry.try_acquire(&a).expect("a");
        assert!(registry.try_acquire(&b).is_some());
    }

    #[test]
    fn test_entries_are_never_evicted() {
        let registry = StepLockRegistry::new();
        for _ in 0..10 {
            let id = SagaId::new();
            let guard = registry.try_acquire(&id);
            drop(guard);
        }
        assert_eq!(registry.len(), 10);
    }

    #[test]
    fn test_global_returns_one_registry() {
        let a = StepLockRegistry::global();
        let b = StepLockRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
