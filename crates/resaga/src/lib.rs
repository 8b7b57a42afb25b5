//! # resaga
//!
//! A resumable saga execution engine: runs an ordered list of activities
//! forward and, on failure, rolls back the completed ones by running their
//! compensations in reverse order.
//!
//! ## Architecture
//!
//! ```text
//! SagaBuilder ── build / build_from / build_attached ──► Saga
//!                                                         │
//!                      ┌──────────────────────────────────┤
//!                      ▼                                  ▼
//!                  Executive ── tick ──► step() ──► SagaState transition
//!                      │                   │              │
//!            StepLockRegistry          Activity       on_transition
//!            (per-identity,         execute/compensate  subscribers
//!             process-wide)          (&mut Context)    (snapshot clone)
//! ```
//!
//! Each tick the [`Executive`] takes the identity's step lock without
//! blocking (skipping the tick when another instance holds it), performs one
//! state-machine transition, and reschedules itself until the step reports
//! the terminal delay.
//!
//! ## Key invariants
//!
//! 1. **One step at a time per identity**: process-wide, even across
//!    independently built instances of the same saga.
//! 2. **Forward in order, compensate in reverse**: rollback starts at the
//!    activity whose execute failed and walks down to the front.
//! 3. **Cancellation pauses, failure compensates**: a cancelled activity
//!    takes no state edge; `start` resumes from recorded progress.
//! 4. **Compensation failure is terminal**: no retries; the saga aborts
//!    with the failure captured in its state.
//! 5. **Subscribers see snapshots**: deep copies the engine never touches
//!    again, delivered synchronously in registration order.
//!
//! ## Example
//!
//! ```ignore
//! use resaga::{async_trait, Activity, ActivityError, CancellationToken, SagaBuilder};
//!
//! struct Reserve;
//!
//! #[async_trait]
//! impl Activity<Order> for Reserve {
//!     async fn execute(&self, order: &mut Order, _cancel: &CancellationToken)
//!         -> Result<(), ActivityError>
//!     {
//!         order.reserve_inventory().await.map_err(|e| ActivityError::from_source("reserve failed", e))
//!     }
//!
//!     async fn compensate(&self, order: &mut Order, _cancel: &CancellationToken)
//!         -> Result<(), ActivityError>
//!     {
//!         order.release_inventory().await.map_err(|e| ActivityError::from_source("release failed", e))
//!     }
//! }
//!
//! let saga = SagaBuilder::new(order)
//!     .activity(Reserve)
//!     .activity(Charge)
//!     .activity(Ship)
//!     .build();
//!
//! saga.on_transition(|state| persist(state));
//! let state = saga.run_to_completion(CancellationToken::new()).await?;
//! ```
//!
//! ## What this is not
//!
//! The engine does not persist state (subscribers receive every snapshot;
//! storage is the caller's), does not coordinate across processes (the
//! identity lock is in-process), and does not retry failed compensations.

mod activity;
mod builder;
mod error;
mod executive;
mod lock;
mod saga;
mod state;

pub use crate::activity::{Activity, ActivityError};
pub use crate::builder::SagaBuilder;
pub use crate::error::SagaError;
pub use crate::executive::{Executive, ExecutiveConfig, StepDelay, StepHandler};
pub use crate::lock::{StepLockGuard, StepLockRegistry};
pub use crate::saga::Saga;
pub use crate::state::{FailurePhase, SagaId, SagaState, SagaStatus, StateCell, StateFailure};

// Re-export the attribute activities are implemented with and the token they
// observe, so callers need no direct dependency for either.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
