//! The saga: an ordered activity list driven through a compensating state
//! machine.
//!
//! Forward: `NotStarted -> Executing -> Executed`, one activity per tick.
//! A forward failure captures the error and turns the saga around:
//! `Executing -> Compensating -> Compensated`, compensating in strict reverse
//! order starting at the activity that failed. A compensation failure is
//! terminal: `Compensating -> Aborted`, nothing further is attempted.
//! Cancellation never takes a state edge; it pauses the run, and `start`
//! resumes from the recorded progress.

use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::activity::{Activity, ActivityError};
use crate::error::SagaError;
use crate::executive::{Executive, ExecutiveConfig, StepDelay, StepHandler};
use crate::lock::StepLockRegistry;
use crate::state::{FailurePhase, SagaId, SagaState, SagaStatus, StateCell, StateFailure};

/// How a run came to an end, as seen by `run_to_completion` waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Pending,
    /// The driver drained: terminal status reached or the run paused.
    Drained,
    /// `abort` resolved the run for waiters before the drain finished.
    Forced,
}

/// One `start`'s scope: its cancellation token and completion signals.
struct RunScope {
    cancel: CancellationToken,
    started: Mutex<Option<oneshot::Sender<SagaState>>>,
    end: watch::Sender<RunEnd>,
}

impl RunScope {
    fn new() -> (Arc<Self>, oneshot::Receiver<SagaState>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (end_tx, _) = watch::channel(RunEnd::Pending);
        let scope = Arc::new(Self {
            cancel: CancellationToken::new(),
            started: Mutex::new(Some(started_tx)),
            end: end_tx,
        });
        (scope, started_rx)
    }

    fn is_pending(&self) -> bool {
        *self.end.borrow() == RunEnd::Pending
    }

    /// First end marker wins; `Forced` is never downgraded to `Drained`.
    fn mark_ended(&self, end: RunEnd) {
        self.end.send_modify(|current| {
            if *current == RunEnd::Pending {
                *current = end;
            }
        });
    }

    /// Resolve the started signal for a run halted before its first tick.
    fn resolve_started(&self, state: &StateCell) {
        if let Some(tx) = self.started.lock().unwrap().take() {
            let _ = tx.send(state.snapshot());
        }
    }
}

type Subscriber = Box<dyn Fn(&SagaState) + Send + Sync>;

pub(crate) struct SagaCore<C> {
    state: StateCell,
    activities: Vec<Box<dyn Activity<C>>>,
    context: tokio::sync::Mutex<C>,
    subscribers: Mutex<Vec<Subscriber>>,
    run: Mutex<Option<Arc<RunScope>>>,
    /// Serializes start/stop/abort so run scopes are rebound atomically.
    lifecycle: tokio::sync::Mutex<()>,
}

impl<C: Send + 'static> SagaCore<C> {
    fn current_run(&self) -> Option<Arc<RunScope>> {
        self.run.lock().unwrap().clone()
    }

    /// Apply a transition and hand every subscriber the snapshot clone, in
    /// registration order.
    fn mutate(&self, f: impl FnOnce(&mut SagaState)) {
        let snapshot = self.state.with(|state| {
            f(state);
            state.clone()
        });
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            subscriber(&snapshot);
        }
    }

    /// One state-machine transition. Returns the delay the driver should
    /// honor before the next tick.
    async fn transition(&self, cancel: &CancellationToken) -> StepDelay {
        let (id, status, completed, cursor) = {
            let snapshot = self.state.snapshot();
            (
                snapshot.id,
                snapshot.status,
                snapshot.completed_count,
                snapshot.compensation_cursor,
            )
        };

        match status {
            SagaStatus::NotStarted => {
                tracing::debug!(saga = %id, "executing");
                self.mutate(|state| state.status = SagaStatus::Executing);
                StepDelay::IMMEDIATE
            }

            SagaStatus::Executing if completed >= self.activities.len() => {
                tracing::debug!(saga = %id, activities = completed, "executed");
                self.mutate(|state| state.status = SagaStatus::Executed);
                StepDelay::Never
            }

            SagaStatus::Executing => {
                let result = {
                    let mut ctx = self.context.lock().await;
                    self.activities[completed].execute(&mut ctx, cancel).await
                };
                match result {
                    Ok(()) => {
                        self.mutate(|state| state.completed_count += 1);
                        StepDelay::IMMEDIATE
                    }
                    Err(ActivityError::Cancelled) => {
                        tracing::debug!(saga = %id, activity = completed, "paused mid-execute");
                        StepDelay::Never
                    }
                    Err(err) => {
                        tracing::warn!(saga = %id, activity = completed, error = %err, "activity failed, compensating");
                        self.mutate(|state| {
                            state.failure = Some(StateFailure {
                                message: err.to_string(),
                                phase: FailurePhase::Execute,
                                activity_index: completed,
                            });
                            // Rollback starts at the activity that failed:
                            // its forward effects may be partially applied.
                            state.compensation_cursor = Some(completed as i64);
                            state.status = SagaStatus::Compensating;
                        });
                        StepDelay::IMMEDIATE
                    }
                }
            }

            SagaStatus::Compensating => {
                let Some(cursor) = cursor else {
                    tracing::error!(saga = %id, "compensating without a cursor, halting");
                    return StepDelay::Never;
                };
                if cursor < 0 {
                    tracing::debug!(saga = %id, "compensated");
                    self.mutate(|state| state.status = SagaStatus::Compensated);
                    return StepDelay::Never;
                }
                let index = cursor as usize;
                let result = {
                    let mut ctx = self.context.lock().await;
                    self.activities[index].compensate(&mut ctx, cancel).await
                };
                match result {
                    Ok(()) => {
                        self.mutate(|state| state.compensation_cursor = Some(cursor - 1));
                        StepDelay::IMMEDIATE
                    }
                    Err(ActivityError::Cancelled) => {
                        tracing::debug!(saga = %id, activity = index, "paused mid-compensate");
                        StepDelay::Never
                    }
                    Err(err) => {
                        tracing::error!(saga = %id, activity = index, error = %err, "compensation failed, aborting");
                        self.mutate(|state| {
                            state.failure = Some(StateFailure {
                                message: err.to_string(),
                                phase: FailurePhase::Compensate,
                                activity_index: index,
                            });
                            state.status = SagaStatus::Aborted;
                        });
                        StepDelay::Never
                    }
                }
            }

            SagaStatus::Executed | SagaStatus::Compensated | SagaStatus::Aborted => {
                StepDelay::Never
            }
        }
    }
}

#[async_trait]
impl<C: Send + 'static> StepHandler for SagaCore<C> {
    async fn step(&self) -> StepDelay {
        let Some(scope) = self.current_run() else {
            // A tick with no installed run scope has nothing to drive.
            return StepDelay::Never;
        };

        // A panicking activity is fatal for the run, but the started signal
        // must still resolve or `start` would never return.
        let outcome = AssertUnwindSafe(self.transition(&scope.cancel))
            .catch_unwind()
            .await;
        scope.resolve_started(&self.state);

        match outcome {
            Ok(delay) => {
                if delay == StepDelay::Never {
                    scope.mark_ended(RunEnd::Drained);
                }
                delay
            }
            Err(payload) => resume_unwind(payload),
        }
    }
}

/// A saga instance: activities, context, shared state, and the driver bound
/// to the state's identity.
///
/// Several instances may be attached to the same [`StateCell`]; the identity
/// lock guarantees their steps never overlap, and every step reads the
/// shared record, so progress is never applied twice.
pub struct Saga<C> {
    core: Arc<SagaCore<C>>,
    executive: Executive,
}

impl<C: Send + 'static> Saga<C> {
    pub(crate) fn from_parts(
        state: StateCell,
        activities: Vec<Box<dyn Activity<C>>>,
        context: C,
        config: ExecutiveConfig,
        registry: Arc<StepLockRegistry>,
    ) -> Self {
        let core = Arc::new(SagaCore {
            state,
            activities,
            context: tokio::sync::Mutex::new(context),
            subscribers: Mutex::new(Vec::new()),
            run: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        });
        let handler: Arc<dyn StepHandler> = Arc::clone(&core) as Arc<dyn StepHandler>;
        let executive = Executive::with_registry(core.state.id(), handler, config, registry);
        Self { core, executive }
    }

    pub fn id(&self) -> SagaId {
        self.core.state.id()
    }

    pub fn status(&self) -> SagaStatus {
        self.core.state.status()
    }

    /// Deep copy of the current state, safe to persist.
    pub fn snapshot(&self) -> SagaState {
        self.core.state.snapshot()
    }

    /// The live state storage. Attach another instance to it through
    /// [`crate::SagaBuilder::build_attached`] to drive the same saga from a
    /// second handle.
    pub fn state_cell(&self) -> StateCell {
        self.core.state.clone()
    }

    /// Register a transition subscriber.
    ///
    /// Subscribers run synchronously after every transition, in registration
    /// order, and receive a snapshot clone the engine never mutates again.
    /// A subscriber must not register further subscribers from inside the
    /// callback.
    pub fn on_transition(&self, subscriber: impl Fn(&SagaState) + Send + Sync + 'static) {
        self.core
            .subscribers
            .lock()
            .unwrap()
            .push(Box::new(subscriber));
    }

    /// Begin or resume the saga.
    ///
    /// Resolves with the snapshot taken after the first tick of this run.
    /// Rejected when the saga is terminal or this instance already has an
    /// active run; neither rejection mutates state.
    pub async fn start(&self) -> Result<SagaState, SagaError> {
        let started_rx = {
            let _lifecycle = self.core.lifecycle.lock().await;
            let status = self.core.state.status();
            if status.is_terminal() {
                return Err(SagaError::AlreadyFinished {
                    id: self.id(),
                    status,
                });
            }
            let active = self
                .core
                .current_run()
                .map(|scope| scope.is_pending())
                .unwrap_or(false)
                && self.executive.is_scheduling();
            if active {
                return Err(SagaError::AlreadyRunning { id: self.id() });
            }

            // Wind down any finished scheduling task before rebinding.
            self.executive.stop().await;

            let (scope, started_rx) = RunScope::new();
            *self.core.run.lock().unwrap() = Some(scope);
            self.executive.start(None);
            started_rx
        };

        match started_rx.await {
            Ok(snapshot) => Ok(snapshot),
            // The run was halted before its first tick.
            Err(_) => Ok(self.snapshot()),
        }
    }

    /// Pause the saga.
    ///
    /// Cancels the run's scope; an in-flight activity observing it causes
    /// the step to end the run with no state transition, so `start` resumes
    /// from the recorded progress. Resolves with the snapshot once any
    /// in-flight step has finished.
    pub async fn stop(&self) -> SagaState {
        let _lifecycle = self.core.lifecycle.lock().await;
        if let Some(scope) = self.core.current_run() {
            scope.cancel.cancel();
            self.executive.stop().await;
            scope.resolve_started(&self.core.state);
            scope.mark_ended(RunEnd::Drained);
        }
        self.snapshot()
    }

    /// Stop the saga, resolving `run_to_completion` waiters immediately.
    ///
    /// The forced end is what waiters observe; the stored status still only
    /// reaches [`SagaStatus::Aborted`] through a compensation failure. The
    /// returned snapshot is taken after the in-flight step has drained.
    pub async fn abort(&self) -> SagaState {
        let _lifecycle = self.core.lifecycle.lock().await;
        if let Some(scope) = self.core.current_run() {
            scope.cancel.cancel();
            scope.mark_ended(RunEnd::Forced);
            self.executive.stop().await;
            scope.resolve_started(&self.core.state);
        }
        self.snapshot()
    }

    /// Start the saga and wait for the run to end.
    ///
    /// Outcome mapping: [`SagaStatus::Executed`] is success;
    /// [`SagaStatus::Compensated`] is [`SagaError::RolledBack`];
    /// [`SagaStatus::Aborted`] is [`SagaError::CompensationFailed`]; a run
    /// that ended anywhere else (paused, aborted, or a halted driver) is
    /// [`SagaError::Interrupted`]. When `shutdown` fires the saga is
    /// aborted.
    pub async fn run_to_completion(
        &self,
        shutdown: CancellationToken,
    ) -> Result<SagaState, SagaError> {
        self.start().await?;

        let Some(scope) = self.core.current_run() else {
            return Err(SagaError::Interrupted {
                state: self.snapshot(),
            });
        };
        let mut end_rx = scope.end.subscribe();

        tokio::select! {
            _ = shutdown.cancelled() => {
                self.abort().await;
            }
            _ = async {
                let _ = end_rx.wait_for(|end| *end != RunEnd::Pending).await;
            } => {}
        }

        let state = self.snapshot();
        match state.status {
            SagaStatus::Executed => Ok(state),
            SagaStatus::Compensated => Err(SagaError::RolledBack { state }),
            SagaStatus::Aborted => Err(SagaError::CompensationFailed { state }),
            _ => Err(SagaError::Interrupted { state }),
        }
    }
}

impl<C> std::fmt::Debug for Saga<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("id", &self.core.state.id())
            .field("status", &self.core.state.status())
            .field("activities", &self.core.activities.len())
            .finish()
    }
}
