//! The execution driver: a self-rescheduling loop bound to one saga identity.
//!
//! The driver knows nothing about saga semantics. It repeatedly invokes an
//! abstract step function, holding the identity's step lock across each
//! invocation, until the step reports the terminal delay or a stop is
//! requested. At most one step per identity runs at a time process-wide,
//! even when several drivers are bound to the same identity: a tick that
//! cannot take the lock is skipped silently and retried.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lock::StepLockRegistry;
use crate::state::SagaId;

/// Delay a step handler requests before its next invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDelay {
    /// Invoke the step again after the given delay. Zero means "as soon as
    /// the tick granularity allows".
    After(Duration),
    /// Terminal: do not invoke the step again for this run.
    Never,
}

impl StepDelay {
    /// Immediate rerun, subject to the driver's tick granularity.
    pub const IMMEDIATE: StepDelay = StepDelay::After(Duration::ZERO);
}

/// The abstract step function the driver schedules.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Perform one step.
    ///
    /// Must not panic: a panic is caught at the tick boundary and is fatal
    /// for the run.
    async fn step(&self) -> StepDelay;
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct ExecutiveConfig {
    /// Minimum delay between consecutive ticks. Applied when a step requests
    /// an immediate rerun and when a tick loses the identity lock, so a
    /// coarse platform timer is never hot-spun.
    pub tick_granularity: Duration,
}

impl Default for ExecutiveConfig {
    fn default() -> Self {
        Self {
            tick_granularity: Duration::from_millis(15),
        }
    }
}

impl ExecutiveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_granularity(mut self, granularity: Duration) -> Self {
        self.tick_granularity = granularity;
        self
    }
}

struct RunTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct DriverShared {
    /// True from the first acquired tick of a run until the run winds down.
    /// Deliberately left true when a step panics: the run is fatally wedged,
    /// not stopped.
    executing: watch::Sender<bool>,
    /// True while a scheduling task is alive.
    scheduling: AtomicBool,
    stopped: Notify,
}

/// Drives repeated invocation of a [`StepHandler`] for one saga identity.
pub struct Executive {
    id: SagaId,
    handler: Arc<dyn StepHandler>,
    registry: Arc<StepLockRegistry>,
    config: ExecutiveConfig,
    shared: Arc<DriverShared>,
    task: Mutex<Option<RunTask>>,
}

impl std::fmt::Debug for Executive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executive")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("scheduling", &self.is_scheduling())
            .field("executing", &self.is_executing())
            .finish()
    }
}

impl Executive {
    /// Driver over the process-wide lock registry.
    pub fn new(id: SagaId, handler: Arc<dyn StepHandler>, config: ExecutiveConfig) -> Self {
        Self::with_registry(id, handler, config, StepLockRegistry::global())
    }

    /// Driver over an injected lock registry.
    pub fn with_registry(
        id: SagaId,
        handler: Arc<dyn StepHandler>,
        config: ExecutiveConfig,
        registry: Arc<StepLockRegistry>,
    ) -> Self {
        let (executing, _) = watch::channel(false);
        Self {
            id,
            handler,
            registry,
            config,
            shared: Arc::new(DriverShared {
                executing,
                scheduling: AtomicBool::new(false),
                stopped: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    /// True while a scheduling task is alive.
    pub fn is_scheduling(&self) -> bool {
        self.shared.scheduling.load(Ordering::SeqCst)
    }

    /// True from the first acquired tick of a run until it winds down.
    pub fn is_executing(&self) -> bool {
        *self.shared.executing.borrow()
    }

    /// Observe executing-state edges: a rising edge when the first tick of a
    /// run acquires the lock, a falling edge when the run winds down.
    pub fn executing_changes(&self) -> watch::Receiver<bool> {
        self.shared.executing.subscribe()
    }

    /// Begin or resume scheduling. Idempotent while a scheduling task is
    /// already alive.
    pub fn start(&self, initial_delay: Option<Duration>) {
        let mut slot = self.task.lock().unwrap();
        if self.shared.scheduling.load(Ordering::SeqCst) {
            return;
        }
        // A previous run may have wound down with its handle still parked
        // here; it is finished, drop it.
        slot.take();

        self.shared.scheduling.store(true, Ordering::SeqCst);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.id,
            Arc::clone(&self.handler),
            Arc::clone(&self.registry),
            self.config.clone(),
            Arc::clone(&self.shared),
            stop.clone(),
            initial_delay,
        ));
        *slot = Some(RunTask { stop, handle });
    }

    /// Halt future scheduling and resolve once any in-flight step finishes.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.stop.cancel();
            let _ = task.handle.await;
            return;
        }
        // Another stop owns the join handle; wait for the loop to wind down.
        while self.shared.scheduling.load(Ordering::SeqCst) {
            let notified = self.shared.stopped.notified();
            if !self.shared.scheduling.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

impl Drop for Executive {
    fn drop(&mut self) {
        // Release the timer task. The identity lock entry is shared and
        // stays in the registry.
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.stop.cancel();
                task.handle.abort();
            }
        }
    }
}

async fn run_loop(
    id: SagaId,
    handler: Arc<dyn StepHandler>,
    registry: Arc<StepLockRegistry>,
    config: ExecutiveConfig,
    shared: Arc<DriverShared>,
    stop: CancellationToken,
    initial_delay: Option<Duration>,
) {
    let mut delay = initial_delay.unwrap_or(Duration::ZERO);
    let clean = loop {
        if !delay.is_zero() {
            tokio::select! {
                _ = stop.cancelled() => break true,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if stop.is_cancelled() {
            break true;
        }

        let Some(guard) = registry.try_acquire(&id) else {
            // Another driver or tick is executing this identity's step.
            tracing::trace!(saga = %id, "tick skipped, identity lock held elsewhere");
            delay = config.tick_granularity;
            continue;
        };

        shared.executing.send_if_modified(|executing| {
            let first = !*executing;
            *executing = true;
            first
        });

        let outcome = AssertUnwindSafe(handler.step()).catch_unwind().await;
        drop(guard);

        match outcome {
            Err(_) => {
                // Fatal for this run: the executing flag intentionally stays
                // set and nothing is rescheduled until `start` is called
                // again.
                tracing::error!(saga = %id, "step handler panicked, scheduling halted");
                break false;
            }
            Ok(StepDelay::Never) => break true,
            Ok(StepDelay::After(next)) => {
                if stop.is_cancelled() {
                    break true;
                }
                delay = if next.is_zero() {
                    config.tick_granularity
                } else {
                    next
                };
            }
        }
    };

    if clean {
        shared.executing.send_if_modified(|executing| {
            let was = *executing;
            *executing = false;
            was
        });
    }
    shared.scheduling.store(false, Ordering::SeqCst);
    shared.stopped.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandler {
        ticks: AtomicUsize,
        stop_after: usize,
    }

    impl CountingHandler {
        fn new(stop_after: usize) -> Self {
            Self {
                ticks: AtomicUsize::new(0),
                stop_after,
            }
        }
    }

    #[async_trait]
    impl StepHandler for CountingHandler {
        async fn step(&self) -> StepDelay {
            let seen = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.stop_after {
                StepDelay::Never
            } else {
                StepDelay::IMMEDIATE
            }
        }
    }

    fn fast_config() -> ExecutiveConfig {
        ExecutiveConfig::new().with_tick_granularity(Duration::from_millis(1))
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ExecutiveConfig::default();
        assert_eq!(config.tick_granularity, Duration::from_millis(15));
    }

    #[test]
    fn test_config_builder() {
        let config = ExecutiveConfig::new().with_tick_granularity(Duration::from_millis(40));
        assert_eq!(config.tick_granularity, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_runs_until_terminal_delay() {
        let handler = Arc::new(CountingHandler::new(5));
        let executive = Executive::with_registry(
            SagaId::new(),
            handler.clone(),
            fast_config(),
            Arc::new(StepLockRegistry::new()),
        );

        executive.start(None);
        wait_until("run to wind down", || {
            handler.ticks.load(Ordering::SeqCst) == 5 && !executive.is_scheduling()
        })
        .await;
        executive.stop().await;

        assert_eq!(handler.ticks.load(Ordering::SeqCst), 5);
        assert!(!executive.is_executing());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_no_op() {
        let executive = Executive::with_registry(
            SagaId::new(),
            Arc::new(CountingHandler::new(1)),
            fast_config(),
            Arc::new(StepLockRegistry::new()),
        );
        executive.stop().await;
        assert!(!executive.is_scheduling());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_scheduling() {
        struct ParkedHandler;

        #[async_trait]
        impl StepHandler for ParkedHandler {
            async fn step(&self) -> StepDelay {
                StepDelay::After(Duration::from_secs(3600))
            }
        }

        let executive = Executive::with_registry(
            SagaId::new(),
            Arc::new(ParkedHandler),
            fast_config(),
            Arc::new(StepLockRegistry::new()),
        );
        executive.start(None);
        executive.start(None);
        executive.start(None);
        assert!(executive.is_scheduling());
        executive.stop().await;
        assert!(!executive.is_scheduling());
    }

    #[tokio::test]
    async fn test_tick_skipped_while_identity_lock_held() {
        let registry = Arc::new(StepLockRegistry::new());
        let id = SagaId::new();
        let handler = Arc::new(CountingHandler::new(1));
        let executive =
            Executive::with_registry(id, handler.clone(), fast_config(), Arc::clone(&registry));

        let guard = registry.try_acquire(&id).expect("hold identity lock");
        executive.start(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handler.ticks.load(Ordering::SeqCst), 0);

        drop(guard);
        wait_until("skipped tick to be retried", || {
            handler.ticks.load(Ordering::SeqCst) == 1 && !executive.is_scheduling()
        })
        .await;
        executive.stop().await;
        assert_eq!(handler.ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_step_halts_scheduling_and_keeps_executing_set() {
        struct PanickingHandler;

        #[async_trait]
        impl StepHandler for PanickingHandler {
            async fn step(&self) -> StepDelay {
                panic!("handler bug");
            }
        }

        let registry = Arc::new(StepLockRegistry::new());
        let id = SagaId::new();
        let executive = Executive::with_registry(
            id,
            Arc::new(PanickingHandler),
            fast_config(),
            Arc::clone(&registry),
        );
        executive.start(None);
        wait_until("panicked loop to halt", || !executive.is_scheduling()).await;
        executive.stop().await;

        assert!(!executive.is_scheduling());
        assert!(executive.is_executing());
        // The identity lock was released on unwind.
        assert!(registry.try_acquire(&id).is_some());
    }
}
