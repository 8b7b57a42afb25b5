//! Instrumented activities and recorders for exercising sagas in tests.
//!
//! Everything here is deliberately boring: scripted activities that succeed,
//! fail, sleep, or park on a [`Gate`] until released; a [`CallLog`] that
//! records call spans for overlap assertions; and context types whose
//! effects tests can assert on.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use resaga::{Activity, ActivityError, SagaState, SagaStatus};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Context journaling the effects activities apply, in call order.
///
/// Storage is shared across clones so a test keeps a handle to the journal
/// after moving a clone into the saga.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

/// Which half of an activity a recorded span belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Execute,
    Compensate,
}

/// One recorded activity call.
#[derive(Debug, Clone)]
pub struct CallSpan {
    pub name: String,
    pub kind: CallKind,
    pub started: Instant,
    pub finished: Instant,
}

/// Shared log of activity call spans, for serialization assertions.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    spans: Arc<Mutex<Vec<CallSpan>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str, kind: CallKind, started: Instant) {
        self.spans.lock().unwrap().push(CallSpan {
            name: name.to_string(),
            kind,
            started,
            finished: Instant::now(),
        });
    }

    pub fn spans(&self) -> Vec<CallSpan> {
        self.spans.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.lock().unwrap().is_empty()
    }

    /// Names of recorded calls, in completion order.
    pub fn names(&self) -> Vec<String> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .map(|span| span.name.clone())
            .collect()
    }

    /// The first pair of spans whose intervals overlap, if any.
    ///
    /// Saga steps are serialized by the identity lock, so a well-behaved
    /// engine never produces one.
    pub fn first_overlap(&self) -> Option<(String, String)> {
        let spans = self.spans.lock().unwrap();
        for (i, a) in spans.iter().enumerate() {
            for b in spans.iter().skip(i + 1) {
                if a.started < b.finished && b.started < a.finished {
                    return Some((a.name.clone(), b.name.clone()));
                }
            }
        }
        None
    }
}

struct GateInner {
    entered: watch::Sender<bool>,
    release: watch::Sender<bool>,
}

/// Rendezvous point for blocking activities.
///
/// An activity parked on the gate reports that it entered, then waits until
/// the test opens the gate or the run is cancelled.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (entered, _) = watch::channel(false);
        let (release, _) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner { entered, release }),
        }
    }

    /// Wait until an activity has reached the gate.
    pub async fn entered(&self) {
        let mut rx = self.inner.entered.subscribe();
        let _ = rx.wait_for(|entered| *entered).await;
    }

    /// Let the parked activity finish.
    pub fn open(&self) {
        self.inner.release.send_replace(true);
    }

    async fn pass(&self, cancel: &CancellationToken) -> Result<(), ActivityError> {
        self.inner.entered.send_replace(true);
        let mut rx = self.inner.release.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(ActivityError::Cancelled),
            result = rx.wait_for(|released| *released) => {
                let _ = result;
                Ok(())
            }
        }
    }
}

/// What a scripted call does before reporting its outcome.
#[derive(Clone)]
pub enum StepScript {
    Succeed,
    Fail(String),
    /// Sleep, then succeed. Stretches the call span so overlap checks have
    /// something to bite on.
    Delay(Duration),
    /// Park on the gate until it opens or the run is cancelled.
    Block(Gate),
}

/// An [`Activity`] over [`Journal`] following a per-call script.
///
/// Successful executes journal `exec:<name>`; successful compensates journal
/// `undo:<name>`. Every call is recorded in the [`CallLog`].
pub struct ScriptedActivity {
    name: String,
    log: CallLog,
    on_execute: StepScript,
    on_compensate: StepScript,
}

impl ScriptedActivity {
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            on_execute: StepScript::Succeed,
            on_compensate: StepScript::Succeed,
        }
    }

    pub fn with_execute(mut self, script: StepScript) -> Self {
        self.on_execute = script;
        self
    }

    pub fn with_compensate(mut self, script: StepScript) -> Self {
        self.on_compensate = script;
        self
    }

    async fn run_script(
        &self,
        script: &StepScript,
        cancel: &CancellationToken,
    ) -> Result<(), ActivityError> {
        match script {
            StepScript::Succeed => Ok(()),
            StepScript::Fail(message) => Err(ActivityError::failed(message.clone())),
            StepScript::Delay(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            StepScript::Block(gate) => gate.pass(cancel).await,
        }
    }
}

#[async_trait]
impl Activity<Journal> for ScriptedActivity {
    async fn execute(
        &self,
        ctx: &mut Journal,
        cancel: &CancellationToken,
    ) -> Result<(), ActivityError> {
        let started = Instant::now();
        let result = self.run_script(&self.on_execute, cancel).await;
        if result.is_ok() {
            ctx.push(format!("exec:{}", self.name));
        }
        self.log.record(&self.name, CallKind::Execute, started);
        result
    }

    async fn compensate(
        &self,
        ctx: &mut Journal,
        cancel: &CancellationToken,
    ) -> Result<(), ActivityError> {
        let started = Instant::now();
        let result = self.run_script(&self.on_compensate, cancel).await;
        if result.is_ok() {
            ctx.push(format!("undo:{}", self.name));
        }
        self.log.record(&self.name, CallKind::Compensate, started);
        result
    }
}

/// A counter context safe to hand to several instances of the same saga.
#[derive(Debug, Clone, Default)]
pub struct SharedCounter {
    value: Arc<AtomicU64>,
}

impl SharedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Adds one on execute, takes one back on compensate.
pub struct IncrementActivity;

#[async_trait]
impl Activity<SharedCounter> for IncrementActivity {
    async fn execute(
        &self,
        ctx: &mut SharedCounter,
        _cancel: &CancellationToken,
    ) -> Result<(), ActivityError> {
        ctx.value.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn compensate(
        &self,
        ctx: &mut SharedCounter,
        _cancel: &CancellationToken,
    ) -> Result<(), ActivityError> {
        ctx.value.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects the snapshots a saga hands its transition subscribers.
#[derive(Debug, Clone, Default)]
pub struct TransitionRecorder {
    states: Arc<Mutex<Vec<SagaState>>>,
}

impl TransitionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A subscriber closure to pass to `Saga::on_transition`.
    pub fn subscriber(&self) -> impl Fn(&SagaState) + Send + Sync + 'static {
        let states = Arc::clone(&self.states);
        move |state| states.lock().unwrap().push(state.clone())
    }

    pub fn states(&self) -> Vec<SagaState> {
        self.states.lock().unwrap().clone()
    }

    /// The status sequence observed so far.
    pub fn statuses(&self) -> Vec<SagaStatus> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .map(|state| state.status)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().unwrap().is_empty()
    }
}
