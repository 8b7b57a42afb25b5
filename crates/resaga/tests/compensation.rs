//! Rollback: a forward failure compensates completed activities in reverse
//! order starting at the failed index; a compensation failure aborts.

use std::time::Duration;

use resaga::{
    CancellationToken, ExecutiveConfig, FailurePhase, SagaBuilder, SagaError, SagaStatus,
};
use resaga_testing::{CallKind, CallLog, Journal, ScriptedActivity, StepScript, TransitionRecorder};

fn fast() -> ExecutiveConfig {
    ExecutiveConfig::new().with_tick_granularity(Duration::from_millis(1))
}

#[tokio::test]
async fn forward_failure_compensates_in_reverse_from_the_failed_index() {
    let journal = Journal::new();
    let log = CallLog::new();
    let recorder = TransitionRecorder::new();
    let saga = SagaBuilder::new(journal.clone())
        .activity(ScriptedActivity::new("a", log.clone()))
        .activity(
            ScriptedActivity::new("b", log.clone())
                .with_execute(StepScript::Fail("b exploded".to_string())),
        )
        .with_executive_config(fast())
        .build();
    saga.on_transition(recorder.subscriber());

    let err = saga
        .run_to_completion(CancellationToken::new())
        .await
        .expect_err("forward failure rolls back");

    let state = match err {
        SagaError::RolledBack { state } => state,
        other => panic!("expected RolledBack, got {other:?}"),
    };
    assert_eq!(state.status, SagaStatus::Compensated);
    assert_eq!(state.completed_count, 1);
    assert_eq!(state.compensation_cursor, Some(-1));

    let failure = state.failure.expect("captured");
    assert_eq!(failure.phase, FailurePhase::Execute);
    assert_eq!(failure.activity_index, 1);
    assert_eq!(failure.message, "b exploded");

    // The failed activity itself is compensated first: its forward effects
    // may have partially applied.
    assert_eq!(journal.entries(), ["exec:a", "undo:b", "undo:a"]);

    // NotStarted -> Executing, a completes, failure turns the saga around,
    // two compensations, -> Compensated.
    assert_eq!(
        recorder.statuses(),
        [
            SagaStatus::Executing,
            SagaStatus::Executing,
            SagaStatus::Compensating,
            SagaStatus::Compensating,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
        ]
    );
    let cursors: Vec<Option<i64>> = recorder
        .states()
        .iter()
        .map(|s| s.compensation_cursor)
        .collect();
    assert_eq!(cursors, [None, None, Some(1), Some(0), Some(-1), Some(-1)]);
}

#[tokio::test]
async fn failure_in_first_activity_compensates_only_itself() {
    let journal = Journal::new();
    let log = CallLog::new();
    let saga = SagaBuilder::new(journal.clone())
        .activity(
            ScriptedActivity::new("only", log.clone())
                .with_execute(StepScript::Fail("no luck".to_string())),
        )
        .with_executive_config(fast())
        .build();

    let err = saga
        .run_to_completion(CancellationToken::new())
        .await
        .expect_err("rolls back");
    let state = err.state().cloned().expect("outcome carries state");

    assert_eq!(state.status, SagaStatus::Compensated);
    assert_eq!(state.completed_count, 0);
    assert_eq!(journal.entries(), ["undo:only"]);
}

#[tokio::test]
async fn compensation_failure_aborts_and_stops_rolling_back() {
    let journal = Journal::new();
    let log = CallLog::new();
    let saga = SagaBuilder::new(journal.clone())
        .activity(ScriptedActivity::new("a", log.clone()))
        .activity(
            ScriptedActivity::new("b", log.clone())
                .with_compensate(StepScript::Fail("undo b failed".to_string())),
        )
        .activity(
            ScriptedActivity::new("c", log.clone())
                .with_execute(StepScript::Fail("c exploded".to_string())),
        )
        .with_executive_config(fast())
        .build();

    let err = saga
        .run_to_completion(CancellationToken::new())
        .await
        .expect_err("compensation failure aborts");

    let state = match err {
        SagaError::CompensationFailed { state } => state,
        other => panic!("expected CompensationFailed, got {other:?}"),
    };
    assert_eq!(state.status, SagaStatus::Aborted);
    // Rollback stopped at b: a was never compensated.
    assert_eq!(state.compensation_cursor, Some(1));
    assert_eq!(journal.entries(), ["exec:a", "exec:b", "undo:c"]);

    let failure = state.failure.expect("captured");
    assert_eq!(failure.phase, FailurePhase::Compensate);
    assert_eq!(failure.activity_index, 1);
    assert_eq!(failure.message, "undo b failed");

    // c's compensate ran, b's compensate was attempted; a's never was.
    let compensated: Vec<String> = log
        .spans()
        .iter()
        .filter(|s| s.kind == CallKind::Compensate)
        .map(|s| s.name.clone())
        .collect();
    assert_eq!(compensated, ["c", "b"]);
}
