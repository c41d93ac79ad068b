//! End-to-end engine scenarios on the in-memory store
//!
//! Time is driven by a manual clock; tasks are run by hand so every
//! assertion sees a settled history.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use keel_durable::activity::ActivityOutcome;
use keel_durable::engine::{LifecycleEvent, TaskOutcome};
use keel_durable::HistoryEvent;
use keel_durable::prelude::*;
use keel_durable::workflow::error_codes;

use common::{registry, transfer_input, Harness, QUEUE};

fn debit_ok() -> ActivityRegistry {
    let mut activities = ActivityRegistry::new();
    activities.register_fn("debit", |_ctx, input: Value| async move {
        Ok(json!({ "debited": input["amount"] }))
    });
    activities
}

fn debit_failing() -> ActivityRegistry {
    let mut activities = ActivityRegistry::new();
    activities.register_fn("debit", |_ctx, _input| async move {
        Err(ActivityError::retryable("x"))
    });
    activities
}

fn count(kinds: &[&str], kind: &str) -> usize {
    kinds.iter().filter(|k| **k == kind).count()
}

#[test_log::test(tokio::test)]
async fn test_happy_path_records_five_events() {
    let h = Harness::new(registry(), debit_ok());
    h.engine
        .start("transfer", transfer_input(40, 3), "tx-1")
        .await
        .unwrap();

    h.drain().await;

    assert_eq!(
        h.kinds("tx-1").await,
        [
            "execution_started",
            "workflow_task_scheduled",
            "activity_scheduled",
            "activity_completed",
            "execution_completed",
        ]
    );
    assert_eq!(
        h.engine.get_result("tx-1").await.unwrap(),
        ExecutionOutcome::Completed(json!({ "debited": 40 }))
    );
    assert_eq!(
        h.engine.describe("tx-1").await.unwrap().status,
        ExecutionStatus::Completed
    );
}

#[test_log::test(tokio::test)]
async fn test_activity_exhausts_retries() {
    let h = Harness::new(registry(), debit_failing());
    h.engine
        .start("transfer", transfer_input(40, 3), "tx-1")
        .await
        .unwrap();

    h.drain().await;
    for _ in 0..2 {
        assert_eq!(h.advance(Duration::from_secs(10)).await, 1);
        h.drain().await;
    }

    let kinds = h.kinds("tx-1").await;
    assert_eq!(count(&kinds, "activity_started"), 3);
    assert_eq!(count(&kinds, "activity_attempt_failed"), 3);
    assert_eq!(count(&kinds, "activity_failed"), 1);
    assert_eq!(kinds.last(), Some(&"execution_failed"));

    let history = h.engine.history("tx-1").await.unwrap();
    assert!(history.iter().any(|e| matches!(
        e.event,
        WorkflowEvent::ActivityFailed { attempts: 3, .. }
    )));

    match h.engine.get_result("tx-1").await.unwrap() {
        ExecutionOutcome::Failed(error) => {
            assert_eq!(error.code.as_deref(), Some(error_codes::ACTIVITY_FAILED))
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.engine.timer_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_retry_delays_are_recorded() {
    let h = Harness::new(registry(), debit_failing());
    h.engine
        .start("transfer", transfer_input(1, 3), "tx-1")
        .await
        .unwrap();
    h.drain().await;

    let delays: Vec<_> = h
        .engine
        .history("tx-1")
        .await
        .unwrap()
        .into_iter()
        .filter_map(|e| match e.event {
            WorkflowEvent::ActivityAttemptFailed { retry_delay_ms, .. } => Some(retry_delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![Some(1_000)]);

    // nothing is dispatched before the delay has passed
    assert_eq!(h.advance(Duration::from_millis(999)).await, 0);
    assert!(h
        .engine
        .poll_activity_task(QUEUE, Duration::ZERO)
        .await
        .is_none());

    assert_eq!(h.advance(Duration::from_millis(1)).await, 1);
    let task = h
        .engine
        .poll_activity_task(QUEUE, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(task.as_activity().unwrap().attempt, 2);
}

#[test_log::test(tokio::test)]
async fn test_signal_before_timer_cancels_it() {
    let h = Harness::new(registry(), ActivityRegistry::new());
    h.engine.start("approval", Value::Null, "ap-1").await.unwrap();
    h.drain().await;
    assert_eq!(h.engine.timer_count(), 1);

    assert!(h.engine.signal("ap-1", "approve", json!({})).await.unwrap());
    h.drain().await;

    assert_eq!(
        h.engine.get_result("ap-1").await.unwrap(),
        ExecutionOutcome::Completed(json!("approved"))
    );
    assert_eq!(h.engine.timer_count(), 0);
    assert_eq!(h.advance(Duration::from_secs(61)).await, 0);

    let kinds = h.kinds("ap-1").await;
    assert_eq!(count(&kinds, "timer_cancelled"), 1);
    assert_eq!(count(&kinds, "timer_fired"), 0);
}

#[test_log::test(tokio::test)]
async fn test_stale_timer_is_not_fired_after_cancel() {
    let a = Harness::new(registry(), ActivityRegistry::new());
    a.engine.start("approval", Value::Null, "ap-1").await.unwrap();
    a.drain().await;

    // second engine on the same store still holds the deadline in its heap
    let b = Harness::on_store(a.store.clone(), a.clock.clone(), registry(), ActivityRegistry::new());
    b.engine.recover().await.unwrap();
    b.drain().await;
    assert_eq!(b.engine.timer_count(), 1);

    assert!(a.engine.signal("ap-1", "hold", json!({})).await.unwrap());
    a.drain().await;

    a.clock.advance(Duration::from_secs(61));
    assert_eq!(b.engine.fire_due_timers().await, 0);
    assert_eq!(a.engine.fire_due_timers().await, 0);

    assert_eq!(
        a.kinds("ap-1").await,
        [
            "execution_started",
            "workflow_task_scheduled",
            "timer_started",
            "signal_received",
            "timer_cancelled",
        ]
    );
    assert_eq!(
        a.engine.describe("ap-1").await.unwrap().status,
        ExecutionStatus::Running
    );
}

#[test_log::test(tokio::test)]
async fn test_timer_before_signal_wins() {
    let h = Harness::new(registry(), ActivityRegistry::new());
    h.engine.start("approval", Value::Null, "ap-1").await.unwrap();
    h.drain().await;

    assert_eq!(h.advance(Duration::from_secs(60)).await, 1);
    // recorded after the timer, before any workflow task ran
    assert!(h.engine.signal("ap-1", "approve", json!({})).await.unwrap());
    assert_eq!(h.run_workflow_tasks().await, 1);

    assert_eq!(
        h.engine.get_result("ap-1").await.unwrap(),
        ExecutionOutcome::Completed(json!("expired"))
    );
    assert_eq!(
        h.kinds("ap-1").await,
        [
            "execution_started",
            "workflow_task_scheduled",
            "timer_started",
            "timer_fired",
            "signal_received",
            "execution_completed",
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_signal_after_close_is_dropped() {
    let h = Harness::new(registry(), ActivityRegistry::new());
    h.engine.start("approval", Value::Null, "ap-1").await.unwrap();
    h.drain().await;
    h.advance(Duration::from_secs(60)).await;
    h.drain().await;

    let before = h.kinds("ap-1").await.len();
    assert!(!h.engine.signal("ap-1", "approve", json!({})).await.unwrap());
    assert_eq!(h.kinds("ap-1").await.len(), before);
}

#[test_log::test(tokio::test)]
async fn test_continue_as_new_chains_runs() {
    let h = Harness::new(registry(), ActivityRegistry::new());
    let first = h
        .engine
        .start("counter", json!({ "count": 0, "limit": 2 }), "ctr-1")
        .await
        .unwrap();

    h.drain().await;
    for _ in 0..2 {
        h.advance(Duration::from_secs(1)).await;
        h.drain().await;
    }

    assert_eq!(
        h.engine.get_result("ctr-1").await.unwrap(),
        ExecutionOutcome::Completed(json!(2))
    );

    let first_history = h.engine.run_history(first).await.unwrap();
    let Some(WorkflowEvent::ExecutionContinuedAsNew { new_run_id, .. }) =
        first_history.last().map(|e| &e.event)
    else {
        panic!("first run did not continue as new");
    };

    let current = h.engine.describe("ctr-1").await.unwrap();
    assert_ne!(current.run_id, first);
    assert_ne!(current.run_id, *new_run_id);

    let second_history = h.engine.run_history(*new_run_id).await.unwrap();
    assert!(matches!(
        &second_history[0].event,
        WorkflowEvent::ExecutionStarted { continued_from: Some(from), input, .. }
            if *from == first && input["count"] == 1
    ));
}

#[test_log::test(tokio::test)]
async fn test_cancel_retires_running_activity() {
    let h = Harness::new(registry(), debit_ok());
    h.engine
        .start("transfer", transfer_input(5, 3), "tx-1")
        .await
        .unwrap();
    h.run_workflow_tasks().await;

    let task = h
        .engine
        .poll_activity_task(QUEUE, Duration::ZERO)
        .await
        .unwrap();
    let token = h.engine.cancellation_token(&task);
    assert!(!token.is_cancelled());

    assert!(h.engine.cancel("tx-1", "customer request").await.unwrap());
    h.run_workflow_tasks().await;

    assert!(token.is_cancelled());
    assert_eq!(
        h.engine.get_result("tx-1").await.unwrap(),
        ExecutionOutcome::Cancelled {
            reason: "customer request".into()
        }
    );

    let late = h
        .engine
        .complete_task(task.id, TaskOutcome::Activity(ActivityOutcome::Completed(json!(1))))
        .await;
    assert!(matches!(late, Err(EngineError::TaskNotFound(_))));
    assert_eq!(count(&h.kinds("tx-1").await, "activity_completed"), 0);
}

#[test_log::test(tokio::test)]
async fn test_missed_heartbeats_fail_the_attempt() {
    let h = Harness::new(registry(), debit_ok());
    h.engine
        .start(
            "transfer",
            json!({ "amount": 9, "max_attempts": 2, "heartbeat_ms": 5000 }),
            "tx-1",
        )
        .await
        .unwrap();
    h.run_workflow_tasks().await;

    let first = h
        .engine
        .poll_activity_task(QUEUE, Duration::ZERO)
        .await
        .unwrap();
    h.clock.advance(Duration::from_secs(3));
    h.engine.heartbeat(first.id, Some(json!({ "pct": 10 }))).unwrap();
    h.clock.advance(Duration::from_secs(4));
    assert_eq!(h.engine.check_timeouts().await, 0);

    h.clock.advance(Duration::from_secs(2));
    assert_eq!(h.engine.check_timeouts().await, 1);
    assert!(h.engine.cancellation_token(&first).is_cancelled());

    let history = h.engine.history("tx-1").await.unwrap();
    assert!(history.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ActivityAttemptFailed { attempt: 1, failure, retry_delay_ms: Some(_), .. }
            if failure.timeout_type() == Some(TimeoutType::Heartbeat)
    )));

    assert_eq!(h.advance(Duration::from_secs(1)).await, 1);
    h.drain().await;
    assert_eq!(
        h.engine.get_result("tx-1").await.unwrap(),
        ExecutionOutcome::Completed(json!({ "debited": 9 }))
    );
}

/// Schedules one label print that no worker ever claims
struct Unclaimed {
    retry_secs: u64,
}

impl Workflow for Unclaimed {
    const TYPE: &'static str = "unclaimed";
    type Input = u64;
    type Output = Value;

    fn new(retry_secs: u64) -> Self {
        Self { retry_secs }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowResult {
        let options = ActivityOptions::default()
            .with_retry(RetryPolicy::fixed(Duration::from_secs(self.retry_secs), 0))
            .with_schedule_to_start_timeout(Duration::from_secs(5))
            .with_schedule_to_close_timeout(Duration::from_secs(12));
        Ok(vec![WorkflowAction::schedule_activity_with(
            "label",
            "print_label",
            json!({}),
            options,
        )])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Value,
    ) -> WorkflowResult {
        Ok(vec![WorkflowAction::complete(result)])
    }
}

fn unclaimed_harness() -> Harness {
    let mut workflows = registry();
    workflows.register::<Unclaimed>();
    Harness::new(workflows, ActivityRegistry::new())
}

fn attempt_timeouts(history: &[HistoryEvent]) -> Vec<(Option<TimeoutType>, Option<u64>)> {
    history
        .iter()
        .filter_map(|e| match &e.event {
            WorkflowEvent::ActivityAttemptFailed {
                failure,
                retry_delay_ms,
                ..
            } => Some((failure.timeout_type(), *retry_delay_ms)),
            _ => None,
        })
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_unclaimed_attempts_hit_start_then_close_deadline() {
    let h = unclaimed_harness();
    h.engine.start("unclaimed", json!(1), "lbl-1").await.unwrap();
    assert_eq!(h.run_workflow_tasks().await, 1);

    h.clock.advance(Duration::from_secs(5));
    assert_eq!(h.engine.check_timeouts().await, 0);
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.engine.check_timeouts().await, 1);
    assert!(h
        .engine
        .poll_activity_task(QUEUE, Duration::ZERO)
        .await
        .is_none());

    // retry at t=7 queues attempt two
    assert_eq!(h.advance(Duration::from_secs(1)).await, 1);
    h.clock.advance(Duration::from_secs(5));
    assert_eq!(h.engine.check_timeouts().await, 0);
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.engine.check_timeouts().await, 1);
    assert_eq!(h.run_workflow_tasks().await, 1);

    assert_eq!(
        h.kinds("lbl-1").await,
        vec![
            "execution_started",
            "workflow_task_scheduled",
            "activity_scheduled",
            "activity_attempt_failed",
            "activity_attempt_failed",
            "activity_timed_out",
            "execution_failed",
        ]
    );
    let history = h.engine.history("lbl-1").await.unwrap();
    assert_eq!(
        attempt_timeouts(&history),
        vec![
            (Some(TimeoutType::ScheduleToStart), Some(1_000)),
            (Some(TimeoutType::ScheduleToClose), None),
        ]
    );
    assert!(history.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ActivityTimedOut { timeout_type: TimeoutType::ScheduleToClose, .. }
    )));
    assert_eq!(count(&h.kinds("lbl-1").await, "activity_started"), 0);

    match h.engine.get_result("lbl-1").await.unwrap() {
        ExecutionOutcome::Failed(error) => {
            assert_eq!(error.code.as_deref(), Some(error_codes::ACTIVITY_FAILED))
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(h
        .engine
        .poll_activity_task(QUEUE, Duration::ZERO)
        .await
        .is_none());
}

#[test_log::test(tokio::test)]
async fn test_close_deadline_during_backoff_drops_the_retry() {
    let h = unclaimed_harness();
    h.engine.start("unclaimed", json!(10), "lbl-1").await.unwrap();
    assert_eq!(h.run_workflow_tasks().await, 1);

    h.clock.advance(Duration::from_secs(6));
    assert_eq!(h.engine.check_timeouts().await, 1);
    assert_eq!(h.engine.timer_count(), 1);

    // backing off until t=16 when the close deadline passes at t=12
    assert_eq!(h.advance(Duration::from_secs(7)).await, 0);
    assert_eq!(h.engine.check_timeouts().await, 1);
    assert_eq!(h.engine.timer_count(), 0);
    assert_eq!(h.advance(Duration::from_secs(10)).await, 0);
    assert_eq!(h.run_workflow_tasks().await, 1);

    assert_eq!(
        h.kinds("lbl-1").await,
        vec![
            "execution_started",
            "workflow_task_scheduled",
            "activity_scheduled",
            "activity_attempt_failed",
            "activity_timed_out",
            "execution_failed",
        ]
    );
    let history = h.engine.history("lbl-1").await.unwrap();
    assert_eq!(
        attempt_timeouts(&history),
        vec![(Some(TimeoutType::ScheduleToStart), Some(10_000))]
    );
    assert!(history.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ActivityTimedOut { timeout_type: TimeoutType::ScheduleToClose, .. }
    )));
    assert!(matches!(
        h.engine.get_result("lbl-1").await.unwrap(),
        ExecutionOutcome::Failed(_)
    ));
}

#[test_log::test(tokio::test)]
async fn test_execution_id_reusable_after_close() {
    let h = Harness::new(registry(), debit_ok());
    let first = assert_ok!(h.engine.start("transfer", transfer_input(1, 1), "tx-1").await);
    let err = assert_err!(h.engine.start("transfer", transfer_input(1, 1), "tx-1").await);
    assert!(matches!(err, EngineError::AlreadyStarted(_)));
    h.drain().await;

    let second = assert_ok!(h.engine.start("transfer", transfer_input(2, 1), "tx-1").await);
    assert_ne!(first, second);
    assert_eq!(h.engine.describe("tx-1").await.unwrap().run_id, second);
}

#[test_log::test(tokio::test)]
async fn test_lifecycle_notifications() {
    let h = Harness::new(registry(), debit_ok());
    let mut rx = h.engine.subscribe();

    h.engine
        .start("transfer", transfer_input(1, 1), "tx-1")
        .await
        .unwrap();
    h.drain().await;

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }

    assert!(matches!(
        seen.first(),
        Some(LifecycleEvent::ExecutionStarted { execution_id, .. }) if execution_id == "tx-1"
    ));
    assert!(seen
        .iter()
        .any(|e| matches!(e, LifecycleEvent::TaskScheduled { kind: "activity", .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        LifecycleEvent::ExecutionClosed { status: ExecutionStatus::Completed, .. }
    )));
}

#[test_log::test(tokio::test)]
async fn test_history_limit_fails_execution() {
    let h = Harness::with_config(
        registry(),
        ActivityRegistry::new(),
        EngineConfig::default().with_max_events_per_run(4),
    );
    h.engine.start("approval", Value::Null, "ap-1").await.unwrap();
    h.drain().await;

    h.engine.signal("ap-1", "noise", json!(1)).await.unwrap();
    h.engine.signal("ap-1", "noise", json!(2)).await.unwrap();
    h.drain().await;

    match h.engine.get_result("ap-1").await.unwrap() {
        ExecutionOutcome::Failed(error) => {
            assert_eq!(error.code.as_deref(), Some(error_codes::HISTORY_LIMIT_EXCEEDED))
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_execution_timeout_closes_run() {
    let h = Harness::new(registry(), ActivityRegistry::new());
    h.engine
        .start_with_options(
            "approval",
            Value::Null,
            "ap-1",
            StartOptions::default().with_execution_timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.advance(Duration::from_secs(30)).await, 1);
    assert_eq!(h.engine.get_result("ap-1").await.unwrap(), ExecutionOutcome::TimedOut);
    assert_eq!(h.engine.timer_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_purge_expired_runs() {
    let h = Harness::new(registry(), debit_ok());
    h.engine
        .start("transfer", transfer_input(1, 1), "tx-1")
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.engine.purge_expired().await.unwrap(), 0);
    h.clock.advance(Duration::from_secs(8 * 24 * 60 * 60));
    assert_eq!(h.engine.purge_expired().await.unwrap(), 1);
    assert!(matches!(
        h.engine.describe("tx-1").await,
        Err(EngineError::NotFound(_))
    ));
}
