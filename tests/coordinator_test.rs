//! Integration tests for the single-flight coordinator, with responses fed
//! by hand so every step is deterministic.

mod common;

use common::*;
use thing_jobs::model::{JobId, NextJobExecutionChangedEvent, RejectedError, UpdateJobExecutionResponse};
use thing_jobs::shutdown::ShutdownReason;
use thing_jobs::state::Phase;

fn update_accepted() -> UpdateJobExecutionResponse {
    UpdateJobExecutionResponse::default()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_pending_work_settles_idle() {
    let h = Harness::new();
    assert!(h.coordinator.try_start_next());
    assert!(eventually(WAIT, || h.start_requests() == 1).await);

    h.accept(no_job());
    assert_eq!(h.coordinator.phase(), Phase::Idle);
    assert_eq!(h.coordinator.stats().slots_spawned, 0);
    assert!(h.executor.started().is_empty());
    assert!(!h.shutdown.disconnect_requested());
}

#[tokio::test]
async fn one_job_runs_and_returns_to_idle() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    h.accept(job("j1"));
    assert_eq!(h.coordinator.phase(), Phase::Working);

    assert!(eventually(WAIT, || h.executor.running() == 1).await);
    h.executor.release(1);
    assert!(eventually(WAIT, || h.update_requests("j1") == 1).await);
    // Still working until the service accepts the status update.
    assert_eq!(h.coordinator.phase(), Phase::Working);

    h.coordinator.on_update_accepted(JobId::from("j1"), update_accepted());
    assert_eq!(h.coordinator.phase(), Phase::Idle);
    assert_eq!(h.start_requests(), 1);
    assert_eq!(h.executor.started(), vec![JobId::from("j1")]);
}

#[tokio::test]
async fn event_mid_work_triggers_one_retry() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    h.accept(job("j1"));

    h.coordinator.on_work_available_event();
    assert!(h.coordinator.is_retry_pending());
    assert_eq!(h.coordinator.stats().start_requests, 1);

    h.executor.release(1);
    assert!(eventually(WAIT, || h.update_requests("j1") == 1).await);
    h.coordinator.on_update_accepted(JobId::from("j1"), update_accepted());

    assert_eq!(h.coordinator.phase(), Phase::Starting);
    assert!(!h.coordinator.is_retry_pending());
    assert!(eventually(WAIT, || h.start_requests() == 2).await);
}

#[tokio::test]
async fn three_events_mid_work_coalesce_into_one_retry() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    h.accept(job("j1"));

    for _ in 0..3 {
        h.coordinator.on_work_available_event();
    }
    assert_eq!(h.coordinator.stats().events_coalesced, 2);

    h.executor.release(1);
    assert!(eventually(WAIT, || h.update_requests("j1") == 1).await);
    h.coordinator.on_update_accepted(JobId::from("j1"), update_accepted());

    assert!(eventually(WAIT, || h.start_requests() == 2).await);
    h.accept(no_job());
    assert_eq!(h.coordinator.phase(), Phase::Idle);

    // Nothing else was queued up behind the single retry.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.start_requests(), 2);
    assert_eq!(h.coordinator.stats().start_requests, 2);
}

#[tokio::test]
async fn start_rejection_shuts_down_once() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    let token = h.coordinator.start_tokens().pop().unwrap();
    for _ in 0..2 {
        let mut rejected = RejectedError::new("InvalidRequest", "bad thing name");
        rejected.client_token = Some(token.clone());
        h.coordinator.on_start_rejected(rejected);
    }

    let outcome = h.shutdown.wait_timeout(WAIT).await.unwrap();
    match outcome.reason {
        ShutdownReason::Failed(reason) => assert!(reason.contains("InvalidRequest")),
        other => panic!("expected failure, got {other:?}"),
    }
    let disconnects = h
        .broker
        .journal()
        .iter()
        .filter(|e| matches!(e, thing_jobs::transport::memory::JournalEntry::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn never_more_than_one_slot() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    h.accept(job("j1"));

    // A storm of signals and stray start responses while busy.
    for i in 0..20 {
        h.coordinator.on_work_available_event();
        h.coordinator.on_start_accepted(job(&format!("stray-{i}")));
        assert!(!h.coordinator.try_start_next());
    }
    assert!(eventually(WAIT, || h.executor.running() == 1).await);

    for n in 1..=3 {
        assert!(eventually(WAIT, || h.executor.started().len() == n).await);
        h.executor.release(1);
        let current = h.executor.started().last().cloned().unwrap();
        assert!(eventually(WAIT, || h.update_requests(current.as_str()) == 1).await);
        h.coordinator.on_update_accepted(current, update_accepted());
        assert!(eventually(WAIT, || h.start_requests() == n + 1).await);
        h.coordinator.on_work_available_event();
        h.accept(job(&format!("j{}", n + 1)));
    }

    assert_eq!(h.executor.max_running(), 1);
    assert_eq!(h.coordinator.stats().slots_spawned, 4);
}

#[tokio::test]
async fn next_changed_without_execution_is_ignored() {
    let h = Harness::new();
    h.coordinator
        .on_next_job_execution_changed(NextJobExecutionChangedEvent::default());
    assert_eq!(h.coordinator.phase(), Phase::Idle);
    assert_eq!(h.coordinator.stats().start_requests, 0);

    h.coordinator.on_next_job_execution_changed(NextJobExecutionChangedEvent {
        execution: job("j1").execution,
        timestamp: None,
    });
    assert_eq!(h.coordinator.phase(), Phase::Starting);
}

#[tokio::test]
async fn update_rejection_is_fatal() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    h.accept(job("j1"));
    h.coordinator.on_update_rejected(
        JobId::from("j1"),
        RejectedError::new("VersionMismatch", "stale"),
    );
    let outcome = h.shutdown.wait_timeout(WAIT).await.unwrap();
    assert!(outcome.reason.is_error());

    // No new work is started once shutdown began.
    h.executor.release(1);
    h.coordinator.on_update_accepted(JobId::from("j1"), update_accepted());
    assert!(!h.coordinator.try_start_next());
}

#[tokio::test]
async fn local_failure_shuts_down() {
    use std::sync::Arc;
    use thing_jobs::coordinator::Coordinator;
    use thing_jobs::registry::JobsClient;
    use thing_jobs::shutdown::ShutdownCoordinator;
    use thing_jobs::state::SharedState;
    use thing_jobs::transport::memory::MemoryBroker;

    let broker = MemoryBroker::new();
    let transport = Arc::new(broker.connect(AGENT));
    let state = SharedState::new();
    let shutdown = ShutdownCoordinator::new(state.clone(), Arc::clone(&transport));
    let coordinator = Coordinator::new(
        state,
        JobsClient::new(transport, THING),
        Arc::new(FailingExecutor),
        shutdown.clone(),
    );

    coordinator.try_start_next();
    answer(&coordinator, job("j1"));
    let outcome = shutdown.wait_timeout(WAIT).await.unwrap();
    match outcome.reason {
        ShutdownReason::Failed(reason) => assert!(reason.contains("disk full")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(published(&broker, AGENT, "$aws/things/test-thing/jobs/j1/update"), 0);
}

#[tokio::test]
async fn exit_when_idle_finishes_gracefully() {
    let h = Harness::new();
    h.coordinator.set_exit_when_idle(true);
    h.coordinator.try_start_next();
    h.accept(no_job());

    let outcome = h.shutdown.wait_timeout(WAIT).await.unwrap();
    assert!(matches!(outcome.reason, ShutdownReason::Finished(_)));
}

// ---------------------------------------------------------------------------
// At-least-once and cross-topic delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_answer_to_a_reissued_start_does_not_rerun_the_job() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    h.coordinator.on_connection_resumed(false);
    let tokens = h.coordinator.start_tokens();
    assert_eq!(tokens.len(), 2);

    h.coordinator.on_start_accepted(answering(&tokens[0], job("j1")));
    h.executor.release(1);
    assert!(eventually(WAIT, || h.update_requests("j1") == 1).await);
    h.coordinator.on_update_accepted(JobId::from("j1"), update_accepted());
    assert_eq!(h.coordinator.phase(), Phase::Idle);

    // A new request goes out, then the answer to the re-issued one shows up.
    h.coordinator.on_work_available_event();
    assert_eq!(h.coordinator.phase(), Phase::Starting);
    h.coordinator.on_start_accepted(answering(&tokens[1], job("j1")));
    assert_eq!(h.coordinator.phase(), Phase::Starting);

    // Only the answer to the current request counts.
    h.accept(job("j2"));
    assert!(eventually(WAIT, || h.executor.started().len() == 2).await);
    assert_eq!(h.executor.started(), vec![JobId::from("j1"), JobId::from("j2")]);
    assert_eq!(h.coordinator.stats().slots_spawned, 2);
}

#[tokio::test]
async fn stale_start_rejection_is_not_fatal() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    let stale = h.coordinator.start_tokens().pop().unwrap();
    h.accept(no_job());

    h.coordinator.try_start_next();
    let mut rejected = RejectedError::new("Throttled", "rate exceeded");
    rejected.client_token = Some(stale);
    h.coordinator.on_start_rejected(rejected);

    assert!(!h.shutdown.disconnect_requested());
    assert_eq!(h.coordinator.phase(), Phase::Starting);
}

#[tokio::test]
async fn exit_when_idle_survives_next_changed_arriving_before_update_ack() {
    let h = Harness::new();
    h.coordinator.set_exit_when_idle(true);
    h.coordinator.try_start_next();
    h.accept(job("j1"));
    h.executor.release(1);
    assert!(eventually(WAIT, || h.update_requests("j1") == 1).await);

    // The service announces nothing next before its update ack is delivered.
    h.coordinator
        .on_next_job_execution_changed(NextJobExecutionChangedEvent::default());
    assert!(!h.shutdown.disconnect_requested());
    h.coordinator.on_update_accepted(JobId::from("j1"), update_accepted());

    assert!(eventually(WAIT, || h.start_requests() == 2).await);
    h.accept(no_job());
    let outcome = h.shutdown.wait_timeout(WAIT).await.unwrap();
    assert_eq!(
        outcome.reason,
        ShutdownReason::Finished("no pending jobs remain".into())
    );
}

#[tokio::test]
async fn update_rejection_for_another_job_is_ignored() {
    let h = Harness::new();
    h.coordinator.try_start_next();
    h.accept(job("j1"));
    h.coordinator.on_update_rejected(
        JobId::from("someone-elses-job"),
        RejectedError::new("VersionMismatch", "stale"),
    );
    assert!(!h.shutdown.disconnect_requested());
    assert_eq!(h.coordinator.phase(), Phase::Working);

    h.executor.release(1);
    assert!(eventually(WAIT, || h.update_requests("j1") == 1).await);
    h.coordinator.on_update_accepted(JobId::from("j1"), update_accepted());
    assert_eq!(h.coordinator.phase(), Phase::Idle);
}
