//! End-to-end DAG execution scenarios.
//!
//! Each test drives a DAG through the executor against the in-memory store
//! and checks what ended up persisted.

use cadence::testing::{FlakyStore, Outcome, RecordingHandler, ScriptedInvoker};
use cadence::{
    DagDefinition, DagExecution, DagExecutor, Event, EventBus, ExecutionError, ExecutionStatus,
    InMemoryStore, Scheduler, TaskDefinition,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::wait_for_finished_runs;

fn executor(invoker: &Arc<ScriptedInvoker>, store: &Arc<InMemoryStore>) -> DagExecutor {
    DagExecutor::from_parts(invoker.clone(), store.clone())
}

fn task(id: &str) -> TaskDefinition {
    TaskDefinition::new(id, id.to_uppercase(), format!("http://svc/{}", id))
}

#[tokio::test]
async fn test_nightly_sync_fails_on_second_task() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.set_default("http://svc/b", Outcome::status(500, "boom"));
    let store = Arc::new(InMemoryStore::new());

    let dag = DagDefinition::new("nightly-sync", "Nightly sync", "0 0 2 * * *")
        .with_task(task("a"))
        .with_task(task("b"));

    let execution = executor(&invoker, &store).run_dag(&dag).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.task_executions.len(), 2);
    assert_eq!(execution.task_executions[0].status, ExecutionStatus::Success);
    assert_eq!(execution.task_executions[1].status, ExecutionStatus::Failed);
    assert_eq!(
        execution.task_executions[1].error.as_deref(),
        Some("boom")
    );
    assert_eq!(
        execution.failing_task_execution_id.as_ref(),
        Some(&execution.task_executions[1].id)
    );

    let stored = store.get_dag_execution(&execution.id).unwrap();
    assert_eq!(stored, execution);
    assert_eq!(store.list_task_executions(&execution.id).len(), 2);
}

#[tokio::test]
async fn test_flaky_task_succeeds_on_third_attempt() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.script(
        "http://svc/flaky",
        vec![
            Outcome::status(503, "unavailable"),
            Outcome::transport("connection reset"),
            Outcome::Success,
        ],
    );
    let store = Arc::new(InMemoryStore::new());

    let dag = DagDefinition::new("flaky", "Flaky", "0 * * * * *")
        .with_task(task("flaky").with_retries(3));

    let execution = executor(&invoker, &store).run_dag(&dag).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.task_executions.len(), 1);
    assert_eq!(execution.task_executions[0].attempts, 3);
    assert_eq!(execution.task_executions[0].status, ExecutionStatus::Success);

    let records = store.list_task_executions(&execution.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 3);
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(invoker.calls("http://svc/flaky"), 3);
}

#[tokio::test]
async fn test_attempts_clamped_at_ten() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.set_default("http://svc/down", Outcome::status(500, "down"));
    let store = Arc::new(InMemoryStore::new());

    let dag = DagDefinition::new("clamped", "Clamped", "0 * * * * *")
        .with_task(task("down").with_retries(50));

    let execution = executor(&invoker, &store).run_dag(&dag).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.task_executions[0].attempts, 10);
    assert_eq!(invoker.calls("http://svc/down"), 10);
    assert_eq!(store.list_task_executions(&execution.id).len(), 1);
}

#[tokio::test]
async fn test_attempt_ceiling_follows_max_retries() {
    for (max_retries, expected) in [(0, 1), (1, 1), (4, 4), (10, 10), (11, 10)] {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.set_default("http://svc/down", Outcome::transport("refused"));
        let store = Arc::new(InMemoryStore::new());

        let dag = DagDefinition::new("ceiling", "Ceiling", "0 * * * * *")
            .with_task(task("down").with_retries(max_retries));

        let execution = executor(&invoker, &store).run_dag(&dag).await.unwrap();
        let record = &execution.task_executions[0];

        assert_eq!(record.attempts, expected, "max_retries = {}", max_retries);
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(store.list_task_executions(&execution.id).len(), 1);
    }
}

#[tokio::test]
async fn test_retry_disabled_ignores_max_retries() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.set_default("http://svc/down", Outcome::status(502, ""));
    let store = Arc::new(InMemoryStore::new());

    let mut down = task("down");
    down.max_retries = 5;
    let dag = DagDefinition::new("no-retry", "No retry", "0 * * * * *").with_task(down);

    let execution = executor(&invoker, &store).run_dag(&dag).await.unwrap();

    assert_eq!(execution.task_executions[0].attempts, 1);
    assert_eq!(
        execution.task_executions[0].error.as_deref(),
        Some("HTTP 502")
    );
}

#[tokio::test]
async fn test_fail_fast_for_every_failing_position() {
    let n = 4;
    for failing in 0..n {
        let invoker = Arc::new(ScriptedInvoker::new());
        let store = Arc::new(InMemoryStore::new());
        let mut dag = DagDefinition::new("chain", "Chain", "0 * * * * *");
        for i in 0..n {
            dag = dag.with_task(task(&format!("t{}", i)));
        }
        invoker.set_default(&format!("http://svc/t{}", failing), Outcome::status(500, "x"));

        let execution = executor(&invoker, &store).run_dag(&dag).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.task_executions.len(), failing + 1);
        assert_eq!(
            execution.failing_task().map(|t| t.task_id.clone()),
            Some(dag.tasks[failing].id.clone())
        );
        for later in failing + 1..n {
            assert_eq!(invoker.calls(&format!("http://svc/t{}", later)), 0);
        }
        assert_eq!(store.list_task_executions(&execution.id).len(), failing + 1);
    }
}

#[tokio::test]
async fn test_events_follow_retry_sequence() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.script("http://svc/a", vec![Outcome::status(500, "x"), Outcome::Success]);
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(EventBus::new());
    let recorder = Arc::new(RecordingHandler::new());
    bus.register(recorder.clone()).await;

    let dag = DagDefinition::new("evented", "Evented", "0 * * * * *")
        .with_task(task("a").with_retries(2));

    executor(&invoker, &store)
        .with_event_bus(bus)
        .run_dag(&dag)
        .await
        .unwrap();

    let kinds: Vec<&str> = recorder
        .events()
        .await
        .iter()
        .map(|e| match e {
            Event::DagStarted { .. } => "dag_started",
            Event::TaskStarted { .. } => "task_started",
            Event::TaskRetrying { .. } => "task_retrying",
            Event::TaskSucceeded { .. } => "task_succeeded",
            Event::TaskFailed { .. } => "task_failed",
            Event::DagCompleted { .. } => "dag_completed",
            _ => "other",
        })
        .collect();

    assert_eq!(
        kinds,
        vec![
            "dag_started",
            "task_started",
            "task_retrying",
            "task_started",
            "task_succeeded",
            "dag_completed",
        ]
    );
}

#[tokio::test]
async fn test_terminal_write_failure_returns_full_record() {
    let memory = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(memory.clone()).fail_terminal_dag_writes());
    let invoker = Arc::new(ScriptedInvoker::new());

    let dag = DagDefinition::new("lost", "Lost", "0 * * * * *")
        .with_task(task("a"))
        .with_task(task("b"));

    let execution = match DagExecutor::from_parts(invoker, flaky).run_dag(&dag).await {
        Err(ExecutionError::Persistence { execution, .. }) => execution,
        other => panic!("expected a persistence error, got {:?}", other),
    };
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.task_executions.len(), 2);

    // The last stored version is the one written before the terminal write.
    let stored = memory.get_dag_execution(&execution.id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.task_executions.len(), 2);
}

#[tokio::test]
async fn test_stored_record_round_trips_through_wire_format() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.set_default("http://svc/b", Outcome::status(500, "boom"));
    let store = Arc::new(InMemoryStore::new());
    let dag = DagDefinition::new("wire", "Wire", "0 * * * * *")
        .with_task(task("a"))
        .with_task(task("b").with_retries(2));

    let execution = executor(&invoker, &store).run_dag(&dag).await.unwrap();

    let json = serde_json::to_string(&execution).unwrap();
    let decoded: DagExecution = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, execution);

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["status"], "failed");
    assert_eq!(value["dag_uuid"], "wire");
    assert_eq!(value["task_executions"][1]["attempts"], 2);
}

#[tokio::test]
async fn test_scheduled_runs_fire_and_finish() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let store = Arc::new(InMemoryStore::with_definitions(vec![
        DagDefinition::new("every-second", "Every second", "* * * * * *").with_task(task("a")),
    ]));

    let scheduler = Scheduler::new(store.clone(), executor(&invoker, &store))
        .with_tick_interval(Duration::from_millis(20))
        .with_refresh_interval(Duration::from_secs(60));
    let (handle, task_handle) = scheduler.start().await.unwrap();

    let runs = wait_for_finished_runs(
        &store,
        &"every-second".into(),
        2,
        Duration::from_secs(5),
    )
    .await;

    assert!(runs.iter().all(|r| r.status == ExecutionStatus::Success));
    let ids: std::collections::HashSet<_> = runs.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids.len(), runs.len());

    handle.shutdown().await.unwrap();
    task_handle.await.unwrap();
}
