//! Trigger reconciliation against a changing definition store.

use cadence::testing::{FlakyStore, RecordingHandler, ScriptedInvoker};
use cadence::{
    DagDefinition, DagExecutor, DagId, Event, EventBus, ExecutionStatus, InMemoryStore, Scheduler,
    SchedulerError, SchedulerHandle, TaskDefinition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::common::{wait_for_finished_runs, wait_for_terminal};

/// Never fires on its own during a test run.
const YEARLY: &str = "0 0 0 1 1 *";

fn dag(id: &str, cron: &str) -> DagDefinition {
    DagDefinition::new(id, id, cron).with_task(TaskDefinition::new(
        format!("{}-task", id),
        "work",
        format!("http://svc/{}", id),
    ))
}

async fn start(
    store: Arc<InMemoryStore>,
    invoker: Arc<ScriptedInvoker>,
) -> (SchedulerHandle, JoinHandle<()>) {
    let executor = DagExecutor::from_parts(invoker, store.clone());
    Scheduler::new(store, executor)
        .with_tick_interval(Duration::from_millis(20))
        .with_refresh_interval(Duration::from_secs(3600))
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let store = Arc::new(InMemoryStore::with_definitions(vec![
        dag("a", YEARLY),
        dag("b", "0 30 * * * *"),
    ]));
    let (handle, _task) = start(store, Arc::new(ScriptedInvoker::new())).await;

    let before = handle.triggers().await.unwrap();
    let first = handle.refresh().await.unwrap();
    let second = handle.refresh().await.unwrap();
    let after = handle.triggers().await.unwrap();

    assert!(!first.has_changes());
    assert!(!second.has_changes());
    assert_eq!(second.unchanged.len(), 2);
    assert_eq!(before.len(), 2);
    assert_eq!(
        before.iter().map(|t| &t.dag_id).collect::<Vec<_>>(),
        after.iter().map(|t| &t.dag_id).collect::<Vec<_>>()
    );
    assert_eq!(before[0].next_fire, after[0].next_fire);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_dag_removed_while_run_finishes() {
    let store = Arc::new(InMemoryStore::with_definitions(vec![
        dag("long", YEARLY),
        dag("other", YEARLY),
    ]));
    let invoker = Arc::new(ScriptedInvoker::new().with_latency(Duration::from_millis(300)));
    let (handle, _task) = start(store.clone(), invoker).await;

    let execution_id = handle.trigger("long").await.unwrap();
    assert!(store.set_enabled(&"long".into(), false));

    let report = handle.refresh().await.unwrap();
    assert_eq!(report.removed, vec![DagId::new("long")]);
    assert_eq!(report.unchanged, vec![DagId::new("other")]);

    let ids: Vec<_> = handle
        .triggers()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.dag_id)
        .collect();
    assert_eq!(ids, vec![DagId::new("other")]);

    // The run started before the refresh is unaffected.
    let finished = wait_for_terminal(&store, &execution_id, Duration::from_secs(5)).await;
    assert_eq!(finished.status, ExecutionStatus::Success);
    assert_eq!(finished.task_executions.len(), 1);

    let result = handle.trigger("long").await;
    assert!(matches!(result, Err(SchedulerError::DagNotFound(_))));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_changed_and_invalid_definitions() {
    let store = Arc::new(InMemoryStore::with_definitions(vec![
        dag("a", YEARLY),
        dag("b", YEARLY),
    ]));
    let (handle, _task) = start(store.clone(), Arc::new(ScriptedInvoker::new())).await;

    store.put_definition(dag("a", "0 15 * * * *"));
    store.put_definition(dag("b", "not a cron"));
    store.put_definition(dag("c", YEARLY));

    let report = handle.refresh().await.unwrap();

    assert_eq!(report.added, vec![DagId::new("c")]);
    assert_eq!(report.updated, vec![DagId::new("a")]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, DagId::new("b"));
    assert!(report.removed.is_empty());

    let triggers = handle.triggers().await.unwrap();
    let cron_of = |id: &str| {
        triggers
            .iter()
            .find(|t| t.dag_id.as_str() == id)
            .map(|t| t.cron.clone())
    };
    assert_eq!(cron_of("a").as_deref(), Some("0 15 * * * *"));
    // Last good version of b is kept.
    assert_eq!(cron_of("b").as_deref(), Some(YEARLY));
    assert_eq!(cron_of("c").as_deref(), Some(YEARLY));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconcile_emits_event_only_on_change() {
    let store = Arc::new(InMemoryStore::with_definitions(vec![dag("a", YEARLY)]));
    let bus = Arc::new(EventBus::new());
    let recorder = Arc::new(RecordingHandler::new());
    bus.register(recorder.clone()).await;

    let executor = DagExecutor::from_parts(Arc::new(ScriptedInvoker::new()), store.clone());
    let (handle, _task) = Scheduler::new(store.clone(), executor)
        .with_event_bus(bus)
        .with_refresh_interval(Duration::from_secs(3600))
        .start()
        .await
        .unwrap();

    handle.refresh().await.unwrap();
    store.put_definition(dag("b", YEARLY));
    handle.refresh().await.unwrap();

    let reconciled: Vec<_> = recorder
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            Event::TriggersReconciled { added, removed, .. } => Some((added, removed)),
            _ => None,
        })
        .collect();

    // Startup adds a, the unchanged refresh is silent, then b is added.
    assert_eq!(reconciled, vec![(1, 0), (1, 0)]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_refresh_keeps_last_known_good() {
    let memory = Arc::new(InMemoryStore::with_definitions(vec![dag("a", YEARLY)]));
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let executor = DagExecutor::from_parts(Arc::new(ScriptedInvoker::new()), memory.clone());

    let (handle, _task) = Scheduler::new(flaky.clone(), executor)
        .with_refresh_interval(Duration::from_secs(3600))
        .start()
        .await
        .unwrap();

    flaky.set_fail_next(1);
    let result = handle.refresh().await;
    assert!(matches!(result, Err(SchedulerError::DefinitionFetch(_))));

    let triggers = handle.triggers().await.unwrap();
    assert_eq!(triggers.len(), 1);

    let execution_id = handle.trigger("a").await.unwrap();
    let finished = wait_for_terminal(&memory, &execution_id, Duration::from_secs(5)).await;
    assert_eq!(finished.status, ExecutionStatus::Success);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_refresh_does_not_delay_fires() {
    let memory = Arc::new(InMemoryStore::with_definitions(vec![dag("pulse", "* * * * * *")]));
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let executor = DagExecutor::from_parts(Arc::new(ScriptedInvoker::new()), memory.clone());

    let (handle, _task) = Scheduler::new(flaky.clone(), executor)
        .with_tick_interval(Duration::from_millis(50))
        .with_refresh_interval(Duration::from_millis(200))
        .start()
        .await
        .unwrap();

    // Every refresh from here on takes longer than the test window.
    flaky.set_fetch_latency(Duration::from_secs(30));
    let pulse = DagId::new("pulse");
    let before = memory.list_dag_executions(&pulse).len();

    let runs = wait_for_finished_runs(&memory, &pulse, before + 4, Duration::from_secs(6)).await;
    assert!(runs.iter().all(|r| r.status == ExecutionStatus::Success));

    let triggers = tokio::time::timeout(Duration::from_millis(500), handle.triggers())
        .await
        .expect("scheduler loop stalled behind the refresh")
        .unwrap();
    assert_eq!(triggers.len(), 1);

    handle.shutdown().await.unwrap();
}
