//! Common test utilities shared across integration tests.

use cadence::{DagExecution, DagExecutionId, DagId, InMemoryStore};
use std::time::Duration;

/// Wait for a DAG execution to reach a terminal status, polling the store.
///
/// Polls every 10ms.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_terminal(
    store: &InMemoryStore,
    execution_id: &DagExecutionId,
    timeout: Duration,
) -> DagExecution {
    let start = tokio::time::Instant::now();
    loop {
        let current = store.get_dag_execution(execution_id);
        if let Some(execution) = &current {
            if execution.status.is_terminal() {
                return execution.clone();
            }
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for execution {} to finish, current: {:?}",
                execution_id,
                current.map(|e| e.status)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until at least `count` executions of a DAG are terminal.
pub async fn wait_for_finished_runs(
    store: &InMemoryStore,
    dag_id: &DagId,
    count: usize,
    timeout: Duration,
) -> Vec<DagExecution> {
    let start = tokio::time::Instant::now();
    loop {
        let finished: Vec<_> = store
            .list_dag_executions(dag_id)
            .into_iter()
            .filter(|e| e.status.is_terminal())
            .collect();
        if finished.len() >= count {
            return finished;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} finished runs of {}, got {}",
                count,
                dag_id,
                finished.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
